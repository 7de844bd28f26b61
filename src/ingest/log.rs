//! Durable log sources
//!
//! `LogSource` is the consumer-group view of the upstream log: poll a message,
//! hand it off, commit its offset. `MemoryLog` is a partitioned in-process log
//! with per-group committed offsets; `JsonLinesLog` replays newline-delimited
//! spans from a file or stdin.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use std::time::{Duration, Instant};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub partition: u32,
    pub offset: u64,
    /// Partitioning key, the trace id for span messages
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

pub trait LogSource: Send {
    /// Next message, or None if nothing arrived within `timeout`
    fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>>;

    /// Mark a message as processed for this consumer group
    fn commit(&mut self, message: &LogMessage) -> Result<()>;

    /// True once the source can never yield another message
    fn is_exhausted(&self) -> bool {
        false
    }
}

struct Record {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct LogState {
    partitions: Vec<Vec<Record>>,
    /// (group, partition) -> next offset to consume
    committed: HashMap<(String, u32), u64>,
}

/// Partitioned in-process log shared between producers and consumers
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<(Mutex<LogState>, Condvar)>,
}

impl MemoryLog {
    pub fn new(num_partitions: u32) -> Self {
        assert!(num_partitions > 0, "log needs at least one partition");
        let state = LogState {
            partitions: (0..num_partitions).map(|_| Vec::new()).collect(),
            committed: HashMap::new(),
        };
        Self {
            inner: Arc::new((Mutex::new(state), Condvar::new())),
        }
    }

    pub fn num_partitions(&self) -> u32 {
        self.inner.0.lock().partitions.len() as u32
    }

    /// Publish keyed by `key`, returns (partition, offset)
    pub fn publish(&self, key: &str, payload: Vec<u8>) -> (u32, u64) {
        let partition = (xxh3_64(key.as_bytes()) % self.num_partitions() as u64) as u32;
        self.publish_to(partition, Some(key.to_string()), payload)
    }

    pub fn publish_to(&self, partition: u32, key: Option<String>, payload: Vec<u8>) -> (u32, u64) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock();
        let records = &mut state.partitions[partition as usize];
        records.push(Record { key, payload });
        let offset = records.len() as u64 - 1;
        cvar.notify_all();
        (partition, offset)
    }

    /// Join `group` consuming every partition from its committed offsets
    pub fn subscribe(&self, group: &str) -> MemoryLogConsumer {
        let partitions: Vec<u32> = (0..self.num_partitions()).collect();
        self.subscribe_partitions(group, &partitions)
    }

    /// Join `group` with an explicit partition assignment
    pub fn subscribe_partitions(&self, group: &str, partitions: &[u32]) -> MemoryLogConsumer {
        let state = self.inner.0.lock();
        let positions = partitions
            .iter()
            .map(|&p| {
                let start = state.committed.get(&(group.to_string(), p)).copied().unwrap_or(0);
                (p, start)
            })
            .collect();

        MemoryLogConsumer {
            log: self.clone(),
            group: group.to_string(),
            positions,
            next: 0,
        }
    }

    pub fn committed_offset(&self, group: &str, partition: u32) -> u64 {
        self.inner
            .0
            .lock()
            .committed
            .get(&(group.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }
}

/// One consumer-group member of a `MemoryLog`
pub struct MemoryLogConsumer {
    log: MemoryLog,
    group: String,
    /// (partition, next offset to read)
    positions: Vec<(u32, u64)>,
    /// round-robin cursor into `positions`
    next: usize,
}

impl MemoryLogConsumer {
    fn try_next(&mut self, state: &LogState) -> Option<LogMessage> {
        let n = self.positions.len();
        for i in 0..n {
            let idx = (self.next + i) % n;
            let (partition, offset) = self.positions[idx];
            if let Some(record) = state.partitions[partition as usize].get(offset as usize) {
                self.positions[idx].1 += 1;
                self.next = (idx + 1) % n;
                return Some(LogMessage {
                    partition,
                    offset,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                });
            }
        }
        None
    }
}

impl LogSource for MemoryLogConsumer {
    fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>> {
        if self.positions.is_empty() {
            std::thread::sleep(timeout);
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        let log = self.log.clone();
        let (lock, cvar) = &*log.inner;
        let mut state = lock.lock();
        loop {
            if let Some(message) = self.try_next(&state) {
                return Ok(Some(message));
            }
            if cvar.wait_until(&mut state, deadline).timed_out() {
                return Ok(self.try_next(&state));
            }
        }
    }

    fn commit(&mut self, message: &LogMessage) -> Result<()> {
        let mut state = self.log.inner.0.lock();
        let entry = state
            .committed
            .entry((self.group.clone(), message.partition))
            .or_insert(0);
        *entry = (*entry).max(message.offset + 1);
        Ok(())
    }
}

/// Newline-delimited JSON spans from any reader. Lines are read on a
/// background thread so `poll` honours its timeout even while the reader
/// blocks, e.g. on stdin. Lines are passed through as raw bytes, a line that
/// is not UTF-8 is rejected by the consumer like any other bad payload.
pub struct JsonLinesLog {
    lines: Receiver<std::io::Result<Vec<u8>>>,
    offset: u64,
    exhausted: bool,
}

impl JsonLinesLog {
    pub fn new<R: BufRead + Send + 'static>(mut reader: R) -> Self {
        let (tx, rx) = bounded(1024);
        let spawned = std::thread::Builder::new()
            .name("json-lines-reader".to_string())
            .spawn(move || loop {
                let mut line = Vec::new();
                let read = match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => Ok(line),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => Err(e),
                };
                let failed = read.is_err();
                if tx.send(read).is_err() || failed {
                    break;
                }
            });
        if let Err(e) = spawned {
            tracing::error!("spawning input reader failed: {}", e);
        }

        Self {
            lines: rx,
            offset: 0,
            exhausted: false,
        }
    }
}

impl LogSource for JsonLinesLog {
    fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.exhausted {
                return Ok(None);
            }
            let line = match self.lines.recv_deadline(deadline) {
                Ok(line) => line?,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    self.exhausted = true;
                    return Ok(None);
                }
            };
            let offset = self.offset;
            self.offset += 1;

            let end = line
                .iter()
                .rposition(|b| !b.is_ascii_whitespace())
                .map_or(0, |i| i + 1);
            if end == 0 {
                continue;
            }
            let mut payload = line;
            payload.truncate(end);
            return Ok(Some(LogMessage {
                partition: 0,
                offset,
                key: None,
                payload,
            }));
        }
    }

    fn commit(&mut self, _message: &LogMessage) -> Result<()> {
        Ok(())
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
