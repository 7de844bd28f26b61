//! Storage stage
//!
//! Complete traces arrive on a bounded intake, pass the tail sampler and
//! accumulate in one batch. The batch is swapped out when it reaches
//! `batch_size` or when the flush timer fires, then handed to a pool of
//! writer threads. Writers insert into the store and spool to disk when
//! the insert fails; a recovery loop replays the spool.

pub mod clickhouse;
pub mod recovery;
pub mod spool;
pub mod store;
pub mod writer;

use crossbeam::channel::{after, bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::metrics;
use crate::model::StorageSpan;
use crate::sampler::TailSampler;
use crate::shutdown::Shutdown;

pub use clickhouse::ClickHouseStore;
pub use recovery::{Recovery, RecoveryReport};
pub use spool::{ClaimedFile, Spool, SpoolReader};
pub use store::{MemoryStore, SpanStore};
pub use writer::SpanWriter;

/// Sending half of the storage intake. `submit` applies backpressure,
/// `offer` sheds the trace when the intake is full.
#[derive(Clone)]
pub struct StorageIntake {
    tx: Sender<Vec<StorageSpan>>,
}

impl StorageIntake {
    pub fn channel(capacity: usize) -> (Self, Receiver<Vec<StorageSpan>>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn submit(&self, spans: Vec<StorageSpan>) -> Result<()> {
        self.tx
            .send(spans)
            .map_err(|_| IngestError::ChannelClosed("storage intake"))
    }

    /// Non-blocking submit, returns false if the trace was shed
    pub fn offer(&self, spans: Vec<StorageSpan>) -> Result<bool> {
        match self.tx.try_send(spans) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(spans)) => {
                debug!(spans = spans.len(), "storage intake full, shedding trace");
                metrics::TRACES_SHED.inc();
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => Err(IngestError::ChannelClosed("storage intake")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub writer_num: usize,
    pub writer_queue_capacity: usize,
    /// None disables the background recovery loop
    pub recovery_interval: Option<Duration>,
}

impl From<&Config> for StorageSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.storage.batch_size,
            flush_interval: config.storage.flush_interval(),
            writer_num: config.storage.writer_num,
            writer_queue_capacity: config.storage.writer_queue_capacity,
            recovery_interval: Some(config.storage.recovery_interval()),
        }
    }
}

/// Sampling and batching in front of the writer pool
pub struct Storage {
    sampler: TailSampler,
    batch: Mutex<Vec<StorageSpan>>,
    batch_size: usize,
    handoff: Sender<Vec<StorageSpan>>,
}

impl Storage {
    pub fn new(sampler: TailSampler, batch_size: usize, handoff: Sender<Vec<StorageSpan>>) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sampler,
            batch: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
            handoff,
        }
    }

    /// Sample one complete trace and append it to the batch. Returns true
    /// when the append filled the batch and triggered a flush.
    pub fn store(&self, spans: Vec<StorageSpan>) -> bool {
        let decision = self.sampler.decide(&spans);
        metrics::TRACES_SAMPLED.with_label_values(&[decision.as_str()]).inc();
        if !decision.is_keep() {
            return false;
        }

        let full = {
            let mut batch = self.batch.lock();
            batch.extend(spans);
            batch.len() >= self.batch_size
        };
        if full {
            self.flush();
        }
        full
    }

    /// Swap the batch out and hand it to a writer. Blocks while the writer
    /// queue is full. Returns the number of spans handed off.
    pub fn flush(&self) -> usize {
        let snapshot = {
            let mut batch = self.batch.lock();
            if batch.is_empty() {
                return 0;
            }
            std::mem::replace(&mut *batch, Vec::with_capacity(self.batch_size))
        };

        let spans = snapshot.len();
        if self.handoff.send(snapshot).is_err() {
            error!(spans, "writer pool gone, batch lost");
            return 0;
        }
        spans
    }

    pub fn batch_len(&self) -> usize {
        self.batch.lock().len()
    }

    /// Intake loop. Flushes on size and on the timer, which restarts after
    /// every flush. Exits with a final flush once the intake disconnects.
    pub fn run(self, intake: Receiver<Vec<StorageSpan>>, flush_interval: Duration) {
        let mut deadline = after(flush_interval);
        loop {
            select! {
                recv(intake) -> msg => match msg {
                    Ok(spans) => {
                        if self.store(spans) {
                            deadline = after(flush_interval);
                        }
                    }
                    Err(_) => break,
                },
                recv(deadline) -> _ => {
                    self.flush();
                    deadline = after(flush_interval);
                }
            }
        }

        let spans = self.flush();
        info!(spans, "storage intake closed, final batch flushed");
    }
}

/// Running storage stage: batching loop, writer pool and recovery loop
pub struct StorageService {
    loop_handle: JoinHandle<()>,
    writer_handles: Vec<JoinHandle<()>>,
    recovery_handle: Option<JoinHandle<()>>,
}

impl StorageService {
    pub fn start(
        settings: StorageSettings,
        sampler: TailSampler,
        writer: Arc<SpanWriter>,
        intake: Receiver<Vec<StorageSpan>>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let (handoff_tx, handoff_rx) = bounded::<Vec<StorageSpan>>(settings.writer_queue_capacity.max(1));

        let mut writer_handles = Vec::with_capacity(settings.writer_num);
        for i in 0..settings.writer_num.max(1) {
            let rx = handoff_rx.clone();
            let writer = writer.clone();
            let handle = thread::Builder::new()
                .name(format!("storage-writer-{}", i))
                .spawn(move || {
                    for batch in rx.iter() {
                        writer.persist(&batch);
                    }
                })?;
            writer_handles.push(handle);
        }

        let storage = Storage::new(sampler, settings.batch_size, handoff_tx);
        let flush_interval = settings.flush_interval;
        let loop_handle = thread::Builder::new()
            .name("storage".to_string())
            .spawn(move || storage.run(intake, flush_interval))?;

        let recovery_handle = match settings.recovery_interval {
            Some(interval) => Some(Recovery::new(writer, settings.batch_size).start(interval, shutdown)?),
            None => None,
        };

        info!(
            batch_size = settings.batch_size,
            writers = settings.writer_num,
            flush_interval_ms = settings.flush_interval.as_millis() as u64,
            "storage started"
        );

        Ok(Self {
            loop_handle,
            writer_handles,
            recovery_handle,
        })
    }

    /// Wait for the final flush and for every writer to finish its queue.
    /// The intake senders must all be gone, and the recovery loop exits
    /// only once shutdown has fired.
    pub fn join(self) {
        if self.loop_handle.join().is_err() {
            error!("storage loop panicked");
        }
        for handle in self.writer_handles {
            if handle.join().is_err() {
                error!("storage writer panicked");
            }
        }
        if let Some(handle) = self.recovery_handle {
            if handle.join().is_err() {
                error!("spool recovery panicked");
            }
        }
        info!("storage stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    fn trace(id: &str, n: usize) -> Vec<StorageSpan> {
        (0..n)
            .map(|i| StorageSpan {
                trace_id: id.into(),
                span_id: i.to_string(),
                ..Default::default()
            })
            .collect()
    }

    fn keep_all() -> TailSampler {
        TailSampler::new(1.0, Duration::from_secs(2))
    }

    #[test]
    fn test_store_flushes_at_batch_size() {
        let (tx, rx) = unbounded();
        let storage = Storage::new(keep_all(), 3, tx);

        assert!(!storage.store(trace("a", 2)));
        assert!(rx.try_recv().is_err());
        assert!(storage.store(trace("b", 2)));

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(storage.batch_len(), 0);
    }

    #[test]
    fn test_dropped_traces_never_reach_batch() {
        let (tx, rx) = unbounded();
        let storage = Storage::new(TailSampler::new(0.0, Duration::from_secs(2)), 1, tx);
        assert!(!storage.store(trace("a", 1)));
        assert_eq!(storage.batch_len(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_flush_empty_batch_is_noop() {
        let (tx, rx) = unbounded();
        let storage = Storage::new(keep_all(), 10, tx);
        assert_eq!(storage.flush(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_run_flushes_on_timer_and_on_close() {
        let (handoff_tx, handoff_rx) = unbounded();
        let (intake, intake_rx) = StorageIntake::channel(8);
        let storage = Storage::new(keep_all(), 100, handoff_tx);
        let handle = thread::spawn(move || storage.run(intake_rx, Duration::from_millis(20)));

        intake.submit(trace("a", 2)).unwrap();
        let batch = handoff_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(batch.len(), 2);

        intake.submit(trace("b", 1)).unwrap();
        drop(intake);
        handle.join().unwrap();
        let rest: usize = handoff_rx.try_iter().map(|b| b.len()).sum();
        assert_eq!(rest, 1);
    }

    #[test]
    fn test_offer_sheds_when_full() {
        let (intake, rx) = StorageIntake::channel(1);
        assert!(intake.offer(trace("a", 1)).unwrap());
        assert!(!intake.offer(trace("b", 1)).unwrap());
        drop(rx);
        assert!(intake.offer(trace("c", 1)).is_err());
    }
}
