use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::ingest::log::{LogMessage, LogSource};
use crate::ingest::normalizer::Normalizer;
use crate::ingest::validator::Validator;
use crate::metrics;
use crate::model::FlatSpan;
use crate::shard::message_bus::ShardMessageBus;
use crate::shard::router::ShardRouter;
use crate::shutdown::Shutdown;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Reads span messages, drops malformed ones and routes the rest by trace id
pub struct Consumer {
    router: ShardRouter,
    bus: ShardMessageBus,
    validator: Validator,
    normalizer: Normalizer,
    stats: ConsumerStats,
}

impl Consumer {
    pub fn new(bus: ShardMessageBus) -> Self {
        Self {
            router: ShardRouter::new(bus.num_shards()),
            bus,
            validator: Validator::new(),
            normalizer: Normalizer::new(),
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn route(&self, trace_id: &str) -> usize {
        self.router.route(trace_id)
    }

    /// Deserialize, validate and normalize one payload
    pub fn decode(&self, payload: &[u8]) -> Result<FlatSpan> {
        let mut span: FlatSpan = serde_json::from_slice(payload)?;
        self.validator.validate(&span)?;
        self.normalizer.normalize(&mut span);
        Ok(span)
    }

    /// Route one payload to its shard, blocking while the shard queue is full.
    /// Malformed payloads are dropped and yield `Ok(None)`; the only error is
    /// a closed shard queue.
    pub fn handle_message(&mut self, payload: &[u8]) -> Result<Option<usize>> {
        let span = match self.decode(payload) {
            Ok(span) => span,
            Err(e) => {
                let reason = match e {
                    IngestError::Json(_) => "decode",
                    _ => "invalid",
                };
                warn!(reason, "dropping span message: {}", e);
                metrics::SPANS_REJECTED.with_label_values(&[reason]).inc();
                self.stats.rejected += 1;
                return Ok(None);
            }
        };

        let shard = self.route(&span.trace_id);
        self.bus
            .send_to_shard(shard, span)
            .map_err(|_| IngestError::ChannelClosed("merger shard"))?;
        metrics::SPANS_CONSUMED.inc();
        self.stats.accepted += 1;
        Ok(Some(shard))
    }

    fn process<L: LogSource>(&mut self, log: &mut L, message: LogMessage) -> Result<()> {
        let routed = self.handle_message(&message.payload)?;
        debug!(
            partition = message.partition,
            offset = message.offset,
            shard = ?routed,
            "message handled"
        );
        if let Err(e) = log.commit(&message) {
            warn!(partition = message.partition, offset = message.offset, "commit failed: {}", e);
        }
        Ok(())
    }

    /// Consume until shutdown fires or the source is exhausted. Dropping the
    /// consumer on return closes the shard queues, which drains the merger.
    pub fn run<L: LogSource>(mut self, mut log: L, poll_timeout: Duration, shutdown: Shutdown) -> Result<ConsumerStats> {
        info!(shards = self.bus.num_shards(), "consumer started");

        while !shutdown.is_triggered() && !log.is_exhausted() {
            match log.poll(poll_timeout) {
                Ok(Some(message)) => self.process(&mut log, message)?,
                Ok(None) => {}
                Err(e) => {
                    warn!("log poll failed: {}", e);
                    std::thread::sleep(poll_timeout);
                }
            }
        }

        info!(
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            "consumer stopped"
        );
        Ok(self.stats)
    }
}
