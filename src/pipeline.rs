//! Wires the stages together and owns their shutdown order:
//! consumer -> merger shards -> storage -> writers.
//!
//! Each stage exits when its upstream channel disconnects, so stopping the
//! consumer is enough to drain everything behind it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{IngestError, Result};
use crate::ingest::{Consumer, ConsumerStats, LogSource};
use crate::sampler::TailSampler;
use crate::shard::{Merger, MergerSettings, ShardMessageBus};
use crate::shutdown::ShutdownTrigger;
use crate::storage::{Spool, SpanStore, SpanWriter, StorageIntake, StorageService, StorageSettings};
use crate::wheel::TimingWheel;

pub struct Ingestor {
    trigger: ShutdownTrigger,
    consumer: Option<JoinHandle<Result<ConsumerStats>>>,
    merger: Merger,
    storage: StorageService,
    writer: Arc<SpanWriter>,
}

impl Ingestor {
    pub fn start<L>(config: &Config, log: L, store: Arc<dyn SpanStore>) -> Result<Self>
    where
        L: LogSource + 'static,
    {
        Self::start_with(config, MergerSettings::from(config), StorageSettings::from(config), log, store)
    }

    /// Start with explicit stage settings, e.g. an undriven wheel in tests
    pub fn start_with<L>(
        config: &Config,
        merger_settings: MergerSettings,
        storage_settings: StorageSettings,
        log: L,
        store: Arc<dyn SpanStore>,
    ) -> Result<Self>
    where
        L: LogSource + 'static,
    {
        config.validate()?;

        let spool = Arc::new(Spool::open(&config.storage.spool_dir)?);
        let writer = Arc::new(SpanWriter::new(store, spool));
        let trigger = ShutdownTrigger::new();

        // Downstream first so every stage has somewhere to send on startup
        let (intake, intake_rx) = StorageIntake::channel(config.storage.intake_capacity);
        let storage = StorageService::start(
            storage_settings,
            TailSampler::from_config(&config.sampler),
            writer.clone(),
            intake_rx,
            trigger.subscribe(),
        )?;

        let (bus, signals, inboxes) = ShardMessageBus::new(
            config.ingestor.worker_num,
            config.ingestor.shard_queue_capacity,
            config.ingestor.signal_queue_capacity,
        );
        let merger = Merger::start(merger_settings, inboxes, signals, intake, trigger.subscribe())?;

        let consumer = Consumer::new(bus);
        let poll_timeout = Duration::from_millis(config.ingestor.poll_timeout_ms);
        let shutdown = trigger.subscribe();
        let consumer = thread::Builder::new()
            .name("consumer".to_string())
            .spawn(move || consumer.run(log, poll_timeout, shutdown))?;

        info!(
            shards = config.ingestor.worker_num,
            spool_dir = %config.storage.spool_dir.display(),
            "ingestor started"
        );

        Ok(Self {
            trigger,
            consumer: Some(consumer),
            merger,
            storage,
            writer,
        })
    }

    pub fn wheel(&self) -> &Arc<TimingWheel> {
        self.merger.wheel()
    }

    pub fn writer(&self) -> &Arc<SpanWriter> {
        &self.writer
    }

    /// True once the consumer thread has returned, e.g. its input ran dry
    pub fn is_consumer_finished(&self) -> bool {
        self.consumer.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop consuming and drain every stage. Traces still waiting for their
    /// grace period are flushed immediately.
    pub fn shutdown(mut self) -> Result<ConsumerStats> {
        info!("ingestor shutting down");
        self.trigger.fire();
        self.finish()
    }

    /// Wait for the consumer to exhaust its input, then drain
    pub fn wait(mut self) -> Result<ConsumerStats> {
        let stats = self.join_consumer();
        self.trigger.fire();
        self.drain_stages();
        stats
    }

    fn finish(mut self) -> Result<ConsumerStats> {
        let stats = self.join_consumer();
        self.drain_stages();
        stats
    }

    fn join_consumer(&mut self) -> Result<ConsumerStats> {
        let Some(handle) = self.consumer.take() else {
            return Ok(ConsumerStats::default());
        };
        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                error!("consumer panicked");
                Err(IngestError::ChannelClosed("consumer"))
            }
        }
    }

    fn drain_stages(self) {
        self.merger.join();
        self.storage.join();
        info!("ingestor stopped");
    }
}
