use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

use crate::config::Config;
use crate::error::Result;
use crate::shard::core_shard::CoreShard;
use crate::shard::message_bus::{ShardInbox, SignalBus};
use crate::shard::router::ShardRouter;
use crate::shutdown::Shutdown;
use crate::storage::StorageIntake;
use crate::wheel::TimingWheel;

#[derive(Debug, Clone)]
pub struct MergerSettings {
    pub slot_num: usize,
    pub grace_ticks: usize,
    /// None leaves the wheel undriven; callers tick it by hand
    pub tick_interval: Option<Duration>,
    pub pin_shards: bool,
}

impl From<&Config> for MergerSettings {
    fn from(config: &Config) -> Self {
        Self {
            slot_num: config.wheel.slot_num,
            grace_ticks: config.wheel.grace_ticks,
            tick_interval: Some(config.wheel.tick_interval()),
            pin_shards: config.ingestor.pin_shards,
        }
    }
}

/// Owns the shard threads and the timing wheel that drives their flushes
pub struct Merger {
    wheel: Arc<TimingWheel>,
    worker_handles: Vec<JoinHandle<()>>,
    wheel_handle: Option<JoinHandle<()>>,
}

impl Merger {
    pub fn start(
        settings: MergerSettings,
        inboxes: Vec<ShardInbox>,
        signals: SignalBus,
        output: StorageIntake,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let num_shards = inboxes.len();
        let router = ShardRouter::new(num_shards);
        let wheel = Arc::new(TimingWheel::new(settings.slot_num, router, signals));

        let mut worker_handles = Vec::with_capacity(num_shards);
        for (i, inbox) in inboxes.into_iter().enumerate() {
            let mut shard = CoreShard::new(i, wheel.clone(), settings.grace_ticks, output.clone());
            let pin = settings.pin_shards;
            let handle = thread::Builder::new()
                .name(format!("merger-{}", i))
                .spawn(move || shard.start_loop(inbox, pin))?;
            worker_handles.push(handle);
        }

        let wheel_handle = match settings.tick_interval {
            Some(interval) => Some(wheel.clone().start(interval, shutdown)?),
            None => None,
        };

        info!(
            shards = num_shards,
            slots = settings.slot_num,
            grace_ticks = settings.grace_ticks,
            "merger started"
        );

        Ok(Self {
            wheel,
            worker_handles,
            wheel_handle,
        })
    }

    pub fn wheel(&self) -> &Arc<TimingWheel> {
        &self.wheel
    }

    /// Wait for every shard to drain and the wheel thread to stop.
    /// Shards exit once all span senders are dropped.
    pub fn join(self) {
        for handle in self.worker_handles {
            if handle.join().is_err() {
                error!("merger shard panicked");
            }
        }
        if let Some(handle) = self.wheel_handle {
            if handle.join().is_err() {
                error!("timing wheel panicked");
            }
        }
    }
}
