//! Timing Wheel
//!
//! Single-level wheel of `slot_num` slots advanced by one slot per tick.
//! Each armed trace id lives in exactly one slot; re-arming moves it instead
//! of duplicating it, so every expiry produces exactly one flush signal.
//!
//! `add(id, delay)` places the id `delay` slots ahead of the cursor. The slot
//! under the cursor is drained by the next tick, so an id armed with `delay`
//! fires on the `delay + 1`-th tick, which leaves at least `delay` full tick
//! intervals of silence before the flush.

use crossbeam::channel::{select, tick};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

use crate::metrics;
use crate::shard::message_bus::SignalBus;
use crate::shard::router::ShardRouter;
use crate::shutdown::Shutdown;

pub struct TimingWheel {
    state: Mutex<WheelState>,
    slot_num: usize,
    router: ShardRouter,
    signals: SignalBus,
}

struct WheelState {
    slots: Vec<HashSet<String>>,
    /// trace id -> slot currently holding it
    armed: HashMap<String, usize>,
    current_pos: usize,
}

impl TimingWheel {
    pub fn new(slot_num: usize, router: ShardRouter, signals: SignalBus) -> Self {
        assert!(slot_num >= 2, "timing wheel needs at least two slots");
        assert_eq!(
            router.num_shards(),
            signals.num_shards(),
            "router and signal bus disagree on shard count"
        );

        Self {
            state: Mutex::new(WheelState {
                slots: (0..slot_num).map(|_| HashSet::new()).collect(),
                armed: HashMap::new(),
                current_pos: 0,
            }),
            slot_num,
            router,
            signals,
        }
    }

    pub fn slot_num(&self) -> usize {
        self.slot_num
    }

    /// Arm (or re-arm) a flush for `trace_id` `delay` slots from now
    pub fn add(&self, trace_id: &str, delay: usize) {
        debug_assert!(delay < self.slot_num, "delay {} exceeds wheel horizon", delay);
        let delay = delay.min(self.slot_num - 1);

        let mut state = self.state.lock();
        let index = (state.current_pos + delay) % self.slot_num;

        match state.armed.get(trace_id).copied() {
            Some(old) if old == index => return,
            Some(old) => {
                state.slots[old].remove(trace_id);
                state.slots[index].insert(trace_id.to_string());
                if let Some(slot) = state.armed.get_mut(trace_id) {
                    *slot = index;
                }
            }
            None => {
                state.slots[index].insert(trace_id.to_string());
                state.armed.insert(trace_id.to_string(), index);
                metrics::PENDING_TRACES.inc();
            }
        }
    }

    /// Advance one slot and signal every trace that expired.
    /// Signals are sent outside the lock; returns the number emitted.
    pub fn tick(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            let pos = state.current_pos;
            let expired = std::mem::take(&mut state.slots[pos]);
            for trace_id in &expired {
                state.armed.remove(trace_id);
            }
            state.current_pos = (pos + 1) % self.slot_num;
            expired
        };

        if expired.is_empty() {
            return 0;
        }
        metrics::PENDING_TRACES.sub(expired.len() as i64);

        let mut emitted = 0;
        for trace_id in expired {
            let shard = self.router.route(&trace_id);
            match self.signals.signal(shard, trace_id) {
                Ok(()) => emitted += 1,
                Err(e) => {
                    let trace_id = e.into_inner();
                    debug!(shard, trace_id = %trace_id, "shard gone, dropping flush signal");
                }
            }
        }
        emitted
    }

    /// Number of armed trace ids
    pub fn pending(&self) -> usize {
        self.state.lock().armed.len()
    }

    pub fn is_armed(&self, trace_id: &str) -> bool {
        self.state.lock().armed.contains_key(trace_id)
    }

    /// Ticks until `trace_id` fires, counting the tick that flushes it
    pub fn ticks_remaining(&self, trace_id: &str) -> Option<usize> {
        let state = self.state.lock();
        let slot = *state.armed.get(trace_id)?;
        Some((slot + self.slot_num - state.current_pos) % self.slot_num + 1)
    }

    /// Drive the wheel from a dedicated thread until shutdown
    pub fn start(self: Arc<Self>, interval: Duration, shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("timing-wheel".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                info!(slots = self.slot_num, ?interval, "timing wheel started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            self.tick();
                        }
                        recv(shutdown.receiver()) -> _ => break,
                    }
                }
                info!(pending = self.pending(), "timing wheel stopped");
            })
    }
}
