use crossbeam::channel::{never, select, Receiver};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::metrics;
use crate::model::{FlatSpan, StorageSpan};
use crate::shard::core_affinity::{self, CoreId};
use crate::shard::message_bus::ShardInbox;
use crate::storage::StorageIntake;
use crate::wheel::TimingWheel;

/// Private trace cache of one shard: trace id -> spans in arrival order.
/// Only the owning shard loop ever touches it.
#[derive(Default)]
pub struct ShardCache {
    traces: HashMap<String, Vec<StorageSpan>>,
}

impl ShardCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a span to its trace, returns the trace's span count
    pub fn append(&mut self, span: StorageSpan) -> usize {
        let spans = self.traces.entry(span.trace_id.clone()).or_default();
        spans.push(span);
        spans.len()
    }

    /// Remove a trace; None when absent or empty
    pub fn take(&mut self, trace_id: &str) -> Option<Vec<StorageSpan>> {
        self.traces.remove(trace_id).filter(|spans| !spans.is_empty())
    }

    pub fn contains(&self, trace_id: &str) -> bool {
        self.traces.contains_key(trace_id)
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (String, Vec<StorageSpan>)> + '_ {
        self.traces.drain()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShardMetrics {
    pub spans_stored: u64,
    pub traces_flushed: u64,
    pub empty_signals: u64,
}

/// One merger worker. Span appends and flush signals are handled by the same
/// loop, so a flush can never race an append for the same trace.
pub struct CoreShard {
    core_id: CoreId,
    cache: ShardCache,
    wheel: Arc<TimingWheel>,
    grace_ticks: usize,
    output: StorageIntake,
    metrics: ShardMetrics,
}

impl CoreShard {
    pub fn new(
        core_id: CoreId,
        wheel: Arc<TimingWheel>,
        grace_ticks: usize,
        output: StorageIntake,
    ) -> Self {
        Self {
            core_id,
            cache: ShardCache::new(),
            wheel,
            grace_ticks,
            output,
            metrics: ShardMetrics::default(),
        }
    }

    pub fn id(&self) -> CoreId {
        self.core_id
    }

    pub fn cache(&self) -> &ShardCache {
        &self.cache
    }

    pub fn metrics(&self) -> ShardMetrics {
        self.metrics
    }

    /// Convert and buffer a span, then push its trace's flush out by the grace period
    pub fn store(&mut self, span: FlatSpan) {
        let row = StorageSpan::from(span);
        let trace_id = row.trace_id.clone();
        self.cache.append(row);
        self.wheel.add(&trace_id, self.grace_ticks);
        self.metrics.spans_stored += 1;
    }

    /// Hand the trace to storage. Signals for unknown traces are no-ops.
    pub fn flush(&mut self, trace_id: &str) -> Result<bool> {
        let Some(spans) = self.cache.take(trace_id) else {
            self.metrics.empty_signals += 1;
            return Ok(false);
        };

        debug!(shard = self.core_id, trace_id, spans = spans.len(), "flushing trace");
        self.output.submit(spans)?;
        self.metrics.traces_flushed += 1;
        metrics::TRACES_FLUSHED.inc();
        Ok(true)
    }

    /// Event loop. Runs until the span channel closes, then flushes every
    /// trace still cached.
    pub fn start_loop(&mut self, inbox: ShardInbox, pin: bool) {
        if pin {
            core_affinity::pin_to_core(self.core_id);
        }

        let spans = inbox.spans;
        let signals = inbox.signals;
        let closed: Receiver<String> = never();
        let mut signals_open = true;

        loop {
            select! {
                recv(spans) -> msg => match msg {
                    Ok(span) => self.store(span),
                    Err(_) => break,
                },
                recv(if signals_open { &signals } else { &closed }) -> msg => match msg {
                    Ok(trace_id) => {
                        if let Err(e) = self.flush(&trace_id) {
                            error!(shard = self.core_id, "{}", e);
                            return;
                        }
                    }
                    Err(_) => signals_open = false,
                },
            }
        }

        self.drain();
        info!(
            shard = self.core_id,
            spans = self.metrics.spans_stored,
            traces = self.metrics.traces_flushed,
            "merger shard stopped"
        );
    }

    /// Flush every cached trace regardless of its wheel deadline
    pub fn drain(&mut self) {
        let pending: Vec<_> = self.cache.drain().collect();
        for (trace_id, spans) in pending {
            if spans.is_empty() {
                continue;
            }
            if self.output.submit(spans).is_err() {
                error!(shard = self.core_id, trace_id = %trace_id, "storage intake closed during drain");
                return;
            }
            self.metrics.traces_flushed += 1;
            metrics::TRACES_FLUSHED.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::message_bus::ShardMessageBus;
    use crate::shard::router::ShardRouter;

    fn flat(trace_id: &str, span_id: &str) -> FlatSpan {
        FlatSpan {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            service_name: "svc".into(),
            start_time: 1_700_000_000_000_000,
            ..Default::default()
        }
    }

    fn shard() -> (CoreShard, Arc<TimingWheel>, Receiver<Vec<StorageSpan>>) {
        let (_bus, signals, _inboxes) = ShardMessageBus::new(1, 8, 8);
        let wheel = Arc::new(TimingWheel::new(16, ShardRouter::new(1), signals));
        let (intake, rx) = StorageIntake::channel(64);
        (CoreShard::new(0, wheel.clone(), 5, intake), wheel, rx)
    }

    #[test]
    fn test_cache_take_is_idempotent() {
        let mut cache = ShardCache::new();
        cache.append(StorageSpan { trace_id: "t".into(), ..Default::default() });
        assert_eq!(cache.take("t").map(|s| s.len()), Some(1));
        assert!(cache.take("t").is_none());
        assert!(!cache.contains("t"));
    }

    #[test]
    fn test_store_arms_wheel() {
        let (mut shard, wheel, _rx) = shard();
        shard.store(flat("t1", "s1"));
        assert!(wheel.is_armed("t1"));
        assert!(shard.cache().contains("t1"));
    }

    #[test]
    fn test_flush_emits_spans_in_arrival_order() {
        let (mut shard, _wheel, rx) = shard();
        for id in ["s1", "s2", "s3"] {
            shard.store(flat("t1", id));
        }
        shard.store(flat("t2", "x"));

        assert!(shard.flush("t1").unwrap());
        let spans = rx.try_recv().unwrap();
        let ids: Vec<_> = spans.iter().map(|s| s.span_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
        assert!(!shard.cache().contains("t1"));
        assert!(shard.cache().contains("t2"));
    }

    #[test]
    fn test_flush_unknown_trace_is_noop() {
        let (mut shard, _wheel, rx) = shard();
        assert!(!shard.flush("missing").unwrap());
        assert!(rx.try_recv().is_err());
        assert_eq!(shard.metrics().empty_signals, 1);
    }

    #[test]
    fn test_drain_flushes_everything() {
        let (mut shard, _wheel, rx) = shard();
        shard.store(flat("a", "1"));
        shard.store(flat("b", "1"));
        shard.store(flat("b", "2"));
        shard.drain();

        let mut sizes: Vec<_> = rx.try_iter().map(|t| t.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
        assert!(shard.cache().is_empty());
    }
}
