//! Tests for the sharded merger
//!
//! Covers core affinity, routing, the message bus and trace assembly driven
//! by a hand-ticked timing wheel.

use proptest::prelude::*;
use std::time::Duration;

use trace_ingestor::model::FlatSpan;
use trace_ingestor::shard::{
    core_affinity::CpuTopology, Merger, MergerSettings, ShardMessageBus, ShardRouter,
};
use trace_ingestor::storage::StorageIntake;
use trace_ingestor::ShutdownTrigger;

fn span(trace_id: &str, span_id: &str) -> FlatSpan {
    FlatSpan {
        trace_id: trace_id.into(),
        span_id: span_id.into(),
        service_name: "checkout".into(),
        operation_name: "GET /cart".into(),
        start_time: 1_700_000_000_000_000,
        ..Default::default()
    }
}

#[cfg(test)]
mod affinity_tests {
    use super::*;

    #[test]
    fn test_cpu_topology_detection() {
        let topology = CpuTopology::detect();
        assert!(topology.logical_cores() >= 1);
        assert!(topology.physical_cores() >= 1);
    }
}

#[cfg(test)]
mod router_tests {
    use super::*;

    #[test]
    fn test_router_deterministic() {
        let router = ShardRouter::new(16);
        assert_eq!(router.route("trace-1"), router.route("trace-1"));
        assert_eq!(router.route("trace-1"), router.route_key(b"trace-1"));
    }

    #[test]
    fn test_router_distribution() {
        let router = ShardRouter::new(16);
        let mut counts = vec![0usize; 16];
        for i in 0..10000 {
            counts[router.route(&format!("trace_{}", i))] += 1;
        }
        for (shard, count) in counts.iter().enumerate() {
            assert!(*count > 0, "Shard {} has no traces", shard);
        }
    }

    proptest! {
        #[test]
        fn prop_route_is_stable_and_in_range(trace_id in "[0-9a-f]{1,32}", shards in 1usize..64) {
            let router = ShardRouter::new(shards);
            let shard = router.route(&trace_id);
            prop_assert!(shard < shards);
            prop_assert_eq!(shard, ShardRouter::new(shards).route(&trace_id));
        }
    }
}

#[cfg(test)]
mod message_bus_tests {
    use super::*;

    #[test]
    fn test_message_bus_creation() {
        let (bus, signals, inboxes) = ShardMessageBus::new(4, 8, 8);
        assert_eq!(inboxes.len(), 4);
        assert_eq!(bus.num_shards(), 4);
        assert_eq!(signals.num_shards(), 4);
    }

    #[test]
    fn test_send_to_shard() {
        let (bus, signals, inboxes) = ShardMessageBus::new(4, 8, 8);
        bus.send_to_shard(2, span("t", "s")).unwrap();
        signals.signal(1, "t".into()).unwrap();

        assert_eq!(inboxes[2].spans.try_recv().unwrap().span_id, "s");
        assert_eq!(inboxes[1].signals.try_recv().unwrap(), "t");
        assert!(inboxes[0].spans.try_recv().is_err());
    }
}

#[cfg(test)]
mod merger_tests {
    use super::*;

    const GRACE: usize = 3;

    fn settings() -> MergerSettings {
        MergerSettings {
            slot_num: 16,
            grace_ticks: GRACE,
            tick_interval: None,
            pin_shards: false,
        }
    }

    /// Wait until the shards have armed every trace in `ids`
    fn wait_armed(merger: &Merger, ids: &[&str]) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !ids.iter().all(|id| merger.wheel().is_armed(id)) {
            assert!(std::time::Instant::now() < deadline, "spans never reached the shards");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_trace_flushed_once_after_grace() {
        let (bus, signals, inboxes) = ShardMessageBus::new(2, 64, 64);
        let (intake, output) = StorageIntake::channel(64);
        let mut trigger = ShutdownTrigger::new();
        let merger = Merger::start(settings(), inboxes, signals, intake, trigger.subscribe()).unwrap();
        let router = ShardRouter::new(2);

        for id in ["a", "b", "c"] {
            bus.send_to_shard(router.route("t1"), span("t1", id)).unwrap();
        }
        wait_armed(&merger, &["t1"]);

        for _ in 0..GRACE {
            merger.wheel().tick();
        }
        assert!(output.recv_timeout(Duration::from_millis(50)).is_err());

        merger.wheel().tick();
        let trace = output.recv_timeout(Duration::from_secs(2)).unwrap();
        let ids: Vec<_> = trace.iter().map(|s| s.span_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        // nothing left to flush for t1
        for _ in 0..16 {
            merger.wheel().tick();
        }
        assert!(output.recv_timeout(Duration::from_millis(50)).is_err());

        trigger.fire();
        drop(bus);
        merger.join();
    }

    #[test]
    fn test_late_span_extends_grace() {
        let (bus, signals, inboxes) = ShardMessageBus::new(1, 64, 64);
        let (intake, output) = StorageIntake::channel(64);
        let trigger = ShutdownTrigger::new();
        let merger = Merger::start(settings(), inboxes, signals, intake, trigger.subscribe()).unwrap();

        bus.send_to_shard(0, span("t1", "a")).unwrap();
        wait_armed(&merger, &["t1"]);
        merger.wheel().tick();
        merger.wheel().tick();

        assert_eq!(merger.wheel().ticks_remaining("t1"), Some(GRACE - 1));

        bus.send_to_shard(0, span("t1", "b")).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while merger.wheel().ticks_remaining("t1") != Some(GRACE + 1) {
            assert!(std::time::Instant::now() < deadline, "late span never re-armed the trace");
            std::thread::sleep(Duration::from_millis(2));
        }
        merger.wheel().tick();
        merger.wheel().tick();
        assert!(output.recv_timeout(Duration::from_millis(50)).is_err());

        merger.wheel().tick();
        merger.wheel().tick();
        let trace = output.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(trace.len(), 2);

        drop(bus);
        merger.join();
    }

    #[test]
    fn test_closing_spans_drains_pending_traces() {
        let (bus, signals, inboxes) = ShardMessageBus::new(4, 64, 64);
        let (intake, output) = StorageIntake::channel(64);
        let trigger = ShutdownTrigger::new();
        let merger = Merger::start(settings(), inboxes, signals, intake, trigger.subscribe()).unwrap();
        let router = ShardRouter::new(4);

        for t in ["t1", "t2", "t3"] {
            bus.send_to_shard(router.route(t), span(t, "root")).unwrap();
        }
        drop(bus);
        merger.join();

        let mut traces: Vec<_> = output.try_iter().map(|t| t[0].trace_id.clone()).collect();
        traces.sort();
        assert_eq!(traces, vec!["t1", "t2", "t3"]);
        // every intake sender is gone once the shards stopped
        assert!(output.recv_timeout(Duration::from_millis(10)).is_err());
    }
}
