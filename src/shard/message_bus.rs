use crossbeam::channel::{bounded, Receiver, SendError, Sender, TrySendError};

use crate::model::FlatSpan;

/// Inbound side of one shard: new spans from the consumer and flush signals
/// from the timing wheel.
pub struct ShardInbox {
    pub spans: Receiver<FlatSpan>,
    pub signals: Receiver<String>,
}

/// Bounded span queues, one per shard.
/// A full queue blocks the sender, pushing backpressure into the log consumer.
#[derive(Clone)]
pub struct ShardMessageBus {
    senders: Vec<Sender<FlatSpan>>,
}

/// Flush signal queues, one per shard, fed by the timing wheel
#[derive(Clone)]
pub struct SignalBus {
    senders: Vec<Sender<String>>,
}

impl ShardMessageBus {
    pub fn new(
        num_shards: usize,
        span_capacity: usize,
        signal_capacity: usize,
    ) -> (Self, SignalBus, Vec<ShardInbox>) {
        let mut span_senders = Vec::with_capacity(num_shards);
        let mut signal_senders = Vec::with_capacity(num_shards);
        let mut inboxes = Vec::with_capacity(num_shards);

        for _ in 0..num_shards {
            let (span_tx, span_rx) = bounded(span_capacity);
            let (signal_tx, signal_rx) = bounded(signal_capacity);
            span_senders.push(span_tx);
            signal_senders.push(signal_tx);
            inboxes.push(ShardInbox {
                spans: span_rx,
                signals: signal_rx,
            });
        }

        (
            Self { senders: span_senders },
            SignalBus { senders: signal_senders },
            inboxes,
        )
    }

    pub fn num_shards(&self) -> usize {
        self.senders.len()
    }

    /// Blocking send to a specific shard
    pub fn send_to_shard(&self, shard_id: usize, span: FlatSpan) -> Result<(), SendError<FlatSpan>> {
        debug_assert!(shard_id < self.senders.len(), "shard {} out of range", shard_id);
        self.senders[shard_id].send(span)
    }

    /// Non-blocking send, hands the span back when the queue is full
    pub fn try_send_to_shard(&self, shard_id: usize, span: FlatSpan) -> Result<(), TrySendError<FlatSpan>> {
        debug_assert!(shard_id < self.senders.len(), "shard {} out of range", shard_id);
        self.senders[shard_id].try_send(span)
    }
}

impl SignalBus {
    pub fn num_shards(&self) -> usize {
        self.senders.len()
    }

    pub fn signal(&self, shard_id: usize, trace_id: String) -> Result<(), SendError<String>> {
        debug_assert!(shard_id < self.senders.len(), "shard {} out of range", shard_id);
        self.senders[shard_id].send(trace_id)
    }
}
