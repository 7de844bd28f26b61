pub mod coordinator;
pub mod core_affinity;
pub mod core_shard;
pub mod message_bus;
pub mod router;

// Re-exports
pub use coordinator::{Merger, MergerSettings};
pub use core_shard::{CoreShard, ShardCache};
pub use message_bus::{ShardInbox, ShardMessageBus, SignalBus};
pub use router::ShardRouter;
