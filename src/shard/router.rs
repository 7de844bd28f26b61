use xxhash_rust::xxh3::xxh3_64;

/// Stable trace-id -> shard routing.
/// Consumer and timing wheel share it so span hand-off and flush signals for
/// one trace always land on the same shard.
#[derive(Clone, Debug)]
pub struct ShardRouter {
    num_shards: usize,
}

impl ShardRouter {
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards > 0, "shard router needs at least one shard");
        Self { num_shards }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Route a trace id to a shard index
    pub fn route(&self, trace_id: &str) -> usize {
        self.route_key(trace_id.as_bytes())
    }

    pub fn route_key(&self, key: &[u8]) -> usize {
        let hash = xxh3_64(key);
        (hash % self.num_shards as u64) as usize
    }
}
