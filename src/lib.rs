//! Trace Ingestor
//!
//! Consumes flattened spans from the durable log, assembles them into traces
//! on sharded workers, applies tail sampling and persists the result with a
//! local spool for store outages.

pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod sampler;
pub mod shard;
pub mod shutdown;
pub mod storage;
pub mod telemetry;
pub mod wheel;

pub use config::Config;
pub use error::{IngestError, Result};
pub use model::{FlatSpan, StorageSpan};
pub use pipeline::Ingestor;
pub use sampler::TailSampler;
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use wheel::TimingWheel;
