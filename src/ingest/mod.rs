pub mod consumer;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod log;
pub mod normalizer;
pub mod validator;

pub use consumer::{Consumer, ConsumerStats};
#[cfg(feature = "kafka")]
pub use kafka::KafkaLog;
pub use log::{JsonLinesLog, LogMessage, LogSource, MemoryLog, MemoryLogConsumer};
pub use normalizer::Normalizer;
pub use validator::Validator;
