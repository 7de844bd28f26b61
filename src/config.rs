use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IngestError, Result};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub ingestor: IngestorConfig,
    pub kafka: KafkaConfig,
    pub wheel: WheelConfig,
    pub sampler: SamplerConfig,
    pub storage: StorageConfig,
    pub clickhouse: ClickHouseConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestorConfig {
    /// Number of merger shards
    pub worker_num: usize,
    /// Capacity of each consumer -> shard span queue
    pub shard_queue_capacity: usize,
    /// Capacity of each wheel -> shard flush signal queue
    pub signal_queue_capacity: usize,
    /// Pin shard threads to CPU cores (Linux only)
    pub pin_shards: bool,
    pub poll_timeout_ms: u64,
}

/// Upstream consumer group, used when the binary reads from Kafka
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct KafkaConfig {
    /// Comma separated `host:port` list
    pub brokers: String,
    pub group: String,
    pub topic: String,
    /// Where a group without committed offsets starts: "earliest" or "latest"
    pub auto_offset_reset: String,
    pub session_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WheelConfig {
    pub slot_num: usize,
    pub tick_interval_ms: u64,
    /// Ticks of silence after the last span before a trace is flushed
    pub grace_ticks: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SamplerConfig {
    pub sample_rate: f64,
    pub slow_threshold_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub writer_num: usize,
    pub writer_queue_capacity: usize,
    pub intake_capacity: usize,
    pub spool_dir: PathBuf,
    pub recovery_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    pub table: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
    pub create_table: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            worker_num: num_cpus::get(),
            shard_queue_capacity: 1000,
            signal_queue_capacity: 10_000,
            pin_shards: false,
            poll_timeout_ms: 100,
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "127.0.0.1:9092".to_string(),
            group: "tracer-group-receiver".to_string(),
            topic: "span-tracer-test".to_string(),
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: 6000,
        }
    }
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            slot_num: 60,
            tick_interval_ms: 1000,
            grace_ticks: 5,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            slow_threshold_ms: 2000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            flush_interval_ms: 3000,
            writer_num: 2,
            writer_queue_capacity: 100,
            intake_capacity: 100,
            spool_dir: PathBuf::from("./data"),
            recovery_interval_secs: 30,
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8123".to_string(),
            database: "tracer".to_string(),
            table: "trace_spans".to_string(),
            user: "default".to_string(),
            password: String::new(),
            timeout_secs: 5,
            create_table: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 9464,
        }
    }
}

impl WheelConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl SamplerConfig {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break wheel math or routing
    pub fn validate(&self) -> Result<()> {
        if self.ingestor.worker_num == 0 {
            return Err(IngestError::Config("ingestor.worker_num must be at least 1".into()));
        }
        if self.kafka.brokers.is_empty() || self.kafka.group.is_empty() || self.kafka.topic.is_empty() {
            return Err(IngestError::Config("kafka.brokers, kafka.group and kafka.topic must be set".into()));
        }
        if !matches!(self.kafka.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(IngestError::Config(format!(
                "kafka.auto_offset_reset must be earliest or latest, got {}",
                self.kafka.auto_offset_reset
            )));
        }
        if self.wheel.slot_num < 2 {
            return Err(IngestError::Config("wheel.slot_num must be at least 2".into()));
        }
        if self.wheel.grace_ticks == 0 || self.wheel.grace_ticks >= self.wheel.slot_num {
            return Err(IngestError::Config(format!(
                "wheel.grace_ticks must be in 1..{}, got {}",
                self.wheel.slot_num, self.wheel.grace_ticks
            )));
        }
        if self.wheel.tick_interval_ms == 0 {
            return Err(IngestError::Config("wheel.tick_interval_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.sampler.sample_rate) {
            return Err(IngestError::Config(format!(
                "sampler.sample_rate must be within [0, 1], got {}",
                self.sampler.sample_rate
            )));
        }
        if self.storage.batch_size == 0 {
            return Err(IngestError::Config("storage.batch_size must be at least 1".into()));
        }
        if self.storage.writer_num == 0 {
            return Err(IngestError::Config("storage.writer_num must be at least 1".into()));
        }
        if self.storage.flush_interval_ms == 0 || self.storage.recovery_interval_secs == 0 {
            return Err(IngestError::Config("storage intervals must be positive".into()));
        }
        Ok(())
    }
}
