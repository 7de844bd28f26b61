//! Kafka consumer-group source
//!
//! Every ingestor process joins the same group, so the brokers spread the
//! topic's partitions across processes. Offsets are committed explicitly once
//! the consumer handed a message off, never automatically on poll.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::info;

use crate::config::KafkaConfig;
use crate::error::{IngestError, Result};
use crate::ingest::log::{LogMessage, LogSource};

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("session.timeout.ms", config.session_timeout_ms.to_string());
    client
}

pub struct KafkaLog {
    consumer: BaseConsumer,
    topic: String,
}

impl KafkaLog {
    pub fn connect(config: &KafkaConfig) -> Result<Self> {
        let consumer: BaseConsumer = client_config(config).create()?;
        consumer.subscribe(&[config.topic.as_str()])?;
        info!(brokers = %config.brokers, group = %config.group, topic = %config.topic, "joined consumer group");

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
        })
    }
}

impl LogSource for KafkaLog {
    fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>> {
        let message = match self.consumer.poll(timeout) {
            None => return Ok(None),
            Some(message) => message?,
        };

        let partition = u32::try_from(message.partition())
            .map_err(|_| IngestError::Log(format!("invalid partition {}", message.partition())))?;
        let offset = u64::try_from(message.offset())
            .map_err(|_| IngestError::Log(format!("invalid offset {}", message.offset())))?;

        Ok(Some(LogMessage {
            partition,
            offset,
            key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    fn commit(&mut self, message: &LogMessage) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &self.topic,
            message.partition as i32,
            Offset::Offset(message.offset as i64 + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }
}
