use thiserror::Error;

/// Core error type for the ingestor
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config Error: {0}")]
    Config(String),
    #[error("Config Parse Error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid Span: {0}")]
    Validation(String),
    #[error("Log Error: {0}")]
    Log(String),
    #[error("Store Error: {0}")]
    Store(String),
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl From<reqwest::Error> for IngestError {
    fn from(e: reqwest::Error) -> Self {
        IngestError::Store(e.to_string())
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for IngestError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        IngestError::Log(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
