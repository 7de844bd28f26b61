//! ClickHouse store over the HTTP interface.
//! Batches are sent as one `INSERT ... FORMAT JSONEachRow` request.

use reqwest::blocking::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ClickHouseConfig;
use crate::error::{IngestError, Result};
use crate::model::StorageSpan;
use crate::storage::store::SpanStore;

const COLUMNS: &str = "TraceID, SpanID, ParentSpanID, ServiceName, OperationName, Kind, \
    StartTimeUs, DurationUs, StatusCode, StatusMessage, Attributes, \
    EventNames, EventTimesUs, EventAttrs, ProcessID, ResourceAttrs, TimestampUs";

/// One table row. Event attribute maps are JSON strings, nested map arrays
/// are slow in ClickHouse.
#[derive(Serialize)]
struct ClickHouseRow<'a> {
    #[serde(rename = "TraceID")]
    trace_id: &'a str,
    #[serde(rename = "SpanID")]
    span_id: &'a str,
    #[serde(rename = "ParentSpanID")]
    parent_span_id: &'a str,
    #[serde(rename = "ServiceName")]
    service_name: &'a str,
    #[serde(rename = "OperationName")]
    operation_name: &'a str,
    #[serde(rename = "Kind")]
    kind: &'a str,
    #[serde(rename = "StartTimeUs")]
    start_time_us: i64,
    #[serde(rename = "DurationUs")]
    duration_us: i64,
    #[serde(rename = "StatusCode")]
    status_code: &'a str,
    #[serde(rename = "StatusMessage")]
    status_message: &'a str,
    #[serde(rename = "Attributes")]
    attributes: &'a BTreeMap<String, String>,
    #[serde(rename = "EventNames")]
    event_names: &'a [String],
    #[serde(rename = "EventTimesUs")]
    event_times_us: &'a [i64],
    #[serde(rename = "EventAttrs")]
    event_attrs: Vec<String>,
    #[serde(rename = "ProcessID")]
    process_id: &'a str,
    #[serde(rename = "ResourceAttrs")]
    resource_attrs: &'a BTreeMap<String, String>,
    #[serde(rename = "TimestampUs")]
    timestamp_us: i64,
}

impl<'a> From<&'a StorageSpan> for ClickHouseRow<'a> {
    fn from(span: &'a StorageSpan) -> Self {
        let event_attrs = span
            .event_attrs
            .iter()
            .map(|attrs| serde_json::to_string(attrs).unwrap_or_else(|_| "{}".to_string()))
            .collect();

        Self {
            trace_id: &span.trace_id,
            span_id: &span.span_id,
            parent_span_id: &span.parent_span_id,
            service_name: &span.service_name,
            operation_name: &span.operation_name,
            kind: &span.kind,
            start_time_us: span.start_time_us,
            duration_us: span.duration_us,
            status_code: &span.status_code,
            status_message: &span.status_message,
            attributes: &span.attributes,
            event_names: &span.event_names,
            event_times_us: &span.event_times_us,
            event_attrs,
            process_id: &span.process_id,
            resource_attrs: &span.resource_attrs,
            timestamp_us: span.timestamp_us,
        }
    }
}

/// Encode a batch as JSONEachRow, skipping rows that fail to encode
/// or whose event arrays disagree in length. Returns (body, rows).
pub fn encode_rows(spans: &[StorageSpan]) -> (Vec<u8>, usize) {
    let mut body = Vec::with_capacity(spans.len() * 512);
    let mut rows = 0;

    for span in spans {
        if span.event_names.len() != span.event_times_us.len()
            || span.event_names.len() != span.event_attrs.len()
        {
            warn!(trace_id = %span.trace_id, span_id = %span.span_id, "event arrays out of step, skipping row");
            continue;
        }
        match serde_json::to_vec(&ClickHouseRow::from(span)) {
            Ok(line) => {
                body.extend_from_slice(&line);
                body.push(b'\n');
                rows += 1;
            }
            Err(e) => {
                warn!(trace_id = %span.trace_id, "append row failed: {}", e);
            }
        }
    }

    (body, rows)
}

pub struct ClickHouseStore {
    client: Client,
    config: ClickHouseConfig,
}

impl ClickHouseStore {
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn table(&self) -> String {
        format!("{}.{}", self.config.database, self.config.table)
    }

    pub fn insert_query(&self) -> String {
        format!("INSERT INTO {} ({}) FORMAT JSONEachRow", self.table(), COLUMNS)
    }

    pub fn create_table_query(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
    TraceID String,
    SpanID String,
    ParentSpanID String,
    ServiceName LowCardinality(String),
    OperationName LowCardinality(String),
    Kind LowCardinality(String),
    StartTimeUs Int64,
    DurationUs Int64,
    StatusCode LowCardinality(String),
    StatusMessage String,
    Attributes Map(String, String),
    EventNames Array(String),
    EventTimesUs Array(Int64),
    EventAttrs Array(String),
    ProcessID String,
    ResourceAttrs Map(String, String),
    TimestampUs Int64
) ENGINE = MergeTree
PARTITION BY toDate(fromUnixTimestamp64Micro(TimestampUs))
ORDER BY (ServiceName, TraceID, StartTimeUs)",
            self.table()
        )
    }

    fn execute(&self, query: String, body: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(&self.config.url)
            .query(&[("query", query)])
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(IngestError::Store(format!("clickhouse returned {}: {}", status, text.trim())));
        }
        Ok(())
    }

    pub fn ensure_table(&self) -> Result<()> {
        self.execute(self.create_table_query(), Vec::new())?;
        info!(table = %self.table(), "clickhouse table ready");
        Ok(())
    }
}

impl SpanStore for ClickHouseStore {
    fn insert(&self, spans: &[StorageSpan]) -> Result<usize> {
        let (body, rows) = encode_rows(spans);
        if rows == 0 {
            return Ok(0);
        }
        self.execute(self.insert_query(), body)?;
        Ok(rows)
    }

    fn ping(&self) -> Result<()> {
        let url = format!("{}/ping", self.config.url.trim_end_matches('/'));
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(IngestError::Store(format!("ping returned {}", response.status())));
        }
        Ok(())
    }
}
