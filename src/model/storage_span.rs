use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::flat_span::{FlatSpan, SpanLog};
use super::tag_to_string;

pub const STATUS_OK: &str = "OK";
pub const STATUS_ERROR: &str = "ERROR";

const KIND_INTERNAL: &str = "INTERNAL";
const PROCESS_PREFIX: &str = "process.";
const DEFAULT_EVENT_NAME: &str = "log";

/// One persisted row per span.
/// Logs are split into parallel event arrays so rows carry no nested maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSpan {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,

    pub service_name: String,
    pub operation_name: String,
    /// SERVER / CLIENT / PRODUCER / CONSUMER / INTERNAL
    pub kind: String,

    pub start_time_us: i64,
    pub duration_us: i64,

    /// OK / ERROR
    pub status_code: String,
    pub status_message: String,

    /// Span tags merged with `process.`-prefixed process tags
    pub attributes: BTreeMap<String, String>,

    pub event_names: Vec<String>,
    pub event_times_us: Vec<i64>,
    pub event_attrs: Vec<BTreeMap<String, String>>,

    pub process_id: String,
    pub resource_attrs: BTreeMap<String, String>,

    pub sampled: bool,
    pub baggage: BTreeMap<String, String>,

    /// Partitioning / TTL column
    pub timestamp_us: i64,
}

impl StorageSpan {
    pub fn is_error(&self) -> bool {
        self.status_code == STATUS_ERROR
    }
}

impl From<&FlatSpan> for StorageSpan {
    fn from(fs: &FlatSpan) -> Self {
        let mut attributes: BTreeMap<String, String> = fs
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), tag_to_string(v)))
            .collect();
        for (k, v) in &fs.process_tags {
            attributes.insert(format!("{}{}", PROCESS_PREFIX, k), tag_to_string(v));
        }

        let (event_names, event_times_us, event_attrs) = flatten_logs(&fs.logs);
        let (status_code, status_message) = infer_status(&fs.tags);

        Self {
            trace_id: fs.trace_id.clone(),
            span_id: fs.span_id.clone(),
            parent_span_id: fs.effective_parent().to_string(),
            service_name: fs.service_name.clone(),
            operation_name: fs.operation_name.clone(),
            kind: infer_kind(&fs.tags),
            start_time_us: fs.start_time,
            duration_us: fs.duration,
            status_code,
            status_message,
            attributes,
            event_names,
            event_times_us,
            event_attrs,
            process_id: fs.process_id.clone(),
            resource_attrs: string_map(&fs.process_tags),
            sampled: fs.sampled,
            baggage: string_map(&fs.baggage),
            timestamp_us: fs.start_time,
        }
    }
}

impl From<FlatSpan> for StorageSpan {
    fn from(fs: FlatSpan) -> Self {
        StorageSpan::from(&fs)
    }
}

fn string_map(tags: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    tags.iter().map(|(k, v)| (k.clone(), tag_to_string(v))).collect()
}

fn flatten_logs(logs: &[SpanLog]) -> (Vec<String>, Vec<i64>, Vec<BTreeMap<String, String>>) {
    let mut names = Vec::with_capacity(logs.len());
    let mut times = Vec::with_capacity(logs.len());
    let mut attrs = Vec::with_capacity(logs.len());

    for log in logs {
        let name = log
            .fields
            .get("event")
            .map(tag_to_string)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string());
        names.push(name);
        times.push(log.timestamp);
        attrs.push(string_map(&log.fields));
    }

    (names, times, attrs)
}

fn infer_kind(tags: &BTreeMap<String, Value>) -> String {
    match tags.get("span.kind").map(tag_to_string) {
        Some(kind) if !kind.is_empty() => kind.to_uppercase(),
        _ => KIND_INTERNAL.to_string(),
    }
}

fn infer_status(tags: &BTreeMap<String, Value>) -> (String, String) {
    let is_error = tags
        .get("error")
        .map(tag_to_string)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if is_error {
        let message = tags.get("error.message").map(tag_to_string).unwrap_or_default();
        (STATUS_ERROR.to_string(), message)
    } else {
        (STATUS_OK.to_string(), String::new())
    }
}
