use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Flattened span as published by the collector, one log message per span.
/// Field aliases accept the collector's Go-style key names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatSpan {
    #[serde(alias = "TraceID")]
    pub trace_id: String,
    #[serde(alias = "SpanID")]
    pub span_id: String,
    #[serde(alias = "ParentSpanID")]
    pub parent_span_id: String,
    #[serde(alias = "OperationName")]
    pub operation_name: String,
    #[serde(alias = "ServiceName")]
    pub service_name: String,
    /// Start time in microseconds since epoch
    #[serde(alias = "StartTime")]
    pub start_time: i64,
    /// Duration in microseconds
    #[serde(alias = "Duration")]
    pub duration: i64,
    #[serde(alias = "Tags")]
    pub tags: BTreeMap<String, Value>,
    #[serde(alias = "ProcessID")]
    pub process_id: String,
    #[serde(alias = "ProcessTags")]
    pub process_tags: BTreeMap<String, Value>,
    #[serde(alias = "Logs")]
    pub logs: Vec<SpanLog>,
    #[serde(alias = "References")]
    pub references: Vec<SpanReference>,
    #[serde(alias = "Sampled")]
    pub sampled: bool,
    #[serde(alias = "Baggage")]
    pub baggage: BTreeMap<String, Value>,
}

/// Timestamped structured log attached to a span
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanLog {
    /// Microseconds since epoch
    #[serde(alias = "Timestamp")]
    pub timestamp: i64,
    #[serde(alias = "Fields")]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanReference {
    #[serde(alias = "TraceID", default)]
    pub trace_id: String,
    #[serde(alias = "SpanID", default)]
    pub span_id: String,
    #[serde(alias = "RefType", default)]
    pub ref_type: RefType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefType {
    #[default]
    #[serde(rename = "CHILD_OF")]
    ChildOf,
    #[serde(rename = "FOLLOWS_FROM", alias = "FOLLOW_FROM", alias = "FOLLOW_FROm")]
    FollowsFrom,
}

impl FlatSpan {
    /// Parent id, falling back to the first CHILD_OF reference
    pub fn effective_parent(&self) -> &str {
        if !self.parent_span_id.is_empty() {
            return &self.parent_span_id;
        }
        self.references
            .iter()
            .find(|r| r.ref_type == RefType::ChildOf && !r.span_id.is_empty())
            .map(|r| r.span_id.as_str())
            .unwrap_or("")
    }
}
