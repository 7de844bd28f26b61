//! Span data model
//!
//! `FlatSpan` is the wire unit handed over by the collector through the log,
//! `StorageSpan` is the row-shaped unit persisted by storage.

pub mod flat_span;
pub mod storage_span;

pub use flat_span::{FlatSpan, RefType, SpanLog, SpanReference};
pub use storage_span::{StorageSpan, STATUS_ERROR, STATUS_OK};

use serde_json::Value;

/// Render a scalar tag value as a string.
/// Strings are taken verbatim, null becomes empty, everything else is JSON text.
pub fn tag_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
