use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use xxhash_rust::xxh3::Xxh3;

use crate::model::{tag_to_string, FlatSpan};

pub const INGESTED_AT_TAG: &str = "ingested_at";

/// Below this magnitude a start time is taken to be in seconds
const SECONDS_THRESHOLD: i64 = 1_000_000_000_000;

/// Standardizes spans before routing
#[derive(Debug, Default, Clone)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, span: &mut FlatSpan) {
        self.normalize_at(span, Utc::now());
    }

    pub fn normalize_at(&self, span: &mut FlatSpan, now: DateTime<Utc>) {
        span.service_name = span.service_name.to_lowercase();

        span.tags.insert(
            INGESTED_AT_TAG.to_string(),
            Value::String(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );

        // best effort only, a real microsecond value this small is indistinguishable
        if span.start_time < SECONDS_THRESHOLD {
            span.start_time = span.start_time.saturating_mul(1000);
        }

        if span.process_id.is_empty() {
            span.process_id = derive_process_id(span);
        }
    }
}

/// Stable id from service name and sorted process tags
fn derive_process_id(span: &FlatSpan) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(span.service_name.as_bytes());
    for (k, v) in &span.process_tags {
        hasher.update(k.as_bytes());
        hasher.update(tag_to_string(v).as_bytes());
    }
    format!("{:016x}", hasher.digest())
}
