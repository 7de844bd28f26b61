use crate::error::{IngestError, Result};
use crate::model::FlatSpan;

/// Checks that a span carries the fields assembly depends on
#[derive(Debug, Default, Clone)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, span: &FlatSpan) -> Result<()> {
        if span.trace_id.is_empty() || span.span_id.is_empty() {
            return Err(IngestError::Validation("missing trace or span id".into()));
        }
        if span.service_name.is_empty() {
            return Err(IngestError::Validation("service name is required".into()));
        }
        if span.start_time <= 0 {
            return Err(IngestError::Validation(format!(
                "invalid start time {}",
                span.start_time
            )));
        }
        Ok(())
    }
}
