use anyhow::Result;
use bench_core::ProgressEvent;
use bench_schemas::{compile_schema, validate_value, PROGRESS_EVENT_SCHEMA};
use jsonschema::JSONSchema;
use serde_json::Value;

/// Decodes structured progress lines interleaved with an agent's plain
/// transcript output. Anything that is not a schema-valid event is ignored.
pub struct ProgressDecoder {
    schema: JSONSchema,
}

impl ProgressDecoder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            schema: compile_schema(PROGRESS_EVENT_SCHEMA)?,
        })
    }

    pub fn decode(&self, line: &str) -> Option<ProgressEvent> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(trimmed).ok()?;
        if validate_value(&self.schema, &value).is_err() {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}
