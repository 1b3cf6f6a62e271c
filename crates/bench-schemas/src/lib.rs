//! JSON schemas for the files the campaign runner reads and writes,
//! embedded at build time.

use anyhow::{anyhow, Context, Result};
use include_dir::{include_dir, Dir};
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

pub const BENCHMARK_METADATA_SCHEMA: &str = "benchmark_metadata_v1.json";
pub const CAMPAIGN_STATE_SCHEMA: &str = "campaign_state_v1.json";
pub const CAMPAIGN_SUMMARY_SCHEMA: &str = "campaign_summary_v1.json";
pub const PROGRESS_EVENT_SCHEMA: &str = "progress_event_v1.json";

/// File names of every embedded schema, sorted.
pub fn schema_names() -> Vec<String> {
    let mut names: Vec<String> = SCHEMAS_DIR
        .files()
        .filter_map(|f| f.path().file_name())
        .map(|n| n.to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

pub fn load_schema(name: &str) -> Result<Value> {
    let file = SCHEMAS_DIR
        .get_file(name)
        .ok_or_else(|| anyhow!("schema not found: {}", name))?;
    let data = std::str::from_utf8(file.contents())
        .with_context(|| format!("schema {} is not UTF-8", name))?;
    serde_json::from_str(data).with_context(|| format!("schema {} is not valid JSON", name))
}

/// Compiles an embedded schema as draft 7.
pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|e| anyhow!("schema {} failed to compile: {}", name, e))?;
    Ok(compiled)
}

/// Validates `value`, joining every violation into one error message.
pub fn validate_value(schema: &JSONSchema, value: &Value) -> Result<()> {
    if let Err(errors) = schema.validate(value) {
        let msgs: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        return Err(anyhow!("schema validation failed: {}", msgs.join("; ")));
    }
    Ok(())
}
