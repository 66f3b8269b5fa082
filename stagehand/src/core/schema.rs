//! JSON Schema checks for extracted stage payloads.

use anyhow::{Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

/// Validate `payload` against `schema`, returning every violation in one message.
pub fn validate_payload(schema: &Value, payload: &Value) -> Result<()> {
    let compiled = validator_for(schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages = compiled
        .iter_errors(payload)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    if messages.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "payload schema validation failed: {}",
        messages.join("; ")
    ))
}
