//! Chain definition load helpers with schema validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use std::sync::LazyLock;

use crate::chain::ChainDefinition;

const CHAIN_SCHEMA: &str = include_str!("../../schemas/chain.schema.json");

static CHAIN_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(CHAIN_SCHEMA).expect("embedded chain schema should be valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("embedded chain schema should compile")
});

/// Load and validate a chain definition from a JSON document.
///
/// Validation is two-phase: JSON Schema conformance first, then semantic
/// checks (non-empty steps, unique output keys) via
/// [`ChainDefinition::validate`].
pub fn load_chain(path: &Path) -> Result<ChainDefinition> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read chain {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse chain {}", path.display()))?;
    validate_schema(&value)
        .with_context(|| format!("validate chain {}", path.display()))?;
    let chain: ChainDefinition = serde_json::from_value(value)
        .with_context(|| format!("deserialize chain {}", path.display()))?;
    chain.validate()?;
    Ok(chain)
}

/// Write a chain definition as pretty-printed JSON.
pub fn write_chain(path: &Path, chain: &ChainDefinition) -> Result<()> {
    chain.validate()?;
    let mut buf = serde_json::to_string_pretty(chain)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write chain {}", path.display()))
}

fn validate_schema(value: &Value) -> Result<()> {
    let messages: Vec<String> = CHAIN_VALIDATOR
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "chain schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
