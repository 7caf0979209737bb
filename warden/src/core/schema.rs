//! Output-shape contracts declared by agents.
//!
//! A contract's OUTPUT block is a JSON object skeleton: every top-level key
//! is a required field and the skeleton value's JSON type is the permitted
//! type (a `null` skeleton value permits any type). The same model drives
//! both validation of live provider output and synthesis of simulated output.

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};

use crate::core::types::utc_timestamp;

/// Permitted JSON type for one output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn of(value: &Value) -> FieldKind {
        match value {
            Value::String(_) => FieldKind::String,
            Value::Number(_) => FieldKind::Number,
            Value::Bool(_) => FieldKind::Boolean,
            Value::Array(_) => FieldKind::Array,
            Value::Object(_) => FieldKind::Object,
            Value::Null => FieldKind::Any,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }
}

/// One required output field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputField {
    pub name: String,
    pub kind: FieldKind,
}

/// Parsed output contract for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    fields: Vec<OutputField>,
    skeleton: Value,
}

impl OutputSchema {
    /// Build from a JSON object skeleton.
    pub fn from_skeleton(skeleton: Value) -> Result<OutputSchema> {
        let Some(object) = skeleton.as_object() else {
            return Err(anyhow!("output skeleton must be a JSON object"));
        };
        let fields = object
            .iter()
            .map(|(name, value)| OutputField {
                name: name.clone(),
                kind: FieldKind::of(value),
            })
            .collect();
        Ok(OutputSchema { fields, skeleton })
    }

    /// Schema with no required fields (accepts any object).
    pub fn empty() -> OutputSchema {
        OutputSchema {
            fields: Vec::new(),
            skeleton: Value::Object(Map::new()),
        }
    }

    pub fn fields(&self) -> &[OutputField] {
        &self.fields
    }

    /// The raw skeleton, for prompt rendering.
    pub fn skeleton(&self) -> &Value {
        &self.skeleton
    }

    /// Check a produced output against the contract.
    ///
    /// Returns one message per violation, each naming the offending field.
    pub fn violations(&self, output: &Value) -> Vec<String> {
        let Some(object) = output.as_object() else {
            return vec!["output is not a JSON object".to_string()];
        };
        let mut errors = Vec::new();
        for field in &self.fields {
            match object.get(&field.name) {
                None => errors.push(format!("required field '{}' is missing", field.name)),
                Some(value) if !field.kind.matches(value) => errors.push(format!(
                    "field '{}' must be of type {}",
                    field.name,
                    field.kind.describe()
                )),
                Some(_) => {}
            }
        }
        errors
    }

    /// Synthesize a minimal output matching the contract (simulated mode).
    ///
    /// Required fields are filled with schema-appropriate defaults: empty
    /// arrays, zero numbers, sentinel strings, and current-wall-clock ISO
    /// timestamps for time-like field names.
    pub fn synthesize(&self) -> Map<String, Value> {
        let mut output = Map::new();
        for field in &self.fields {
            let value = match field.kind {
                FieldKind::Array => Value::Array(Vec::new()),
                FieldKind::Number => Value::from(0),
                FieldKind::Boolean => Value::Bool(false),
                FieldKind::Object => Value::Object(Map::new()),
                FieldKind::String if is_time_like(&field.name) => {
                    Value::String(utc_timestamp())
                }
                FieldKind::String => Value::String("simulated".to_string()),
                FieldKind::Any => Value::Null,
            };
            output.insert(field.name.clone(), value);
        }
        output
    }
}

fn is_time_like(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("timestamp") || lower.contains("time") || lower.ends_with("_at")
}
