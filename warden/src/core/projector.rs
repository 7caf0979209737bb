//! Evaluator for the chain input-mapping path language.
//!
//! Grammar:
//! - empty/null mapping: use the entire state bag;
//! - `$.key`: an object holding `key` from the state bag;
//! - `$.a,$.b,...`: a merged object; later keys shadow earlier ones on
//!   collision, with a warning carried into the step's audit record.
//!
//! A reference to an absent key resolves to an explicit null at that key
//! rather than aborting; whether that null is acceptable is decided by the
//! agent's input prechecks.

use serde_json::{Map, Value};

/// Outcome of projecting a step input from the state bag.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub input: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Build a step's input from the state bag using its mapping expression.
pub fn project(mapping: Option<&str>, state: &Map<String, Value>) -> Projection {
    let Some(expr) = mapping.map(str::trim).filter(|e| !e.is_empty()) else {
        return Projection {
            input: state.clone(),
            warnings: Vec::new(),
        };
    };

    let mut input = Map::new();
    let mut warnings = Vec::new();
    for part in expr.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (key, value) = match part.strip_prefix("$.") {
            Some(key) => (
                key.to_string(),
                state.get(key).cloned().unwrap_or(Value::Null),
            ),
            // A bare token is passed through as a literal input value.
            None => ("input".to_string(), Value::String(part.to_string())),
        };
        if input.insert(key.clone(), value).is_some() {
            warnings.push(format!("projection key '{key}' shadows an earlier value"));
        }
    }

    Projection { input, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag() -> Map<String, Value> {
        let mut bag = Map::new();
        bag.insert("discovery".to_string(), json!({"files": 3}));
        bag.insert("health".to_string(), json!({"score": 0.9}));
        bag
    }

    #[test]
    fn empty_mapping_yields_the_full_state_bag() {
        let state = bag();
        assert_eq!(project(None, &state).input, state);
        assert_eq!(project(Some("  "), &state).input, state);
    }

    #[test]
    fn single_key_yields_one_entry_object() {
        let projection = project(Some("$.discovery"), &bag());
        assert_eq!(projection.input.len(), 1);
        assert_eq!(projection.input["discovery"], json!({"files": 3}));
        assert!(projection.warnings.is_empty());
    }

    #[test]
    fn merged_keys_are_taken_in_order() {
        let projection = project(Some("$.discovery,$.health"), &bag());
        assert_eq!(
            projection.input.keys().collect::<Vec<_>>(),
            vec!["discovery", "health"]
        );
    }

    #[test]
    fn absent_key_resolves_to_explicit_null() {
        let projection = project(Some("$.missing"), &bag());
        assert_eq!(projection.input["missing"], Value::Null);
        assert!(projection.warnings.is_empty());
    }

    #[test]
    fn colliding_keys_shadow_with_a_warning() {
        let mut state = bag();
        state.insert("discovery".to_string(), json!({"files": 3}));
        let projection = project(Some("$.discovery,$.discovery"), &state);
        assert_eq!(projection.input.len(), 1);
        assert_eq!(projection.warnings.len(), 1);
        assert!(projection.warnings[0].contains("discovery"));
    }

    #[test]
    fn bare_token_is_passed_through_as_literal_input() {
        let projection = project(Some("full"), &bag());
        assert_eq!(projection.input["input"], json!("full"));
    }
}
