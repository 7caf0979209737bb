//! Provider prompt rendering for live agent execution.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::{Map, Value};

use crate::agents::contract::AgentDefinition;

const AGENT_REQUEST_TEMPLATE: &str = include_str!("prompts/agent_request.md");

/// Render the full provider prompt for one agent call.
///
/// The contract's raw prompt body is followed by the projected input as JSON
/// and the declared output skeleton, so the backend sees the complete
/// contract it must satisfy.
pub fn render_agent_prompt(
    definition: &AgentDefinition,
    input: &Map<String, Value>,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("agent_request", AGENT_REQUEST_TEMPLATE)
        .expect("agent request template should be valid");

    let input_json =
        serde_json::to_string_pretty(&Value::Object(input.clone())).context("serialize input")?;
    let output_skeleton = if definition.output_schema.fields().is_empty() {
        None
    } else {
        Some(
            serde_json::to_string_pretty(definition.output_schema.skeleton())
                .context("serialize output skeleton")?,
        )
    };

    let template = env
        .get_template("agent_request")
        .expect("agent request template is registered");
    let rendered = template
        .render(context! {
            prompt_body => definition.prompt.trim(),
            input_json => input_json,
            output_skeleton => output_skeleton,
        })
        .context("render agent request")?;
    Ok(rendered)
}
