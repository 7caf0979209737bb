//! Orchestration of ordered agent chains with state passing between steps.
//!
//! Steps run strictly in order on one logical worker; concurrency exists
//! only across independent chain invocations. Chains targeting the same
//! repository serialize on the state manager's per-repository lock. Every
//! halt path persists exactly one [`ChainRun`].

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Result, anyhow};
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::projector::project;
use crate::core::types::{
    AgentResult, AgentStatus, ChainRun, ChainStatus, ExecutionMode, utc_timestamp,
};
use crate::harness::{ExecutionContext, ExecutionHarness};
use crate::io::provider::Provider;
use crate::io::state::StateManager;

/// A single step in an agent chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStep {
    pub agent_name: String,
    /// Input mapping expression (`null`, `$.key`, `$.a,$.b`).
    #[serde(default)]
    pub input_mapping: Option<String>,
    /// State-bag key the step's result is stored under.
    #[serde(default)]
    pub output_key: Option<String>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl ChainStep {
    pub fn new(agent_name: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            input_mapping: None,
            output_key: None,
            continue_on_failure: false,
        }
    }

    pub fn with_mapping(mut self, mapping: &str) -> Self {
        self.input_mapping = Some(mapping.to_string());
        self
    }

    pub fn with_output_key(mut self, key: &str) -> Self {
        self.output_key = Some(key.to_string());
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// Definition of an agent execution chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainDefinition {
    pub name: String,
    pub description: String,
    pub steps: Vec<ChainStep>,
    #[serde(default)]
    pub initial_state: Map<String, Value>,
}

impl ChainDefinition {
    /// Reject empty chains and duplicate output keys.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(anyhow!("chain '{}' has no steps defined", self.name));
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if let Some(key) = &step.output_key
                && !seen.insert(key.clone())
            {
                return Err(anyhow!(
                    "chain '{}' reuses output key '{key}'",
                    self.name
                ));
            }
        }
        Ok(())
    }

    /// Standard discovery analysis chain.
    pub fn discovery() -> Self {
        Self {
            name: "discovery_analysis".to_string(),
            description: "Scan repository and generate an initial report".to_string(),
            steps: vec![
                ChainStep::new("discovery").with_output_key("discovery"),
                ChainStep::new("stackmap")
                    .with_mapping("$.discovery")
                    .with_output_key("stackmap"),
                ChainStep::new("report_writer")
                    .with_mapping("$.discovery,$.stackmap")
                    .with_output_key("report"),
            ],
            initial_state: Map::new(),
        }
    }

    /// Security scanning chain.
    pub fn security_scan() -> Self {
        Self {
            name: "security_scan".to_string(),
            description: "Scan for secrets and security risks".to_string(),
            steps: vec![
                ChainStep::new("discovery").with_output_key("discovery"),
                ChainStep::new("secrets_and_risk")
                    .with_mapping("$.discovery")
                    .with_output_key("security"),
                ChainStep::new("next_steps")
                    .with_mapping("$.security")
                    .with_output_key("recommendations"),
            ],
            initial_state: Map::new(),
        }
    }
}

/// Optional observers for chain progress.
#[derive(Default)]
pub struct ChainCallbacks<'a> {
    pub on_step: Option<&'a dyn Fn(&AgentResult)>,
    pub on_complete: Option<&'a dyn Fn(&ChainRun)>,
}

/// Generate a run id sortable by start time: `run_<UTC stamp>_<suffix>`.
///
/// Callers must not depend on the exact form beyond sortability.
fn generate_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!("run_{stamp}_{}", suffix.to_ascii_lowercase())
}

/// Multi-agent orchestration engine.
pub struct Orchestrator {
    harness: ExecutionHarness,
    state: Arc<StateManager>,
}

impl Orchestrator {
    pub fn new(harness: ExecutionHarness, state: Arc<StateManager>) -> Self {
        Self { harness, state }
    }

    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Execute a chain against a repository under one mode.
    ///
    /// `cancel` is checked between steps; the in-flight step always
    /// completes, then the chain halts with status `manual`.
    #[instrument(skip_all, fields(chain = %chain.name, mode = ?mode))]
    pub fn execute<P: Provider>(
        &self,
        provider: &P,
        chain: &ChainDefinition,
        repo_root: &Path,
        mode: ExecutionMode,
        callbacks: &ChainCallbacks<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<ChainRun> {
        chain.validate()?;

        let run_id = generate_run_id();
        let started_at = utc_timestamp();
        let start = Instant::now();
        let root = std::path::absolute(repo_root)
            .unwrap_or_else(|_| repo_root.to_path_buf());
        info!(run_id = %run_id, root = %root.display(), "chain started");

        // Chains touching the same repository serialize within this process.
        // The guard covers step execution only; record_chain_run takes the
        // same lock internally for its state writes.
        let repo_lock = self.state.repository_lock(&root);
        let guard = repo_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut bag = chain.initial_state.clone();
        bag.insert(
            "repository_root".to_string(),
            Value::String(root.display().to_string()),
        );

        let mut results: Vec<AgentResult> = Vec::new();
        let mut status = ChainStatus::Completed;
        let mut error: Option<String> = None;

        for (index, step) in chain.steps.iter().enumerate() {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                warn!(step = index, "chain cancelled");
                status = ChainStatus::Manual;
                error = Some(format!("cancelled before step {index} ({})", step.agent_name));
                break;
            }

            let projection = project(step.input_mapping.as_deref(), &bag);
            let context = ExecutionContext {
                repository_root: root.clone(),
                mode,
                correlation_id: format!("{run_id}:{index}"),
                chain_run_id: Some(run_id.clone()),
                projection_warnings: projection.warnings,
            };

            let result =
                self.harness
                    .execute(provider, &step.agent_name, &projection.input, &context)?;
            debug!(step = index, agent = %step.agent_name, status = ?result.status, "step finished");

            if let Some(on_step) = callbacks.on_step {
                on_step(&result);
            }

            let stop_requested = result.status == AgentStatus::Completed
                && result
                    .output
                    .get("stop_chain")
                    .is_some_and(|v| v.as_bool() == Some(true));

            // Store the result even on failure so downstream steps can
            // observe it when continue_on_failure is set.
            if let Some(key) = &step.output_key {
                let value = if result.status == AgentStatus::Completed {
                    Value::Object(result.output.clone())
                } else {
                    json!({
                        "error": result.error,
                        "status": result.status,
                        "agent": step.agent_name,
                    })
                };
                bag.insert(key.clone(), value);
            }

            let step_status = result.status;
            let step_error = result.error.clone();
            results.push(result);

            if step_status != AgentStatus::Completed {
                if step.continue_on_failure {
                    continue;
                }
                status = if step_status == AgentStatus::Stopped {
                    ChainStatus::PrecheckFailed
                } else {
                    ChainStatus::AgentFailed
                };
                error = step_error;
                break;
            }

            if stop_requested {
                info!(step = index, agent = %step.agent_name, "stop condition raised");
                status = ChainStatus::StopCondition;
                break;
            }
        }

        let run = ChainRun {
            run_id,
            chain_name: chain.name.clone(),
            repository_root: root.display().to_string(),
            status,
            started_at,
            completed_at: utc_timestamp(),
            execution_time_ms: start.elapsed().as_millis() as u64,
            mode,
            agent_results: results,
            final_state: bag,
            error,
        };

        drop(guard);
        self.state.record_chain_run(&run)?;
        if let Some(on_complete) = callbacks.on_complete {
            on_complete(&run);
        }
        info!(run_id = %run.run_id, status = ?run.status, "chain finished");
        Ok(run)
    }

    /// Human-readable rendering of a chain run for front-ends.
    pub fn summary(run: &ChainRun) -> String {
        let mut lines = vec![
            format!("Chain: {}", run.chain_name),
            format!("Run: {}", run.run_id),
            format!(
                "Status: {}",
                serde_json::to_value(run.status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            ),
            format!("Steps: {}", run.agent_results.len()),
        ];
        for (index, result) in run.agent_results.iter().enumerate() {
            let glyph = if result.is_success() { "ok" } else { "failed" };
            lines.push(format!(
                "  [{}] {} {} ({}ms)",
                index + 1,
                result.agent_name,
                glyph,
                result.execution_time_ms
            ));
            if let Some(error) = &result.error {
                lines.push(format!("      error: {error}"));
            }
        }
        if let Some(error) = &run.error {
            lines.push(format!("Error: {error}"));
        }
        lines.join("\n")
    }
}
