//! Execution harness for a single agent: prechecks, mode dispatch, output
//! validation, retries, and audit emission.
//!
//! The harness never touches the network itself; live calls go through the
//! [`Provider`] seam. Every terminal outcome emits exactly one execution
//! audit record, plus one attempt record per provider call in live mode.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::agents::contract::AgentDefinition;
use crate::agents::registry::AgentRegistry;
use crate::core::types::{
    AgentResult, AgentStatus, ErrorKind, ExecutionMode, utc_timestamp,
};
use crate::io::audit::{AuditSink, ExecutionEvent, ExecutionRecord};
use crate::io::config::ProviderConfig;
use crate::io::prompt::render_agent_prompt;
use crate::io::provider::{Provider, ProviderFault, ProviderRequest};

/// Context carried through one agent execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub repository_root: std::path::PathBuf,
    pub mode: ExecutionMode,
    pub correlation_id: String,
    pub chain_run_id: Option<String>,
    /// Warnings from input projection, carried into the audit record.
    pub projection_warnings: Vec<String>,
}

/// Harness tuning derived from [`ProviderConfig`].
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub timeout: Duration,
    pub max_tokens: u32,
}

impl From<&ProviderConfig> for HarnessSettings {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            timeout: Duration::from_secs(config.timeout_secs),
            max_tokens: config.max_tokens,
        }
    }
}

/// Exponential backoff schedule: `base, 2*base, 4*base, ...` for attempts
/// `1, 2, 3, ...`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Uniform jitter in `[0, base/2)`, added to every backoff delay.
fn jitter(base: Duration) -> Duration {
    let half = (base.as_millis() / 2) as u64;
    if half == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..half))
}

/// Harness for safe, deterministic agent execution.
pub struct ExecutionHarness {
    registry: Arc<AgentRegistry>,
    audit: AuditSink,
    settings: HarnessSettings,
}

/// Internal terminal outcome of the mode dispatch.
struct Outcome {
    status: AgentStatus,
    output: Map<String, Value>,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
    raw_response: Option<String>,
}

impl Outcome {
    fn completed(output: Map<String, Value>) -> Self {
        Self {
            status: AgentStatus::Completed,
            output,
            error: None,
            error_kind: None,
            raw_response: None,
        }
    }

    fn failed(kind: ErrorKind, error: String, raw_response: Option<String>) -> Self {
        Self {
            status: AgentStatus::Failed,
            output: Map::new(),
            error: Some(error),
            error_kind: Some(kind),
            raw_response,
        }
    }

    fn stopped(kind: ErrorKind, error: String) -> Self {
        Self {
            status: AgentStatus::Stopped,
            output: Map::new(),
            error: Some(error),
            error_kind: Some(kind),
            raw_response: None,
        }
    }
}

impl ExecutionHarness {
    pub fn new(registry: Arc<AgentRegistry>, audit: AuditSink, settings: HarnessSettings) -> Self {
        Self {
            registry,
            audit,
            settings,
        }
    }

    /// Execute one agent under the context's mode.
    ///
    /// Always returns an [`AgentResult`] for agent-level failures; `Err` is
    /// reserved for engine-level faults (audit I/O, prompt rendering).
    #[instrument(skip_all, fields(agent = agent_name, mode = ?context.mode))]
    pub fn execute<P: Provider>(
        &self,
        provider: &P,
        agent_name: &str,
        input: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<AgentResult> {
        let started_at = utc_timestamp();
        let start = Instant::now();

        let (outcome, class) = match self.registry.get(agent_name) {
            None => (
                Outcome::stopped(
                    ErrorKind::NotRegistered,
                    format!("agent '{agent_name}' not found in registry"),
                ),
                "unknown".to_string(),
            ),
            Some(agent) => {
                let class = agent.class.as_str().to_string();
                let outcome = match prechecks(&agent, input, context) {
                    Err(message) => {
                        warn!(%message, "prechecks failed");
                        Outcome::stopped(ErrorKind::PrecheckFailed, message)
                    }
                    Ok(()) => match context.mode {
                        ExecutionMode::DryRun => Outcome::completed(Map::new()),
                        ExecutionMode::Simulated => {
                            Outcome::completed(agent.output_schema.synthesize())
                        }
                        ExecutionMode::Live => {
                            self.live(provider, &agent, input, context)?
                        }
                    },
                };
                (outcome, class)
            }
        };

        let result = AgentResult {
            agent_name: agent_name.to_string(),
            status: outcome.status,
            started_at,
            completed_at: utc_timestamp(),
            execution_time_ms: start.elapsed().as_millis() as u64,
            output: outcome.output,
            error: outcome.error,
            error_kind: outcome.error_kind,
            mode: context.mode,
        };

        self.audit.append_execution(&ExecutionRecord {
            timestamp: result.completed_at.clone(),
            event: ExecutionEvent::Execution,
            agent_name: result.agent_name.clone(),
            agent_class: class,
            status: result.status,
            execution_time_ms: result.execution_time_ms,
            mode: context.mode,
            correlation_id: context.correlation_id.clone(),
            chain_run_id: context.chain_run_id.clone(),
            error_kind: result.error_kind,
            error: result.error.clone(),
            raw_response: outcome.raw_response,
            projection_warnings: context.projection_warnings.clone(),
        })?;

        Ok(result)
    }

    /// Live-mode provider loop: retry transient faults with capped
    /// exponential backoff; never retry invalid JSON or validation failures.
    fn live<P: Provider>(
        &self,
        provider: &P,
        agent: &AgentDefinition,
        input: &Map<String, Value>,
        context: &ExecutionContext,
    ) -> Result<Outcome> {
        let request = ProviderRequest {
            system: None,
            prompt: render_agent_prompt(agent, input)?,
            max_tokens: self.settings.max_tokens,
            temperature: 0.0,
            response_format: Some("json".to_string()),
            timeout: self.settings.timeout,
        };

        for attempt in 1..=self.settings.max_attempts {
            let attempt_start = Instant::now();
            let call = provider.complete(&request);
            self.audit_attempt(agent, context, &call, attempt_start)?;

            match call {
                Ok(response) => {
                    let raw = String::from_utf8_lossy(&response.body).to_string();
                    let value: Value = match serde_json::from_slice(&response.body) {
                        Ok(value) => value,
                        Err(err) => {
                            return Ok(Outcome::failed(
                                ErrorKind::InvalidJson,
                                format!("provider response is not JSON: {err}"),
                                Some(raw),
                            ));
                        }
                    };
                    let violations = agent.output_schema.violations(&value);
                    if !violations.is_empty() {
                        return Ok(Outcome::failed(
                            ErrorKind::ValidationFailed,
                            format!("output validation failed: {}", violations.join("; ")),
                            Some(raw),
                        ));
                    }
                    let Value::Object(output) = value else {
                        // violations() rejects non-objects above.
                        return Ok(Outcome::failed(
                            ErrorKind::ValidationFailed,
                            "output is not a JSON object".to_string(),
                            Some(raw),
                        ));
                    };
                    debug!(attempt, "live call completed");
                    return Ok(Outcome::completed(output));
                }
                Err(err) => {
                    if err.fault == ProviderFault::Transient && attempt < self.settings.max_attempts
                    {
                        let delay =
                            backoff_delay(self.settings.backoff_base, attempt)
                                + jitter(self.settings.backoff_base);
                        warn!(attempt, delay_ms = delay.as_millis() as u64, "transient provider failure, backing off");
                        std::thread::sleep(delay);
                        continue;
                    }
                    let kind = err.terminal_kind();
                    let message = match kind {
                        ErrorKind::ProviderTransientExhausted => format!(
                            "provider transient failures exhausted {} attempts: {}",
                            self.settings.max_attempts, err.message
                        ),
                        _ => err.message,
                    };
                    return Ok(Outcome::failed(kind, message, None));
                }
            }
        }
        // max_attempts >= 1 is enforced by config validation.
        Ok(Outcome::failed(
            ErrorKind::ProviderTransientExhausted,
            "provider retries exhausted".to_string(),
            None,
        ))
    }

    fn audit_attempt<T>(
        &self,
        agent: &AgentDefinition,
        context: &ExecutionContext,
        call: &Result<T, crate::io::provider::ProviderError>,
        attempt_start: Instant,
    ) -> Result<()> {
        let (status, error_kind, error) = match call {
            Ok(_) => (AgentStatus::Completed, None, None),
            Err(err) => {
                let kind = match err.fault {
                    ProviderFault::Transient => ErrorKind::ProviderTransient,
                    ProviderFault::Permanent => ErrorKind::ProviderPermanent,
                    ProviderFault::Timeout => ErrorKind::ProviderTimeout,
                };
                (AgentStatus::Failed, Some(kind), Some(err.message.clone()))
            }
        };
        self.audit.append_execution(&ExecutionRecord {
            timestamp: utc_timestamp(),
            event: ExecutionEvent::Attempt,
            agent_name: agent.name.clone(),
            agent_class: agent.class.as_str().to_string(),
            status,
            execution_time_ms: attempt_start.elapsed().as_millis() as u64,
            mode: context.mode,
            correlation_id: context.correlation_id.clone(),
            chain_run_id: context.chain_run_id.clone(),
            error_kind,
            error,
            raw_response: None,
            projection_warnings: Vec::new(),
        })
    }
}

/// Validate everything that must hold before any provider interaction.
fn prechecks(
    agent: &AgentDefinition,
    input: &Map<String, Value>,
    context: &ExecutionContext,
) -> std::result::Result<(), String> {
    let root = &context.repository_root;
    if !root.exists() {
        return Err(format!("repository_root does not exist: {}", root.display()));
    }
    if !root.is_dir() {
        return Err(format!(
            "repository_root is not a directory: {}",
            root.display()
        ));
    }
    if std::fs::read_dir(root).is_err() {
        return Err(format!(
            "repository_root is not readable: {}",
            root.display()
        ));
    }

    for field in agent.required_inputs() {
        // repository_root is always supplied through the context.
        if field == "repository_root" {
            continue;
        }
        match input.get(field) {
            None => return Err(format!("missing required input: {field}")),
            Some(value) if is_empty(value) => {
                return Err(format!("required input is empty: {field}"));
            }
            Some(_) => {}
        }
    }

    if let Some(targets) = input.get("write_targets") {
        let Some(targets) = targets.as_array() else {
            return Err("write_targets must be an array of paths".to_string());
        };
        for target in targets {
            let Some(target) = target.as_str() else {
                return Err("write_targets entries must be strings".to_string());
            };
            if !agent.allows_write_to(root, Path::new(target)) {
                return Err(format!(
                    "agent '{}' may not write to '{target}'",
                    agent.name
                ));
            }
        }
    }

    Ok(())
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ExecutionMode;
    use crate::io::provider::{ProviderError, ProviderResponse};
    use crate::test_support::{ScriptedProvider, TestEnv, contract_source};
    use serde_json::json;

    fn context(env: &TestEnv, mode: ExecutionMode) -> ExecutionContext {
        ExecutionContext {
            repository_root: env.repo_root.clone(),
            mode,
            correlation_id: "test:0".to_string(),
            chain_run_id: None,
            projection_warnings: Vec::new(),
        }
    }

    fn base_input() -> Map<String, Value> {
        let mut input = Map::new();
        input.insert("repository_root".to_string(), json!("/repo"));
        input
    }

    #[test]
    fn dry_run_completes_with_empty_output() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::empty();

        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::DryRun),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Completed);
        assert!(result.output.is_empty());
        assert_eq!(provider.calls(), 0);
        assert_eq!(env.execution_records().len(), 1);
    }

    #[test]
    fn simulated_output_matches_the_declared_schema() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::empty();

        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::Simulated),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Completed);
        assert_eq!(result.output["status"], json!("simulated"));
        assert_eq!(result.output["files"], json!([]));
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn unknown_agent_stops_with_not_registered() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::empty();

        let result = harness
            .execute(
                &provider,
                "nonexistent",
                &base_input(),
                &context(&env, ExecutionMode::Live),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Stopped);
        assert_eq!(result.error_kind, Some(ErrorKind::NotRegistered));
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn missing_repository_root_stops_before_any_provider_call() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::empty();

        let mut ctx = context(&env, ExecutionMode::Live);
        ctx.repository_root = env.repo_root.join("nope");
        let result = harness
            .execute(&provider, "discovery", &base_input(), &ctx)
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Stopped);
        assert_eq!(result.error_kind, Some(ErrorKind::PrecheckFailed));
        assert!(result.error.as_deref().unwrap_or("").contains("does not exist"));
        assert_eq!(provider.calls(), 0);
        assert_eq!(env.execution_records().len(), 1);
    }

    #[test]
    fn null_required_input_fails_prechecks() {
        let env = TestEnv::new().expect("env");
        let source = contract_source("strict", "read-only-scan")
            .replace("- focus", "- focus (required)");
        std::fs::write(env.agents_dir.join("strict.md"), source).expect("write contract");
        let registry = Arc::new(AgentRegistry::load(&env.agents_dir).expect("load"));
        let harness = ExecutionHarness::new(
            registry,
            env.audit(),
            HarnessSettings {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
                max_tokens: 512,
            },
        );
        let provider = ScriptedProvider::empty();

        // A projected-but-absent key arrives as an explicit null, which a
        // required field rejects.
        let mut input = base_input();
        input.insert("focus".to_string(), Value::Null);
        let result = harness
            .execute(
                &provider,
                "strict",
                &input,
                &context(&env, ExecutionMode::DryRun),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Stopped);
        assert_eq!(result.error_kind, Some(ErrorKind::PrecheckFailed));
        assert!(result.error.as_deref().unwrap_or("").contains("focus"));
    }

    #[test]
    fn disallowed_write_target_stops_the_agent() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::empty();

        let mut input = base_input();
        input.insert("write_targets".to_string(), json!(["src/lib.rs"]));
        let result = harness
            .execute(
                &provider,
                "report_writer",
                &input,
                &context(&env, ExecutionMode::DryRun),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Stopped);
        assert!(result.error.as_deref().unwrap_or("").contains("src/lib.rs"));
    }

    #[test]
    fn allowed_write_target_passes_prechecks() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::empty();

        let mut input = base_input();
        input.insert("write_targets".to_string(), json!(["var/artifacts/report.md"]));
        let result = harness
            .execute(
                &provider,
                "report_writer",
                &input,
                &context(&env, ExecutionMode::DryRun),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Completed);
    }

    #[test]
    fn live_parses_and_validates_provider_output() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::new(vec![Ok(ProviderResponse {
            body: br#"{"status": "ok", "summary": "done", "files": ["a.rs"]}"#.to_vec(),
        })]);

        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::Live),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Completed);
        assert_eq!(result.output["files"], json!(["a.rs"]));
        assert_eq!(provider.calls(), 1);
        // One attempt record plus one terminal record.
        assert_eq!(env.execution_records().len(), 2);
    }

    #[test]
    fn invalid_json_fails_without_retry_and_preserves_raw_bytes() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::new(vec![Ok(ProviderResponse {
            body: b"I am not JSON".to_vec(),
        })]);

        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::Live),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidJson));
        assert_eq!(provider.calls(), 1);

        let records = env.execution_records();
        let terminal = records.last().expect("terminal record");
        assert_eq!(terminal.raw_response.as_deref(), Some("I am not JSON"));
    }

    #[test]
    fn validation_failure_names_the_offending_field() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::new(vec![Ok(ProviderResponse {
            body: br#"{"status": "ok", "summary": "done"}"#.to_vec(),
        })]);

        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::Live),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::ValidationFailed));
        assert!(result.error.as_deref().unwrap_or("").contains("'files'"));
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn transient_failures_retry_then_exhaust() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let transient = || {
            Err(ProviderError::new(
                ProviderFault::Transient,
                "503 service unavailable",
            ))
        };
        let provider = ScriptedProvider::new(vec![transient(), transient(), transient()]);

        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::Live),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Failed);
        assert_eq!(
            result.error_kind,
            Some(ErrorKind::ProviderTransientExhausted)
        );
        assert_eq!(provider.calls(), 3);

        // Three attempt records plus one terminal record.
        let records = env.execution_records();
        assert_eq!(records.len(), 4);
        assert_eq!(
            records
                .iter()
                .filter(|r| r.event == ExecutionEvent::Attempt)
                .count(),
            3
        );
    }

    #[test]
    fn transient_then_success_recovers() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();
        let provider = ScriptedProvider::new(vec![
            Err(ProviderError::new(ProviderFault::Transient, "429")),
            Ok(ProviderResponse {
                body: br#"{"status": "ok", "summary": "done", "files": []}"#.to_vec(),
            }),
        ]);

        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::Live),
            )
            .expect("execute");

        assert_eq!(result.status, AgentStatus::Completed);
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn permanent_and_timeout_faults_do_not_retry() {
        let env = TestEnv::new().expect("env");
        let harness = env.harness();

        let provider = ScriptedProvider::new(vec![Err(ProviderError::new(
            ProviderFault::Permanent,
            "400 bad request",
        ))]);
        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::Live),
            )
            .expect("execute");
        assert_eq!(result.error_kind, Some(ErrorKind::ProviderPermanent));
        assert_eq!(provider.calls(), 1);

        let provider = ScriptedProvider::new(vec![Err(ProviderError::new(
            ProviderFault::Timeout,
            "deadline elapsed",
        ))]);
        let result = harness
            .execute(
                &provider,
                "discovery",
                &base_input(),
                &context(&env, ExecutionMode::Live),
            )
            .expect("execute");
        assert_eq!(result.error_kind, Some(ErrorKind::ProviderTimeout));
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn backoff_schedule_doubles_from_the_base() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
    }
}
