//! Shared deterministic types for the governance engine.
//!
//! These types define stable contracts between components. Everything here
//! serializes to the persisted JSON forms; renames are breaking changes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical permission classes an agent contract may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentClass {
    ReadOnlyScan,
    PlanningSynthesis,
    RegistryState,
    WriteGated,
    ControlPlane,
}

impl AgentClass {
    /// All classes, in declaration order.
    pub const ALL: [AgentClass; 5] = [
        AgentClass::ReadOnlyScan,
        AgentClass::PlanningSynthesis,
        AgentClass::RegistryState,
        AgentClass::WriteGated,
        AgentClass::ControlPlane,
    ];

    /// Parse the kebab-case form used in contract files.
    pub fn parse(label: &str) -> Option<AgentClass> {
        match label {
            "read-only-scan" => Some(AgentClass::ReadOnlyScan),
            "planning-synthesis" => Some(AgentClass::PlanningSynthesis),
            "registry-state" => Some(AgentClass::RegistryState),
            "write-gated" => Some(AgentClass::WriteGated),
            "control-plane" => Some(AgentClass::ControlPlane),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentClass::ReadOnlyScan => "read-only-scan",
            AgentClass::PlanningSynthesis => "planning-synthesis",
            AgentClass::RegistryState => "registry-state",
            AgentClass::WriteGated => "write-gated",
            AgentClass::ControlPlane => "control-plane",
        }
    }
}

/// Terminal status of a single agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Execution finished and produced validated output.
    Completed,
    /// Execution ran but failed (provider, parse, or validation error).
    Failed,
    /// Prechecks failed before any provider interaction.
    Stopped,
}

/// How an agent is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run prechecks only; no provider call, empty output.
    DryRun,
    /// Synthesize schema-shaped output; no provider call.
    Simulated,
    /// Full provider execution.
    Live,
}

/// Terminal status of a chain run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Completed,
    AgentFailed,
    PrecheckFailed,
    StopCondition,
    Manual,
}

/// Machine-readable error kinds (closed set).
///
/// Carried alongside the human-readable error string in results and audit
/// records; front-ends must switch on these, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseError,
    NotRegistered,
    PrecheckFailed,
    ProviderTransient,
    ProviderTransientExhausted,
    ProviderPermanent,
    ProviderTimeout,
    InvalidJson,
    ValidationFailed,
    IoError,
    IntegrityError,
    DuplicateEntity,
    Cancelled,
}

/// Result of a single agent execution attempt.
///
/// Exactly one of `output` (non-empty) or `error` is meaningful depending on
/// `status`; `Stopped` means prechecks failed before any provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_name: String,
    pub status: AgentStatus,
    pub started_at: String,
    pub completed_at: String,
    pub execution_time_ms: u64,
    pub output: Map<String, Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub mode: ExecutionMode,
}

impl AgentResult {
    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Completed && self.error.is_none()
    }
}

/// Persisted record of one chain execution (`<var>/state/runs/<run_id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRun {
    pub run_id: String,
    pub chain_name: String,
    pub repository_root: String,
    pub status: ChainStatus,
    pub started_at: String,
    pub completed_at: String,
    pub execution_time_ms: u64,
    pub mode: ExecutionMode,
    pub agent_results: Vec<AgentResult>,
    pub final_state: Map<String, Value>,
    pub error: Option<String>,
}

/// An agent-emitted observation, deduplicated across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub agent_name: String,
    pub category: String,
    pub severity: String,
    pub target_path: String,
    pub line: Option<u64>,
    pub description: String,
    pub observed_at: String,
}

impl Finding {
    /// Stable dedup key: the most recent observation wins for non-key fields.
    pub fn key(&self) -> (String, String, String, Option<u64>) {
        (
            self.agent_name.clone(),
            self.category.clone(),
            self.target_path.clone(),
            self.line,
        )
    }
}

/// Current UTC wall clock as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
