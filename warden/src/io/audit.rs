//! Append-only audit sink for execution and registry events.
//!
//! Execution records go to `<var>/audit/execution_YYYYMMDD.jsonl` (one file
//! per UTC day); registry mutations go to `<var>/registry/registry_log.jsonl`.
//! Each record is one single-line JSON object plus newline, written in a
//! single append call and flushed. No in-place edits, ever.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::types::{AgentStatus, ErrorKind, ExecutionMode, utc_timestamp};
use crate::io::append_jsonl;
use crate::io::paths::VarPaths;

/// What an execution record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// One provider call attempt (live mode only).
    Attempt,
    /// The terminal outcome of an agent execution.
    Execution,
}

/// One line in the daily execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: String,
    pub event: ExecutionEvent,
    pub agent_name: String,
    pub agent_class: String,
    pub status: AgentStatus,
    pub execution_time_ms: u64,
    pub mode: ExecutionMode,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Lossy UTF-8 of the provider bytes, preserved for failing live calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projection_warnings: Vec<String>,
}

/// Registry operation kinds recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryOp {
    Created,
    Updated,
    Deleted,
    ReconciledOrphan,
    ReconciledStale,
}

/// One line in the registry operation log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryLogRecord {
    pub timestamp: String,
    pub operation: RegistryOp,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl RegistryLogRecord {
    pub fn now(
        operation: RegistryOp,
        entity_type: &str,
        entity_id: &str,
        checksum: Option<String>,
    ) -> Self {
        Self {
            timestamp: utc_timestamp(),
            operation,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            checksum,
        }
    }
}

/// Append-only writer owning the engine's audit files.
#[derive(Debug, Clone)]
pub struct AuditSink {
    audit_dir: PathBuf,
    registry_log_path: PathBuf,
}

impl AuditSink {
    pub fn new(paths: &VarPaths) -> Self {
        Self {
            audit_dir: paths.audit_dir.clone(),
            registry_log_path: paths.registry_log_path.clone(),
        }
    }

    /// Append one record to today's execution log.
    pub fn append_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let day = chrono::Utc::now().format("%Y%m%d");
        let path = self.audit_dir.join(format!("execution_{day}.jsonl"));
        append_jsonl(&path, record)
    }

    /// Append one record to the registry operation log.
    pub fn append_registry(&self, record: &RegistryLogRecord) -> Result<()> {
        append_jsonl(&self.registry_log_path, record)
    }

    /// Path of the execution log for today (for readers and tests).
    pub fn execution_log_path_today(&self) -> PathBuf {
        let day = chrono::Utc::now().format("%Y%m%d");
        self.audit_dir.join(format!("execution_{day}.jsonl"))
    }

    pub fn registry_log_path(&self) -> &PathBuf {
        &self.registry_log_path
    }
}
