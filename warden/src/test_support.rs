//! Test-only helpers: scripted providers, contract builders, and a
//! disposable engine environment.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::agents::registry::AgentRegistry;
use crate::chain::Orchestrator;
use crate::harness::{ExecutionHarness, HarnessSettings};
use crate::io::audit::{AuditSink, ExecutionRecord};
use crate::io::config::EngineConfig;
use crate::io::paths::VarPaths;
use crate::io::provider::{
    Provider, ProviderError, ProviderFault, ProviderRequest, ProviderResponse,
};
use crate::io::state::StateManager;

/// A deterministic contract document for one agent.
pub fn contract_source(name: &str, class: &str) -> String {
    format!(
        "AGENT: {name}\nCLASS: {class}\n\n\
         ROLE\nDeterministic repository scanner used in tests.\n\n\
         GOAL\nProduce a stable, schema-conforming observation of the repository.\n\n\
         SCOPE / PERMISSIONS\nClass defaults apply.\n\n\
         INPUT\n- repository_root (required)\n- focus\n\n\
         OUTPUT\n```json\n{{\n  \"status\": \"ok\",\n  \"summary\": \"\",\n  \"files\": []\n}}\n```\n"
    )
}

/// Write a contract file into an agents directory.
pub fn write_contract(dir: &Path, name: &str, class: &str) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.md"));
    fs::write(&path, contract_source(name, class))
        .with_context(|| format!("write contract {}", path.display()))?;
    Ok(path)
}

/// Provider fake returning a scripted sequence of responses.
pub struct ScriptedProvider {
    responses: RefCell<VecDeque<Result<ProviderResponse, ProviderError>>>,
    calls: Cell<usize>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            calls: Cell::new(0),
        }
    }

    /// A provider that must never be called.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// A provider that always returns the same JSON body.
    pub fn json(body: &str) -> Self {
        Self::new(vec![Ok(ProviderResponse {
            body: body.as_bytes().to_vec(),
        })])
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Provider for ScriptedProvider {
    fn complete(&self, _request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.set(self.calls.get() + 1);
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ProviderError::new(
                    ProviderFault::Permanent,
                    "scripted provider has no response queued",
                ))
            })
    }
}

/// Disposable engine environment: a var directory, a small target
/// repository, and a loaded registry of standard test agents.
pub struct TestEnv {
    _temp: tempfile::TempDir,
    pub var: VarPaths,
    pub repo_root: PathBuf,
    pub agents_dir: PathBuf,
    pub registry: Arc<AgentRegistry>,
}

impl TestEnv {
    pub fn new() -> Result<TestEnv> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let var = VarPaths::new(temp.path().join("var"));

        let repo_root = temp.path().join("repo");
        fs::create_dir_all(repo_root.join("src")).context("create repo src")?;
        fs::write(repo_root.join("src/main.rs"), "fn main() {}\n").context("seed repo")?;
        fs::write(repo_root.join("README.md"), "test repository\n").context("seed repo")?;

        let agents_dir = temp.path().join("agents");
        fs::create_dir_all(&agents_dir).context("create agents dir")?;
        write_contract(&agents_dir, "discovery", "read-only-scan")?;
        write_contract(&agents_dir, "stackmap", "planning-synthesis")?;
        write_contract(&agents_dir, "report_writer", "write-gated")?;
        write_contract(&agents_dir, "registrar", "registry-state")?;

        let registry = Arc::new(AgentRegistry::load(&agents_dir)?);
        Ok(TestEnv {
            _temp: temp,
            var,
            repo_root,
            agents_dir,
            registry,
        })
    }

    pub fn audit(&self) -> AuditSink {
        AuditSink::new(&self.var)
    }

    /// Harness with a millisecond backoff base so retry tests stay fast.
    pub fn harness(&self) -> ExecutionHarness {
        let settings = HarnessSettings {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            max_tokens: 512,
        };
        ExecutionHarness::new(self.registry.clone(), self.audit(), settings)
    }

    pub fn state_manager(&self) -> Result<Arc<StateManager>> {
        Ok(Arc::new(StateManager::open(
            &self.var,
            &EngineConfig::default(),
        )?))
    }

    pub fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::new(self.harness(), self.state_manager()?))
    }

    /// All records appended to today's execution log, in order.
    pub fn execution_records(&self) -> Vec<ExecutionRecord> {
        let path = self.audit().execution_log_path_today();
        let Ok(contents) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("execution record should parse"))
            .collect()
    }
}
