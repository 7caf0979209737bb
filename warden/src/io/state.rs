//! Cross-run repository state: chain-run records, repository fingerprints,
//! and accumulated findings.
//!
//! Layout: `<var>/state/runs/<run_id>.json`, `<var>/state/repositories/
//! <repo_id>.json`, and the global `<var>/state/index.json`. All writes use
//! temp-file + rename; per-repository writes are serialized through a single
//! writer lock per repository id.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::permissions::normalize;
use crate::core::types::{ChainRun, ChainStatus, Finding, utc_timestamp};
use crate::io::config::EngineConfig;
use crate::io::fingerprint::{compute_fingerprint, repository_id};
use crate::io::paths::VarPaths;
use crate::io::{read_json, write_atomic_json};

/// Accumulated per-repository state (`repositories/<repo_id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryState {
    pub repository_root: String,
    pub repo_id: String,
    /// Fingerprint from the most recent scan, if any.
    pub fingerprint: Option<String>,
    /// chain name -> run id of the most recent successful run.
    pub last_chain_runs: BTreeMap<String, String>,
    pub findings: Vec<Finding>,
    pub metrics: BTreeMap<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl RepositoryState {
    fn new(root: &Path) -> Self {
        let now = utc_timestamp();
        Self {
            repository_root: root.display().to_string(),
            repo_id: repository_id(root),
            fingerprint: None,
            last_chain_runs: BTreeMap::new(),
            findings: Vec::new(),
            metrics: BTreeMap::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Global index over runs and repositories (`state/index.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIndex {
    /// Run ids, newest first.
    pub runs: Vec<String>,
    pub repositories: Vec<String>,
}

/// Manager for persistent cross-run state.
#[derive(Debug)]
pub struct StateManager {
    runs_dir: PathBuf,
    repositories_dir: PathBuf,
    index_path: PathBuf,
    run_index_cap: usize,
    ignore_dirs: Vec<String>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Guards read-modify-write cycles on the global index.
    index_lock: Mutex<()>,
}

impl StateManager {
    pub fn open(paths: &VarPaths, config: &EngineConfig) -> Result<StateManager> {
        for dir in [&paths.runs_dir, &paths.repositories_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create state directory {}", dir.display()))?;
        }
        Ok(StateManager {
            runs_dir: paths.runs_dir.clone(),
            repositories_dir: paths.repositories_dir.clone(),
            index_path: paths.state_index_path.clone(),
            run_index_cap: config.run_index_cap,
            ignore_dirs: config.fingerprint.ignore_dirs.clone(),
            locks: Mutex::new(HashMap::new()),
            index_lock: Mutex::new(()),
        })
    }

    /// The single-writer lock for a repository. Chains targeting the same
    /// repository within one process serialize on this.
    pub fn repository_lock(&self, repo_root: &Path) -> Arc<Mutex<()>> {
        let repo_id = repository_id(&absolute_root(repo_root));
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(repo_id).or_default().clone()
    }

    /// Persist a chain run and update the repository state and run index.
    pub fn record_chain_run(&self, run: &ChainRun) -> Result<()> {
        let run_path = self.runs_dir.join(format!("{}.json", run.run_id));
        write_atomic_json(&run_path, run)?;

        let root = PathBuf::from(&run.repository_root);
        let repo_id = {
            let lock = self.repository_lock(&root);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            let mut state = self.load_repository_state(&root)?;
            if run.status == ChainStatus::Completed {
                state
                    .last_chain_runs
                    .insert(run.chain_name.clone(), run.run_id.clone());
            }
            state.updated_at = utc_timestamp();
            self.write_repository_state(&state)?;
            state.repo_id
        };

        let _index_guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.load_index()?;
        index.runs.retain(|id| id != &run.run_id);
        index.runs.push(run.run_id.clone());
        // Newest first; ids sort by start time, disambiguator breaks ties.
        index.runs.sort_by(|a, b| b.cmp(a));
        index.runs.truncate(self.run_index_cap);
        if !index.repositories.contains(&repo_id) {
            index.repositories.push(repo_id);
        }
        write_atomic_json(&self.index_path, &index)?;

        info!(run_id = %run.run_id, chain = %run.chain_name, status = ?run.status, "chain run recorded");
        Ok(())
    }

    pub fn get_chain_run(&self, run_id: &str) -> Result<Option<ChainRun>> {
        let path = self.runs_dir.join(format!("{run_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    /// List recent runs, newest first, optionally filtered by repository.
    pub fn list_runs(&self, repo_root: Option<&Path>, limit: usize) -> Result<Vec<ChainRun>> {
        let index = self.load_index()?;
        let filter_root = repo_root.map(|root| absolute_root(root).display().to_string());

        let mut runs = Vec::new();
        for run_id in &index.runs {
            if runs.len() == limit {
                break;
            }
            let Some(run) = self.get_chain_run(run_id)? else {
                debug!(run_id = %run_id, "indexed run missing on disk");
                continue;
            };
            if let Some(root) = &filter_root
                && &run.repository_root != root
            {
                continue;
            }
            runs.push(run);
        }
        Ok(runs)
    }

    /// Most recent run for a repository, optionally for one chain.
    pub fn get_last_run(
        &self,
        repo_root: &Path,
        chain_name: Option<&str>,
    ) -> Result<Option<ChainRun>> {
        if let Some(chain_name) = chain_name {
            let state = self.load_repository_state(repo_root)?;
            let Some(run_id) = state.last_chain_runs.get(chain_name) else {
                return Ok(None);
            };
            return self.get_chain_run(run_id);
        }
        Ok(self.list_runs(Some(repo_root), 1)?.into_iter().next())
    }

    /// Get (or create) the accumulated state for a repository.
    pub fn get_repository_state(&self, repo_root: &Path) -> Result<RepositoryState> {
        self.load_repository_state(repo_root)
    }

    /// Persist a repository state under the single-writer lock.
    pub fn save_repository_state(&self, state: &RepositoryState) -> Result<()> {
        {
            let lock = self.repository_lock(Path::new(&state.repository_root));
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.write_repository_state(state)?;
        }

        let _index_guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.load_index()?;
        if !index.repositories.contains(&state.repo_id) {
            index.repositories.push(state.repo_id.clone());
            write_atomic_json(&self.index_path, &index)?;
        }
        Ok(())
    }

    /// Compute the current fingerprint and store it on the repository state.
    pub fn refresh_fingerprint(&self, repo_root: &Path) -> Result<String> {
        let root = absolute_root(repo_root);
        let fingerprint = compute_fingerprint(&root, &self.ignore_dirs)?;
        let lock = self.repository_lock(&root);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut state = self.load_repository_state(&root)?;
        state.fingerprint = Some(fingerprint.clone());
        state.updated_at = utc_timestamp();
        self.write_repository_state(&state)?;
        Ok(fingerprint)
    }

    /// True when the repository differs from its stored fingerprint (or was
    /// never fingerprinted).
    pub fn has_repository_changed(&self, repo_root: &Path) -> Result<bool> {
        let root = absolute_root(repo_root);
        let state = self.load_repository_state(&root)?;
        let Some(stored) = &state.fingerprint else {
            return Ok(true);
        };
        let current = compute_fingerprint(&root, &self.ignore_dirs)?;
        Ok(&current != stored)
    }

    /// Merge findings into the repository's accumulated list.
    ///
    /// Deduplicated by [`Finding::key`]; the most recent observation wins
    /// for non-key fields.
    pub fn accumulate_findings(&self, repo_root: &Path, findings: &[Finding]) -> Result<()> {
        if findings.is_empty() {
            return Ok(());
        }
        let root = absolute_root(repo_root);
        let lock = self.repository_lock(&root);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut state = self.load_repository_state(&root)?;
        for finding in findings {
            let key = finding.key();
            match state.findings.iter_mut().find(|f| f.key() == key) {
                Some(existing) => *existing = finding.clone(),
                None => state.findings.push(finding.clone()),
            }
        }
        state.updated_at = utc_timestamp();
        self.write_repository_state(&state)
    }

    /// Delete run files beyond the most recent `keep`, returning the count
    /// removed.
    pub fn prune_runs(&self, keep: usize) -> Result<usize> {
        let _index_guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.load_index()?;
        if index.runs.len() <= keep {
            return Ok(0);
        }
        let surplus: Vec<String> = index.runs.split_off(keep);
        let mut removed = 0;
        for run_id in &surplus {
            let path = self.runs_dir.join(format!("{run_id}.json"));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("remove run {}", path.display()))?;
                removed += 1;
            }
        }
        write_atomic_json(&self.index_path, &index)?;
        Ok(removed)
    }

    fn load_index(&self) -> Result<StateIndex> {
        if !self.index_path.exists() {
            return Ok(StateIndex::default());
        }
        read_json(&self.index_path)
    }

    fn load_repository_state(&self, repo_root: &Path) -> Result<RepositoryState> {
        let root = absolute_root(repo_root);
        let path = self
            .repositories_dir
            .join(format!("{}.json", repository_id(&root)));
        if !path.exists() {
            return Ok(RepositoryState::new(&root));
        }
        read_json(&path)
    }

    fn write_repository_state(&self, state: &RepositoryState) -> Result<()> {
        let path = self
            .repositories_dir
            .join(format!("{}.json", state.repo_id));
        write_atomic_json(&path, state)
    }
}

/// Normalized absolute form of a repository root.
fn absolute_root(root: &Path) -> PathBuf {
    let absolute = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    normalize(&absolute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChainStatus, ExecutionMode};
    use serde_json::Map;

    fn manager(var: &Path) -> StateManager {
        let paths = VarPaths::new(var);
        StateManager::open(&paths, &EngineConfig::default()).expect("open state manager")
    }

    fn run(run_id: &str, chain: &str, root: &Path, status: ChainStatus) -> ChainRun {
        ChainRun {
            run_id: run_id.to_string(),
            chain_name: chain.to_string(),
            repository_root: absolute_root(root).display().to_string(),
            status,
            started_at: utc_timestamp(),
            completed_at: utc_timestamp(),
            execution_time_ms: 5,
            mode: ExecutionMode::DryRun,
            agent_results: Vec::new(),
            final_state: Map::new(),
            error: None,
        }
    }

    fn finding(agent: &str, path: &str, severity: &str) -> Finding {
        Finding {
            agent_name: agent.to_string(),
            category: "secret".to_string(),
            severity: severity.to_string(),
            target_path: path.to_string(),
            line: Some(3),
            description: format!("{severity} issue"),
            observed_at: utc_timestamp(),
        }
    }

    #[test]
    fn repository_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = tempfile::tempdir().expect("repo");
        let manager = manager(&temp.path().join("var"));

        let mut state = manager.get_repository_state(repo.path()).expect("state");
        state
            .metrics
            .insert("runs".to_string(), serde_json::json!(1));
        manager.save_repository_state(&state).expect("save");

        let loaded = manager.get_repository_state(repo.path()).expect("reload");
        assert_eq!(loaded, state);
    }

    #[test]
    fn recorded_runs_list_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = tempfile::tempdir().expect("repo");
        let manager = manager(&temp.path().join("var"));

        for run_id in ["run_20240101000000_aaaa", "run_20240102000000_aaaa"] {
            manager
                .record_chain_run(&run(run_id, "discovery", repo.path(), ChainStatus::Completed))
                .expect("record");
        }

        let runs = manager.list_runs(None, 10).expect("list");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "run_20240102000000_aaaa");

        let filtered = manager
            .list_runs(Some(Path::new("/nonexistent")), 10)
            .expect("list");
        assert!(filtered.is_empty());
    }

    #[test]
    fn run_id_ties_break_on_the_disambiguator() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = tempfile::tempdir().expect("repo");
        let manager = manager(&temp.path().join("var"));

        for run_id in ["run_20240101000000_bbbb", "run_20240101000000_cccc"] {
            manager
                .record_chain_run(&run(run_id, "discovery", repo.path(), ChainStatus::Completed))
                .expect("record");
        }
        let runs = manager.list_runs(None, 10).expect("list");
        assert_eq!(runs[0].run_id, "run_20240101000000_cccc");
    }

    #[test]
    fn only_successful_runs_become_the_chain_latest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = tempfile::tempdir().expect("repo");
        let manager = manager(&temp.path().join("var"));

        manager
            .record_chain_run(&run(
                "run_20240101000000_aaaa",
                "discovery",
                repo.path(),
                ChainStatus::Completed,
            ))
            .expect("record");
        manager
            .record_chain_run(&run(
                "run_20240102000000_aaaa",
                "discovery",
                repo.path(),
                ChainStatus::AgentFailed,
            ))
            .expect("record");

        let last = manager
            .get_last_run(repo.path(), Some("discovery"))
            .expect("last")
            .expect("some");
        assert_eq!(last.run_id, "run_20240101000000_aaaa");
    }

    #[test]
    fn change_detection_tracks_the_fingerprint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = tempfile::tempdir().expect("repo");
        fs::write(repo.path().join("file.txt"), "v1\n").expect("write");
        let manager = manager(&temp.path().join("var"));

        // Never fingerprinted: always changed.
        assert!(manager.has_repository_changed(repo.path()).expect("check"));

        manager.refresh_fingerprint(repo.path()).expect("refresh");
        assert!(!manager.has_repository_changed(repo.path()).expect("check"));

        fs::write(repo.path().join("file.txt"), "v2\n").expect("write");
        assert!(manager.has_repository_changed(repo.path()).expect("check"));
    }

    #[test]
    fn findings_deduplicate_with_newest_winning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = tempfile::tempdir().expect("repo");
        let manager = manager(&temp.path().join("var"));

        manager
            .accumulate_findings(
                repo.path(),
                &[finding("scan", "src/a.rs", "low"), finding("scan", "src/b.rs", "high")],
            )
            .expect("accumulate");
        manager
            .accumulate_findings(repo.path(), &[finding("scan", "src/a.rs", "critical")])
            .expect("accumulate");

        let state = manager.get_repository_state(repo.path()).expect("state");
        assert_eq!(state.findings.len(), 2);
        let a = state
            .findings
            .iter()
            .find(|f| f.target_path == "src/a.rs")
            .expect("finding a");
        assert_eq!(a.severity, "critical");
    }

    #[test]
    fn prune_runs_drops_oldest_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = tempfile::tempdir().expect("repo");
        let manager = manager(&temp.path().join("var"));

        for day in 1..=3 {
            manager
                .record_chain_run(&run(
                    &format!("run_2024010{day}000000_aaaa"),
                    "discovery",
                    repo.path(),
                    ChainStatus::Completed,
                ))
                .expect("record");
        }

        let removed = manager.prune_runs(1).expect("prune");
        assert_eq!(removed, 2);
        let runs = manager.list_runs(None, 10).expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "run_20240103000000_aaaa");
    }
}
