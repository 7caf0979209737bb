//! Catalog of parsed agent contracts.
//!
//! The registry loads every `*.md` contract in a discovery directory into an
//! immutable in-memory catalog. A process-wide cached instance is available
//! through [`install_global`]/[`global`] and is thread-safe for reads.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::agents::contract::{AgentDefinition, parse_contract};
use crate::core::types::AgentClass;

/// Registry of all available agents.
#[derive(Debug)]
pub struct AgentRegistry {
    dir: PathBuf,
    agents: BTreeMap<String, Arc<AgentDefinition>>,
}

impl AgentRegistry {
    /// Load all contracts from `dir`.
    ///
    /// Fails when two files declare the same agent name, naming both files.
    pub fn load(dir: &Path) -> Result<AgentRegistry> {
        let agents = load_contracts(dir)?;
        info!(dir = %dir.display(), count = agents.len(), "agent registry loaded");
        Ok(AgentRegistry {
            dir: dir.to_path_buf(),
            agents,
        })
    }

    /// Get an agent by name.
    pub fn get(&self, name: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.get(name).cloned()
    }

    /// All registered agents, ordered by name.
    pub fn list(&self) -> Vec<Arc<AgentDefinition>> {
        self.agents.values().cloned().collect()
    }

    /// All agents of a given class, ordered by name.
    pub fn list_by_class(&self, class: AgentClass) -> Vec<Arc<AgentDefinition>> {
        self.agents
            .values()
            .filter(|agent| agent.class == class)
            .cloned()
            .collect()
    }

    /// All agent names, ordered.
    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// Reload contracts from the discovery directory.
    ///
    /// On error the existing catalog is left untouched.
    pub fn refresh(&mut self) -> Result<()> {
        let agents = load_contracts(&self.dir)?;
        info!(dir = %self.dir.display(), count = agents.len(), "agent registry refreshed");
        self.agents = agents;
        Ok(())
    }

    /// The discovery directory this registry was loaded from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn load_contracts(dir: &Path) -> Result<BTreeMap<String, Arc<AgentDefinition>>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("read agent directory {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    paths.sort();

    let mut agents: BTreeMap<String, Arc<AgentDefinition>> = BTreeMap::new();
    for path in paths {
        let definition = parse_contract(&path)?;
        debug!(agent = %definition.name, file = %path.display(), "loaded agent contract");
        if let Some(existing) = agents.get(&definition.name) {
            return Err(anyhow!(
                "duplicate agent name '{}' declared by {} and {}",
                definition.name,
                existing.source_file,
                path.display()
            ));
        }
        agents.insert(definition.name.clone(), Arc::new(definition));
    }
    Ok(agents)
}

static GLOBAL: OnceLock<RwLock<Option<Arc<AgentRegistry>>>> = OnceLock::new();

fn global_slot() -> &'static RwLock<Option<Arc<AgentRegistry>>> {
    GLOBAL.get_or_init(|| RwLock::new(None))
}

/// Install (or replace) the process-wide registry instance.
pub fn install_global(registry: AgentRegistry) -> Arc<AgentRegistry> {
    let registry = Arc::new(registry);
    let mut slot = global_slot().write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(registry.clone());
    registry
}

/// The process-wide registry instance, if one has been installed.
pub fn global() -> Option<Arc<AgentRegistry>> {
    global_slot()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{contract_source, write_contract};

    #[test]
    fn loads_contracts_and_lists_by_class() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_contract(temp.path(), "discovery", "read-only-scan").expect("write");
        write_contract(temp.path(), "report_writer", "write-gated").expect("write");
        write_contract(temp.path(), "registrar", "registry-state").expect("write");

        let registry = AgentRegistry::load(temp.path()).expect("load");
        assert_eq!(
            registry.names(),
            vec!["discovery", "registrar", "report_writer"]
        );
        assert!(registry.get("discovery").is_some());
        assert!(registry.get("nope").is_none());

        let writers = registry.list_by_class(AgentClass::WriteGated);
        assert_eq!(writers.len(), 1);
        assert_eq!(writers[0].name, "report_writer");
    }

    #[test]
    fn duplicate_names_fail_naming_both_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            temp.path().join("a.md"),
            contract_source("clone", "read-only-scan"),
        )
        .expect("write a");
        std::fs::write(
            temp.path().join("b.md"),
            contract_source("clone", "read-only-scan"),
        )
        .expect("write b");

        let err = AgentRegistry::load(temp.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("duplicate agent name 'clone'"));
        assert!(msg.contains("a.md"));
        assert!(msg.contains("b.md"));
    }

    #[test]
    fn refresh_picks_up_new_contracts() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_contract(temp.path(), "discovery", "read-only-scan").expect("write");

        let mut registry = AgentRegistry::load(temp.path()).expect("load");
        assert_eq!(registry.names(), vec!["discovery"]);

        write_contract(temp.path(), "health_score", "planning-synthesis").expect("write");
        registry.refresh().expect("refresh");
        assert_eq!(registry.names(), vec!["discovery", "health_score"]);
    }

    #[test]
    fn refresh_failure_keeps_the_existing_catalog() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_contract(temp.path(), "discovery", "read-only-scan").expect("write");

        let mut registry = AgentRegistry::load(temp.path()).expect("load");
        std::fs::write(temp.path().join("broken.md"), "not a contract\n").expect("write");

        assert!(registry.refresh().is_err());
        assert_eq!(registry.names(), vec!["discovery"]);
    }
}
