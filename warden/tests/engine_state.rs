//! Cross-run state and registry persistence driven through the engine.

use serde_json::{Map, json};
use warden::chain::{ChainCallbacks, ChainDefinition, ChainStep};
use warden::core::types::{ChainStatus, ExecutionMode, Finding, utc_timestamp};
use warden::io::audit::AuditSink;
use warden::io::store::RegistryStore;
use warden::test_support::{ScriptedProvider, TestEnv};

fn one_step_chain(name: &str) -> ChainDefinition {
    ChainDefinition {
        name: name.to_string(),
        description: String::new(),
        steps: vec![ChainStep::new("discovery").with_output_key("discovery")],
        initial_state: Map::new(),
    }
}

/// Runs recorded by the orchestrator are listable newest-first and by
/// repository, and each chain remembers its latest successful run.
#[test]
fn recorded_runs_are_listable_and_latest_per_chain() {
    let env = TestEnv::new().expect("env");
    let orchestrator = env.orchestrator().expect("orchestrator");
    let provider = ScriptedProvider::empty();

    let first = orchestrator
        .execute(
            &provider,
            &one_step_chain("discovery_analysis"),
            &env.repo_root,
            ExecutionMode::DryRun,
            &ChainCallbacks::default(),
            None,
        )
        .expect("first");
    let second = orchestrator
        .execute(
            &provider,
            &one_step_chain("discovery_analysis"),
            &env.repo_root,
            ExecutionMode::DryRun,
            &ChainCallbacks::default(),
            None,
        )
        .expect("second");

    let state = env.state_manager().expect("state manager");
    let runs = state.list_runs(Some(&env.repo_root), 10).expect("list");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, second.run_id);
    assert_eq!(runs[1].run_id, first.run_id);

    let last = state
        .get_last_run(&env.repo_root, Some("discovery_analysis"))
        .expect("last")
        .expect("some");
    assert_eq!(last.run_id, second.run_id);
    assert_eq!(last.status, ChainStatus::Completed);

    let repo_state = state
        .get_repository_state(&env.repo_root)
        .expect("repository state");
    assert_eq!(
        repo_state.last_chain_runs.get("discovery_analysis"),
        Some(&second.run_id)
    );
}

/// Findings accumulate across chain runs with stable dedup keys.
#[test]
fn findings_accumulate_across_runs() {
    let env = TestEnv::new().expect("env");
    let state = env.state_manager().expect("state manager");

    let finding = |severity: &str| Finding {
        agent_name: "secrets_and_risk".to_string(),
        category: "secret".to_string(),
        severity: severity.to_string(),
        target_path: "configs/app.toml".to_string(),
        line: Some(14),
        description: format!("{severity}: credential committed"),
        observed_at: utc_timestamp(),
    };

    state
        .accumulate_findings(&env.repo_root, &[finding("medium")])
        .expect("first run");
    state
        .accumulate_findings(&env.repo_root, &[finding("high")])
        .expect("second run");

    let repo_state = state
        .get_repository_state(&env.repo_root)
        .expect("repository state");
    assert_eq!(repo_state.findings.len(), 1);
    assert_eq!(repo_state.findings[0].severity, "high");
}

/// Registry round trip: register, update, read, verify, with the index and
/// operation log tracking every mutation in order.
#[test]
fn registry_round_trip_through_the_store() {
    let env = TestEnv::new().expect("env");
    let audit = AuditSink::new(&env.var);
    let mut store = RegistryStore::open(&env.var, audit).expect("open store");

    let mut v1 = Map::new();
    v1.insert("v".to_string(), json!(1));
    let mut v2 = Map::new();
    v2.insert("v".to_string(), json!(2));

    store.register("component", "x", v1).expect("register");
    store.update("component", "x", v2.clone()).expect("update");

    let record = store.read("component", "x").expect("read");
    assert_eq!(record.data, v2);
    assert_eq!(record.checksum, warden::io::store::checksum_of(&v2));
    assert_eq!(store.index().entities["component"], vec!["x".to_string()]);
    store.verify("component", "x").expect("verify");

    let log = std::fs::read_to_string(&env.var.registry_log_path).expect("read log");
    let operations: Vec<String> = log
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).expect("parse")["operation"]
                .as_str()
                .expect("operation")
                .to_string()
        })
        .collect();
    assert_eq!(operations, vec!["created", "updated"]);
}

/// Fingerprint-driven change detection across the state manager.
#[test]
fn repository_change_detection_survives_reopen() {
    let env = TestEnv::new().expect("env");
    {
        let state = env.state_manager().expect("state manager");
        state.refresh_fingerprint(&env.repo_root).expect("refresh");
        assert!(!state.has_repository_changed(&env.repo_root).expect("check"));
    }

    // A fresh manager over the same var directory sees the stored state.
    let state = env.state_manager().expect("reopen");
    assert!(!state.has_repository_changed(&env.repo_root).expect("check"));

    std::fs::write(env.repo_root.join("src/new.rs"), "pub fn added() {}\n").expect("write");
    assert!(state.has_repository_changed(&env.repo_root).expect("check"));
}
