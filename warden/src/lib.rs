//! Deterministic agent-driven repository governance engine.
//!
//! Executes ordered chains of self-contained agents (prompt contracts with
//! strict JSON output schemas) against a target repository, passing state
//! between steps, persisting every execution for audit and replay, and
//! enforcing per-agent write-permission boundaries.
//!
//! The crate is a library kernel. Front-ends (CLI, API, dashboard) and the
//! LLM provider wire clients are external collaborators; they reach the
//! kernel through [`chain::Orchestrator::execute`], the agent registry, and
//! the state manager only.

pub mod agents;
pub mod chain;
pub mod core;
pub mod exit_codes;
pub mod harness;
pub mod io;
pub mod logging;
pub mod test_support;
