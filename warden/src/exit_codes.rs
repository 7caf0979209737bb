//! Stable exit codes for front-ends reporting chain outcomes.

use crate::core::types::ChainStatus;

/// Chain completed.
pub const OK: i32 = 0;
/// An agent failed and the step did not continue on failure.
pub const AGENT_FAILED: i32 = 1;
/// Prechecks stopped a step before any provider interaction.
pub const PRECHECK_FAILED: i32 = 2;
/// A completed step raised a declared stop condition.
pub const STOP_CONDITION: i32 = 3;
/// The chain was cancelled externally.
pub const MANUAL: i32 = 4;

/// Map a chain status to its process exit code.
pub fn for_status(status: ChainStatus) -> i32 {
    match status {
        ChainStatus::Completed => OK,
        ChainStatus::AgentFailed => AGENT_FAILED,
        ChainStatus::PrecheckFailed => PRECHECK_FAILED,
        ChainStatus::StopCondition => STOP_CONDITION,
        ChainStatus::Manual => MANUAL,
    }
}
