//! Guarded status transitions for runs and run-nodes (§4.1).
//!
//! Mirrors the teacher's `core::status_validator` shape — pure, deterministic
//! graph checks with stable error strings — generalized from a single
//! agent-status invariant to the two full status graphs the specification
//! defines. The optimistic-precondition half of a transition (the part that
//! actually touches storage) lives in [`crate::store`]; this module only
//! answers "is this edge legal".

use crate::model::{RunNodeStatus, RunStatus};

/// Validate a run-status transition against the run graph in §4.1.
///
/// `pending -> {running, cancelled}`; `running -> {completed, failed,
/// cancelled, paused}`; `paused -> {running, cancelled}`; `failed ->
/// {running}`; `completed | cancelled -> {}`.
pub fn run_transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Paused)
            | (Paused, Running)
            | (Paused, Cancelled)
            | (Failed, Running)
    )
}

/// Validate a run-node-status transition against the run-node graph in §4.1.
///
/// `pending -> {running, skipped, cancelled}`; `running -> {completed,
/// failed, cancelled}`; `completed -> {pending}`; `failed -> {running,
/// pending}`; `skipped -> {pending}`; `cancelled -> {}`.
pub fn run_node_transition_allowed(from: RunNodeStatus, to: RunNodeStatus) -> bool {
    use RunNodeStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Skipped)
            | (Pending, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Completed, Pending)
            | (Failed, Running)
            | (Failed, Pending)
            | (Skipped, Pending)
    )
}

/// Returns the timestamp-stamping behavior implied by a run-node transition,
/// so callers apply it consistently: terminal statuses stamp `completed_at`,
/// `-> running` stamps `started_at`, `-> pending` clears `started_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampEffect {
    StampStarted,
    StampCompleted,
    ClearStarted,
    None,
}

pub fn run_node_timestamp_effect(to: RunNodeStatus) -> TimestampEffect {
    match to {
        RunNodeStatus::Running => TimestampEffect::StampStarted,
        RunNodeStatus::Completed | RunNodeStatus::Failed | RunNodeStatus::Cancelled => {
            TimestampEffect::StampCompleted
        }
        RunNodeStatus::Pending => TimestampEffect::ClearStarted,
        RunNodeStatus::Skipped => TimestampEffect::None,
    }
}

pub fn run_timestamp_effect(to: RunStatus) -> TimestampEffect {
    match to {
        RunStatus::Running => TimestampEffect::StampStarted,
        RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
            TimestampEffect::StampCompleted
        }
        RunStatus::Pending | RunStatus::Paused => TimestampEffect::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_graph_allows_documented_edges() {
        assert!(run_transition_allowed(RunStatus::Pending, RunStatus::Running));
        assert!(run_transition_allowed(RunStatus::Running, RunStatus::Paused));
        assert!(run_transition_allowed(RunStatus::Paused, RunStatus::Running));
        assert!(run_transition_allowed(RunStatus::Failed, RunStatus::Running));
    }

    #[test]
    fn run_graph_rejects_terminal_regression() {
        assert!(!run_transition_allowed(
            RunStatus::Completed,
            RunStatus::Running
        ));
        assert!(!run_transition_allowed(
            RunStatus::Cancelled,
            RunStatus::Pending
        ));
        assert!(!run_transition_allowed(
            RunStatus::Pending,
            RunStatus::Completed
        ));
    }

    #[test]
    fn run_node_graph_allows_retry_requeue_and_revisit() {
        assert!(run_node_transition_allowed(
            RunNodeStatus::Failed,
            RunNodeStatus::Pending
        ));
        assert!(run_node_transition_allowed(
            RunNodeStatus::Completed,
            RunNodeStatus::Pending
        ));
        assert!(run_node_transition_allowed(
            RunNodeStatus::Skipped,
            RunNodeStatus::Pending
        ));
    }

    #[test]
    fn run_node_graph_rejects_cancelled_regression() {
        assert!(!run_node_transition_allowed(
            RunNodeStatus::Cancelled,
            RunNodeStatus::Pending
        ));
    }

    #[test]
    fn timestamp_effects_match_spec() {
        assert_eq!(
            run_node_timestamp_effect(RunNodeStatus::Running),
            TimestampEffect::StampStarted
        );
        assert_eq!(
            run_node_timestamp_effect(RunNodeStatus::Completed),
            TimestampEffect::StampCompleted
        );
        assert_eq!(
            run_node_timestamp_effect(RunNodeStatus::Pending),
            TimestampEffect::ClearStarted
        );
    }
}
