//! Lifecycle control (C10, §4.10): cancel/pause/resume/retry.
//!
//! Grounded on the same transactional shape `executor` uses for a step — load
//! the run, check the transition against [`crate::state_machine`], apply it
//! through the store, report a small outcome envelope — generalized from "one
//! node's progress" to "the whole run's control state". These functions
//! assume the caller has already stopped any step actively executing against
//! `run_id` (see [`crate::engine`], which holds the per-run serialization
//! lock and signals the cancellation token before calling in here); they do
//! not themselves coordinate with an in-flight step.

use uuid::Uuid;

use crate::error::EngineResult;
use crate::fanout;
use crate::model::{RunNodeStatus, RunStatus};
use crate::store::{ChildOutcome, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Cancel,
    Pause,
    Resume,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    Applied,
    Noop,
    Conflict,
}

/// The `{action, outcome, workflowRunId, previousRunStatus, runStatus,
/// retriedRunNodeIds}` envelope every lifecycle operation returns (§4.10).
#[derive(Debug, Clone)]
pub struct LifecycleResult {
    pub action: LifecycleAction,
    pub outcome: LifecycleOutcome,
    pub workflow_run_id: Uuid,
    pub previous_run_status: RunStatus,
    pub run_status: RunStatus,
    pub retried_run_node_ids: Vec<Uuid>,
}

/// `running|paused|pending -> cancelled`; sweeps every non-terminal
/// latest-attempt node to `cancelled` too. A node a live step is still
/// holding `running` is left alone here — the caller cancelled that step's
/// token first, so by the time this runs the step has already finalized the
/// node itself (classified `aborted`, per §4.6/§5) and it no longer appears
/// non-terminal.
pub async fn cancel_run(store: &dyn Store, run_id: Uuid) -> EngineResult<LifecycleResult> {
    let run = store.get_run(run_id).await?;
    if run.status.is_terminal() {
        return Ok(LifecycleResult {
            action: LifecycleAction::Cancel,
            outcome: LifecycleOutcome::Noop,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: run.status,
            retried_run_node_ids: Vec::new(),
        });
    }
    if !crate::state_machine::run_transition_allowed(run.status, RunStatus::Cancelled) {
        return Ok(LifecycleResult {
            action: LifecycleAction::Cancel,
            outcome: LifecycleOutcome::Conflict,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: run.status,
            retried_run_node_ids: Vec::new(),
        });
    }
    let transitioned = match store.transition_run(run_id, run.status, RunStatus::Cancelled).await {
        Ok(r) => r,
        Err(crate::store::StoreError::PreconditionFailed { .. }) => {
            let now = store.get_run(run_id).await?;
            return Ok(LifecycleResult {
                action: LifecycleAction::Cancel,
                outcome: LifecycleOutcome::Conflict,
                workflow_run_id: run_id,
                previous_run_status: run.status,
                run_status: now.status,
                retried_run_node_ids: Vec::new(),
            });
        }
        Err(e) => return Err(e.into()),
    };
    store.cancel_all_nonterminal(run_id).await?;
    Ok(LifecycleResult {
        action: LifecycleAction::Cancel,
        outcome: LifecycleOutcome::Applied,
        workflow_run_id: run_id,
        previous_run_status: run.status,
        run_status: transitioned.status,
        retried_run_node_ids: Vec::new(),
    })
}

/// `running -> paused`. The in-flight provider call (if any) observes the
/// cancellation signal the caller raised and aborts with a recoverable
/// error; partial node state remains `running` until the owning step
/// returns, after which it is resumable (§4.10).
pub async fn pause_run(store: &dyn Store, run_id: Uuid) -> EngineResult<LifecycleResult> {
    let run = store.get_run(run_id).await?;
    if run.status == RunStatus::Paused {
        return Ok(LifecycleResult {
            action: LifecycleAction::Pause,
            outcome: LifecycleOutcome::Noop,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: run.status,
            retried_run_node_ids: Vec::new(),
        });
    }
    if run.status != RunStatus::Running {
        return Ok(LifecycleResult {
            action: LifecycleAction::Pause,
            outcome: LifecycleOutcome::Conflict,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: run.status,
            retried_run_node_ids: Vec::new(),
        });
    }
    match store.transition_run(run_id, RunStatus::Running, RunStatus::Paused).await {
        Ok(transitioned) => Ok(LifecycleResult {
            action: LifecycleAction::Pause,
            outcome: LifecycleOutcome::Applied,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: transitioned.status,
            retried_run_node_ids: Vec::new(),
        }),
        Err(crate::store::StoreError::PreconditionFailed { .. }) => {
            let now = store.get_run(run_id).await?;
            Ok(LifecycleResult {
                action: LifecycleAction::Pause,
                outcome: LifecycleOutcome::Conflict,
                workflow_run_id: run_id,
                previous_run_status: run.status,
                run_status: now.status,
                retried_run_node_ids: Vec::new(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// `paused -> running`. The next step proceeds normally; [`crate::engine`]
/// is responsible for replacing the run's cancellation token with a fresh,
/// un-cancelled one so the resumed step isn't immediately aborted again.
pub async fn resume_run(store: &dyn Store, run_id: Uuid) -> EngineResult<LifecycleResult> {
    let run = store.get_run(run_id).await?;
    if run.status == RunStatus::Running {
        return Ok(LifecycleResult {
            action: LifecycleAction::Resume,
            outcome: LifecycleOutcome::Noop,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: run.status,
            retried_run_node_ids: Vec::new(),
        });
    }
    if run.status != RunStatus::Paused {
        return Ok(LifecycleResult {
            action: LifecycleAction::Resume,
            outcome: LifecycleOutcome::Conflict,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: run.status,
            retried_run_node_ids: Vec::new(),
        });
    }
    match store.transition_run(run_id, RunStatus::Paused, RunStatus::Running).await {
        Ok(transitioned) => Ok(LifecycleResult {
            action: LifecycleAction::Resume,
            outcome: LifecycleOutcome::Applied,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: transitioned.status,
            retried_run_node_ids: Vec::new(),
        }),
        Err(crate::store::StoreError::PreconditionFailed { .. }) => {
            let now = store.get_run(run_id).await?;
            Ok(LifecycleResult {
                action: LifecycleAction::Resume,
                outcome: LifecycleOutcome::Conflict,
                workflow_run_id: run_id,
                previous_run_status: run.status,
                run_status: now.status,
                retried_run_node_ids: Vec::new(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// `failed -> running`: requeue every latest-attempt `failed` node as a new
/// `pending` attempt (mirroring the executor's own retry-requeue path) and
/// reopen any join barrier a requeued fan-out child belongs to.
pub async fn retry_run(store: &dyn Store, run_id: Uuid) -> EngineResult<LifecycleResult> {
    let run = store.get_run(run_id).await?;
    if run.status != RunStatus::Failed {
        let outcome = if run.status == RunStatus::Running {
            LifecycleOutcome::Noop
        } else {
            LifecycleOutcome::Conflict
        };
        return Ok(LifecycleResult {
            action: LifecycleAction::Retry,
            outcome,
            workflow_run_id: run_id,
            previous_run_status: run.status,
            run_status: run.status,
            retried_run_node_ids: Vec::new(),
        });
    }

    let latest = store.latest_run_nodes(run_id).await?;
    let failed: Vec<_> = latest
        .into_iter()
        .filter(|n| n.status == RunNodeStatus::Failed)
        .collect();

    let mut retried_ids = Vec::with_capacity(failed.len());
    for node in &failed {
        let next = store
            .requeue_attempt(node, node.error_handler_config.clone())
            .await?;
        retried_ids.push(next.id);
        if fanout::is_fanout_child(node) {
            fanout::reopen_on_retry(store, node, ChildOutcome::Failed).await?;
        }
    }

    let transitioned = match store.transition_run(run_id, RunStatus::Failed, RunStatus::Running).await {
        Ok(r) => r,
        Err(crate::store::StoreError::PreconditionFailed { .. }) => {
            let now = store.get_run(run_id).await?;
            return Ok(LifecycleResult {
                action: LifecycleAction::Retry,
                outcome: LifecycleOutcome::Conflict,
                workflow_run_id: run_id,
                previous_run_status: run.status,
                run_status: now.status,
                retried_run_node_ids: retried_ids,
            });
        }
        Err(e) => return Err(e.into()),
    };

    Ok(LifecycleResult {
        action: LifecycleAction::Retry,
        outcome: LifecycleOutcome::Applied,
        workflow_run_id: run_id,
        previous_run_status: run.status,
        run_status: transitioned.status,
        retried_run_node_ids: retried_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materializer::{materialize_run, MaterializeRunRequest};
    use crate::store::memory::MemoryStore;
    use crate::test_support::fixtures::{single_node_tree, single_node_tree_with_retries};

    async fn running_run(store: &MemoryStore, tree_key: &str) -> crate::model::WorkflowRun {
        single_node_tree(store, tree_key).await;
        materialize_run(
            store,
            MaterializeRunRequest {
                tree_key,
                tree_version: None,
                start_running: true,
                started_at: None,
            },
        )
        .await
        .unwrap()
        .run
    }

    #[tokio::test]
    async fn cancel_applies_from_running_and_sweeps_pending_nodes() {
        let store = MemoryStore::new();
        let run = running_run(&store, "demo").await;
        let result = cancel_run(&store, run.id).await.unwrap();
        assert_eq!(result.outcome, LifecycleOutcome::Applied);
        assert_eq!(result.run_status, RunStatus::Cancelled);

        let second = cancel_run(&store, run.id).await.unwrap();
        assert_eq!(second.outcome, LifecycleOutcome::Noop);
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_run_status() {
        let store = MemoryStore::new();
        let run = running_run(&store, "demo").await;

        let paused = pause_run(&store, run.id).await.unwrap();
        assert_eq!(paused.outcome, LifecycleOutcome::Applied);
        assert_eq!(paused.run_status, RunStatus::Paused);

        let noop = pause_run(&store, run.id).await.unwrap();
        assert_eq!(noop.outcome, LifecycleOutcome::Noop);

        let resumed = resume_run(&store, run.id).await.unwrap();
        assert_eq!(resumed.outcome, LifecycleOutcome::Applied);
        assert_eq!(resumed.run_status, RunStatus::Running);
    }

    #[tokio::test]
    async fn pause_from_pending_is_a_conflict() {
        let store = MemoryStore::new();
        single_node_tree(&store, "demo").await;
        let materialized = materialize_run(
            &store,
            MaterializeRunRequest {
                tree_key: "demo",
                tree_version: None,
                start_running: false,
                started_at: None,
            },
        )
        .await
        .unwrap();
        let result = pause_run(&store, materialized.run.id).await.unwrap();
        assert_eq!(result.outcome, LifecycleOutcome::Conflict);
        assert_eq!(result.run_status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn retry_requeues_failed_nodes_and_reports_their_new_attempt_ids() {
        let store = MemoryStore::new();
        single_node_tree_with_retries(&store, "demo", 0).await;
        let materialized = materialize_run(
            &store,
            MaterializeRunRequest {
                tree_key: "demo",
                tree_version: None,
                start_running: true,
                started_at: None,
            },
        )
        .await
        .unwrap();
        let nodes = store.latest_run_nodes(materialized.run.id).await.unwrap();
        let node = &nodes[0];
        store
            .transition_run_node(node.id, RunNodeStatus::Pending, RunNodeStatus::Running)
            .await
            .unwrap();
        store
            .transition_run_node(node.id, RunNodeStatus::Running, RunNodeStatus::Failed)
            .await
            .unwrap();
        store
            .transition_run(materialized.run.id, RunStatus::Running, RunStatus::Failed)
            .await
            .unwrap();

        let result = retry_run(&store, materialized.run.id).await.unwrap();
        assert_eq!(result.outcome, LifecycleOutcome::Applied);
        assert_eq!(result.run_status, RunStatus::Running);
        assert_eq!(result.retried_run_node_ids.len(), 1);

        let refreshed = store.latest_run_nodes(materialized.run.id).await.unwrap();
        assert_eq!(refreshed[0].attempt, 2);
        assert_eq!(refreshed[0].status, RunNodeStatus::Pending);
    }

    #[tokio::test]
    async fn retry_from_running_is_a_noop() {
        let store = MemoryStore::new();
        let run = running_run(&store, "demo").await;
        let result = retry_run(&store, run.id).await.unwrap();
        assert_eq!(result.outcome, LifecycleOutcome::Noop);
    }
}
