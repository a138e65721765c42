//! Step executor (C6, §4.6): the engine's single unit of forward progress.
//!
//! Grounded on the teacher's `step::run_step` orchestration — load state,
//! select, build context, execute, validate, persist, return an outcome —
//! generalized from the teacher's git-worktree-backed single-process loop to
//! a store-backed model where every step reloads the snapshot it needs (§5)
//! and an external caller decides how often to call `execute_next_runnable_node`
//! (a cron tick, a worker pool, a single CLI invocation — all out of scope
//! here per §1).

use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use crate::context;
use crate::diagnostics::{self, BuildDiagnosticsRequest, Outcome as DiagnosticsOutcome};
use crate::error::{EngineError, EngineResult};
use crate::fanout;
use crate::model::{
    ArtifactType, ContentType, DecisionType, NodeRole, PhaseArtifact, RoutingDecision, RunNode,
    RunNodeStatus, RunStatus,
};
use crate::provider::{Provider, ProviderEvent, ProviderEventType, RunOptions};
use crate::routing;
use crate::store::{ChildOutcome, Store};

/// What happened to the selected node on one call to
/// [`execute_next_runnable_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Completed,
    Failed,
}

/// The three shapes a step can end in (§4.6 "returns one of").
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// A node was claimed, executed, and brought to a terminal attempt
    /// status (or requeued for retry); the run may still have work left.
    Advanced {
        run_node_id: Uuid,
        node_key: String,
        outcome: NodeOutcome,
    },
    /// Nothing was selectable this call, but the run isn't finished either
    /// (e.g. a concurrent caller won the claim race, or the only remaining
    /// work is upstream of an unreleased join barrier).
    Blocked,
    /// No node could be selected and every latest-attempt node is terminal;
    /// the run itself was transitioned to its terminal status.
    RunTerminal { status: RunStatus },
}

/// Everything one step needs beyond the store: a provider registry, the
/// options passed through to `Provider::run`, and the tunables from
/// [`crate::config::EngineConfig`].
pub struct ExecuteStepRequest<'a> {
    pub workflow_run_id: Uuid,
    pub providers: &'a [(&'a str, &'a dyn Provider)],
    pub run_options: RunOptions,
    pub context_truncation_chars: usize,
    pub context_envelope_policy_version: u32,
    pub diagnostics_max_bytes: usize,
    pub diagnostics_schema_version: u32,
    pub max_retry_ceiling: u32,
}

fn effective_max_retries(node: &RunNode, ceiling: u32) -> u32 {
    node.max_retries.min(ceiling)
}

fn parse_routing_decision(raw: &str) -> Option<DecisionType> {
    match raw {
        "approved" => Some(DecisionType::Approved),
        "changes_requested" => Some(DecisionType::ChangesRequested),
        "blocked" => Some(DecisionType::Blocked),
        "retry" => Some(DecisionType::Retry),
        _ => None,
    }
}

fn compose_prompt(node: &RunNode, envelope: &str) -> String {
    let template = node
        .prompt
        .clone()
        .unwrap_or_else(|| format!("Execute node `{}` ({:?}).", node.node_key, node.node_role));
    if envelope.is_empty() {
        template
    } else {
        format!("{template}\n\n{envelope}")
    }
}

struct ClaimedStream {
    events: Vec<ProviderEvent>,
    result_content: Option<String>,
    routing_decision: Option<DecisionType>,
    aborted: bool,
    missing_result: bool,
}

/// Consume a provider's event stream, enforcing §4.6/§6 ordering rules: no
/// events after `result`, the last `routingDecision` metadata wins. Checks
/// `cancellation` once per iteration (§5 "every iteration of the event
/// stream is a cancellation check"); a cancelled token stops consumption
/// immediately and reports `aborted: true` rather than an error, since
/// mid-stream cancellation is a classification (§4.6, §5), not a protocol
/// violation.
async fn consume_stream(
    mut stream: futures::stream::BoxStream<'static, ProviderEvent>,
    cancellation: Option<tokio_util::sync::CancellationToken>,
) -> EngineResult<ClaimedStream> {
    let mut events = Vec::new();
    let mut result_content = None;
    let mut routing_decision = None;
    let mut result_seen = false;

    loop {
        if cancellation.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Ok(ClaimedStream {
                events,
                result_content: None,
                routing_decision,
                aborted: true,
                missing_result: false,
            });
        }
        let Some(event) = stream.next().await else {
            break;
        };
        if result_seen {
            return Err(EngineError::ProviderInvalidEvent(
                "event received after the stream's result event".into(),
            ));
        }
        if event.event_type == ProviderEventType::Result {
            result_seen = true;
            result_content = event.content.clone();
        }
        if let Some(meta) = &event.metadata {
            if let Some(raw) = meta.get("routingDecision").and_then(|v| v.as_str()) {
                if let Some(parsed) = parse_routing_decision(raw) {
                    routing_decision = Some(parsed);
                }
            }
        }
        events.push(event);
    }

    Ok(ClaimedStream {
        events,
        result_content,
        routing_decision,
        aborted: false,
        missing_result: !result_seen,
    })
}

/// Claim `node` for execution: a completed node being revisited must first
/// return to `pending` (§4.1 run-node graph only allows `completed->pending`,
/// never `completed->running` directly), then `pending->running`. Returns
/// `Ok(None)` on a losing optimistic-concurrency race rather than an error —
/// callers treat that as [`StepOutcome::Blocked`].
async fn claim_node(store: &dyn Store, node: &RunNode) -> EngineResult<Option<RunNode>> {
    let pending = if node.status == RunNodeStatus::Completed {
        match store
            .transition_run_node(node.id, RunNodeStatus::Completed, RunNodeStatus::Pending)
            .await
        {
            Ok(rn) => rn,
            Err(crate::store::StoreError::PreconditionFailed { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    } else {
        node.clone()
    };
    match store
        .transition_run_node(pending.id, RunNodeStatus::Pending, RunNodeStatus::Running)
        .await
    {
        Ok(rn) => Ok(Some(rn)),
        Err(crate::store::StoreError::PreconditionFailed { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Finalize the run to `completed`/`failed` once every latest-attempt node is
/// terminal (§4.6 step 2). Transitions `pending->running` first if the run
/// never advanced past materialization (e.g. an empty or all-skipped tree).
async fn finalize_run(
    store: &dyn Store,
    run: &crate::model::WorkflowRun,
    snapshot: &routing::RoutingSnapshot,
) -> EngineResult<RunStatus> {
    let target = if routing::any_unhandled_failure(snapshot) {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    let running = if run.status == RunStatus::Pending {
        store
            .transition_run(run.id, RunStatus::Pending, RunStatus::Running)
            .await?
    } else {
        run.clone()
    };
    store
        .transition_run(running.id, RunStatus::Running, target)
        .await?;
    Ok(target)
}

/// Run one step of the engine: select the next runnable node (if any),
/// execute it against its resolved provider, persist its artifact/decision/
/// diagnostics, apply routing and retry policy, and report what happened
/// (§4.6). Reloads all state it needs from `store`; callers drive the loop.
pub async fn execute_next_runnable_node(
    store: &dyn Store,
    request: ExecuteStepRequest<'_>,
) -> EngineResult<StepOutcome> {
    let run = store.get_run(request.workflow_run_id).await?;
    if !matches!(run.status, RunStatus::Pending | RunStatus::Running) {
        return Err(EngineError::WorkflowRunControlConflict(run.id));
    }

    routing::propagate_skips(store, run.id).await?;
    let snapshot = routing::compute_snapshot(store, run.id).await?;

    let Some(selected) = routing::select_next_runnable(store, run.id).await? else {
        if routing::all_nodes_terminal(&snapshot) {
            let status = finalize_run(store, &run, &snapshot).await?;
            return Ok(StepOutcome::RunTerminal { status });
        }
        return Ok(StepOutcome::Blocked);
    };

    let run = if run.status == RunStatus::Pending {
        store
            .transition_run(run.id, RunStatus::Pending, RunStatus::Running)
            .await?
    } else {
        run
    };

    let Some(claimed) = claim_node(store, &selected).await? else {
        return Ok(StepOutcome::Blocked);
    };
    let queued_at = claimed.started_at.unwrap_or_else(Utc::now);

    let provider = match crate::provider::resolve_provider(request.providers, match &claimed.provider {
        Some(p) => p,
        None => {
            return fail_without_execution(
                store,
                &request,
                run.id,
                &claimed,
                queued_at,
                EngineError::UnknownAgentProvider("<none>".into()),
            )
            .await;
        }
    }) {
        Ok(p) => p,
        Err(e) => {
            return fail_without_execution(store, &request, run.id, &claimed, queued_at, e).await;
        }
    };

    let envelope = context::build_context_envelope(
        store,
        &claimed,
        request.context_envelope_policy_version,
        request.context_truncation_chars,
    )
    .await?;
    let prompt = compose_prompt(&claimed, &envelope);
    let context_handoff_summary = if envelope.is_empty() {
        None
    } else {
        Some(serde_json::json!({ "envelope_chars": envelope.chars().count() }))
    };

    let stream_result = provider.run(prompt, request.run_options.clone()).await;
    let consumed = match stream_result {
        Ok(stream) => consume_stream(stream, request.run_options.cancellation.clone()).await,
        Err(e) => Err(EngineError::from(e)),
    };

    let (outcome, events, error_message, result_content, routing_decision, aborted) = match consumed
    {
        Ok(claimed_stream) if claimed_stream.aborted => {
            // §4.10 pause: the in-flight call "aborts with a recoverable
            // error; partial node state remains running until the step
            // returns, after which it is resumable". A paused run leaves
            // the claim alone for a later step to pick back up; any other
            // cause of cancellation (an explicit cancelRun, or a run already
            // moved on) finalizes the node as a classified-aborted failure.
            let run_now = store.get_run(run.id).await?;
            if run_now.status == RunStatus::Paused {
                return Ok(StepOutcome::Blocked);
            }
            (
                NodeOutcome::Failed,
                claimed_stream.events,
                Some("aborted: provider stream cancelled mid-execution".to_string()),
                None,
                None,
                true,
            )
        }
        Ok(claimed_stream) if claimed_stream.missing_result => (
            NodeOutcome::Failed,
            claimed_stream.events,
            Some("provider stream ended without a result event".to_string()),
            None,
            None,
            false,
        ),
        Ok(claimed_stream) => (
            NodeOutcome::Completed,
            claimed_stream.events,
            None,
            claimed_stream.result_content,
            claimed_stream.routing_decision,
            false,
        ),
        Err(e) => (
            NodeOutcome::Failed,
            Vec::new(),
            Some(e.to_string()),
            None,
            None,
            false,
        ),
    };

    finish_node(
        store,
        &request,
        run.id,
        claimed,
        queued_at,
        outcome,
        events,
        error_message,
        result_content,
        routing_decision,
        context_handoff_summary,
        aborted,
    )
    .await
}

/// A node failed before a provider stream was ever consumed (unresolvable
/// provider). Still goes through the same persist/retry/diagnostics path so
/// the failure is visible and retryable like any other.
async fn fail_without_execution(
    store: &dyn Store,
    request: &ExecuteStepRequest<'_>,
    run_id: Uuid,
    claimed: &RunNode,
    queued_at: chrono::DateTime<Utc>,
    error: EngineError,
) -> EngineResult<StepOutcome> {
    finish_node(
        store,
        request,
        run_id,
        claimed.clone(),
        queued_at,
        NodeOutcome::Failed,
        Vec::new(),
        Some(error.to_string()),
        None,
        None,
        None,
        false,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn finish_node(
    store: &dyn Store,
    request: &ExecuteStepRequest<'_>,
    run_id: Uuid,
    claimed: RunNode,
    queued_at: chrono::DateTime<Utc>,
    mut outcome: NodeOutcome,
    events: Vec<ProviderEvent>,
    mut error_message: Option<String>,
    result_content: Option<String>,
    mut routing_decision: Option<DecisionType>,
    context_handoff_summary: Option<serde_json::Value>,
    aborted: bool,
) -> EngineResult<StepOutcome> {
    let mut artifact_id = None;

    if outcome == NodeOutcome::Completed {
        let artifact = PhaseArtifact {
            id: Uuid::new_v4(),
            workflow_run_id: run_id,
            run_node_id: claimed.id,
            artifact_type: ArtifactType::Report,
            content_type: claimed.prompt_content_type,
            content: result_content.clone().unwrap_or_default(),
            metadata: None,
            created_at: Utc::now(),
        };
        artifact_id = Some(artifact.id);
        store.insert_artifact(artifact).await?;

        if claimed.node_role == NodeRole::Spawner {
            match fanout::fan_out_from_report(
                store,
                &claimed,
                artifact_id.expect("just inserted"),
                &result_content.clone().unwrap_or_default(),
            )
            .await
            {
                Ok(_) => {}
                Err(e) => {
                    outcome = NodeOutcome::Failed;
                    error_message = Some(e.to_string());
                    routing_decision = None;
                }
            }
        }
    }

    let completed_at = if outcome == NodeOutcome::Completed {
        Some(Utc::now())
    } else {
        None
    };
    let failed_at = if outcome == NodeOutcome::Failed {
        Some(Utc::now())
    } else {
        None
    };

    let transitioned = match outcome {
        NodeOutcome::Completed => {
            store
                .transition_run_node(claimed.id, RunNodeStatus::Running, RunNodeStatus::Completed)
                .await?
        }
        NodeOutcome::Failed => {
            if outcome == NodeOutcome::Failed {
                let log = PhaseArtifact {
                    id: Uuid::new_v4(),
                    workflow_run_id: run_id,
                    run_node_id: claimed.id,
                    artifact_type: ArtifactType::Log,
                    content_type: ContentType::Text,
                    content: error_message.clone().unwrap_or_default(),
                    metadata: None,
                    created_at: Utc::now(),
                };
                store.insert_artifact(log).await?;
            }
            store
                .transition_run_node(claimed.id, RunNodeStatus::Running, RunNodeStatus::Failed)
                .await?
        }
    };

    if let Some(decision_type) = routing_decision {
        store
            .insert_routing_decision(RoutingDecision {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                run_node_id: claimed.id,
                decision_type,
                raw_output: serde_json::json!({ "attempt": transitioned.attempt }),
                created_at: Utc::now(),
            })
            .await?;
    }

    if let Some(child_outcome) = fanout::child_outcome_for_status(transitioned.status) {
        fanout::record_child_terminal(store, &transitioned, child_outcome).await?;
    }
    if transitioned.node_role == NodeRole::Join && transitioned.status == RunNodeStatus::Completed
    {
        fanout::release_barrier_for_join(store, &transitioned).await?;
    }

    let diagnostics_outcome = match (outcome, aborted) {
        (NodeOutcome::Completed, _) => DiagnosticsOutcome::Completed,
        (NodeOutcome::Failed, true) => DiagnosticsOutcome::Aborted,
        (NodeOutcome::Failed, false) => DiagnosticsOutcome::Failed,
    };

    let payload = diagnostics::build(BuildDiagnosticsRequest {
        schema_version: request.diagnostics_schema_version,
        workflow_run_id: run_id,
        run_node_id: claimed.id,
        node_key: &claimed.node_key,
        attempt: transitioned.attempt,
        outcome: diagnostics_outcome,
        status: transitioned.status,
        provider: claimed.provider.clone(),
        queued_at,
        started_at: claimed.started_at,
        completed_at,
        failed_at,
        events: &events,
        context_handoff: context_handoff_summary,
        routing_decision,
        failure_route: None,
        error: error_message.clone(),
        error_handler: claimed
            .error_handler_config
            .as_ref()
            .and_then(|h| serde_json::to_value(h).ok()),
        max_bytes: request.diagnostics_max_bytes,
    });
    store.insert_diagnostics(payload).await?;

    if outcome == NodeOutcome::Failed && !aborted {
        let effective_max = effective_max_retries(&transitioned, request.max_retry_ceiling);
        if transitioned.attempt < 1 + effective_max {
            let summary = PhaseArtifact {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                run_node_id: transitioned.id,
                artifact_type: ArtifactType::Note,
                content_type: ContentType::Text,
                content: format!(
                    "Attempt {} failed: {}",
                    transitioned.attempt,
                    error_message.as_deref().unwrap_or("unknown error")
                ),
                metadata: Some(serde_json::json!({
                    "kind": "retry_failure_summary",
                    "source_attempt": transitioned.attempt,
                })),
                created_at: Utc::now(),
            };
            store.insert_artifact(summary.clone()).await?;

            let next = store
                .requeue_attempt(&transitioned, transitioned.error_handler_config.clone())
                .await?;
            // Re-anchor the summary to the *new* attempt's id: `latest_artifact`
            // is keyed by run_node_id, and the new attempt has a fresh one.
            let mut carried = summary;
            carried.id = Uuid::new_v4();
            carried.run_node_id = next.id;
            store.insert_artifact(carried).await?;

            if fanout::is_fanout_child(&transitioned) {
                fanout::reopen_on_retry(store, &transitioned, ChildOutcome::Failed).await?;
            }
        }
    }

    routing::propagate_skips(store, run_id).await?;

    Ok(StepOutcome::Advanced {
        run_node_id: transitioned.id,
        node_key: transitioned.node_key.clone(),
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materializer::{materialize_run, MaterializeRunRequest};
    use crate::provider::{NullProvider, ScriptedProvider};
    use crate::store::memory::MemoryStore;
    use crate::test_support::fixtures::{single_node_tree, single_node_tree_with_retries};

    fn default_request<'a>(providers: &'a [(&'a str, &'a dyn Provider)]) -> ExecuteStepRequest<'a> {
        ExecuteStepRequest {
            workflow_run_id: Uuid::nil(),
            providers,
            run_options: RunOptions::default(),
            context_truncation_chars: 8_000,
            context_envelope_policy_version: 1,
            diagnostics_max_bytes: 64_000,
            diagnostics_schema_version: 1,
            max_retry_ceiling: 5,
        }
    }

    #[tokio::test]
    async fn happy_path_single_node_completes_and_terminates_run() {
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

        let scripted = ScriptedProvider::new(vec![
            ProviderEvent::new(ProviderEventType::System, None),
            ProviderEvent::new(ProviderEventType::Result, Some("the report".into())),
        ]);
        let registry: Vec<(&str, &dyn Provider)> = vec![("codex", &scripted)];

        let mut request = default_request(&registry);
        request.workflow_run_id = materialized.run.id;
        let outcome = execute_next_runnable_node(&store, request).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Advanced {
                outcome: NodeOutcome::Completed,
                ..
            }
        ));

        let mut request = default_request(&registry);
        request.workflow_run_id = materialized.run.id;
        let outcome = execute_next_runnable_node(&store, request).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::RunTerminal {
                status: RunStatus::Completed
            }
        ));
    }

    #[tokio::test]
    async fn missing_result_event_fails_the_node() {
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

        let scripted =
            ScriptedProvider::new(vec![ProviderEvent::new(ProviderEventType::System, None)]);
        let registry: Vec<(&str, &dyn Provider)> = vec![("codex", &scripted)];

        let mut request = default_request(&registry);
        request.workflow_run_id = materialized.run.id;
        let outcome = execute_next_runnable_node(&store, request).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Advanced {
                outcome: NodeOutcome::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failed_node_within_retry_budget_is_requeued_not_run_terminal() {
        let store = MemoryStore::new();
        single_node_tree_with_retries(&store, "demo", 2).await;
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

        let failing = NullProvider {
            message: "boom".into(),
        };
        let registry: Vec<(&str, &dyn Provider)> = vec![("codex", &failing)];

        let mut request = default_request(&registry);
        request.workflow_run_id = materialized.run.id;
        let outcome = execute_next_runnable_node(&store, request).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Advanced {
                outcome: NodeOutcome::Failed,
                ..
            }
        ));

        let nodes = store.latest_run_nodes(materialized.run.id).await.unwrap();
        let node = &nodes[0];
        assert_eq!(node.attempt, 2);
        assert_eq!(node.status, RunNodeStatus::Pending);
    }

    #[tokio::test]
    async fn run_not_pending_or_running_refuses_the_step() {
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
        store
            .transition_run(materialized.run.id, RunStatus::Pending, RunStatus::Running)
            .await
            .unwrap();
        store
            .transition_run(materialized.run.id, RunStatus::Running, RunStatus::Cancelled)
            .await
            .unwrap();

        let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
            ProviderEventType::Result,
            Some("x".into()),
        )]);
        let registry: Vec<(&str, &dyn Provider)> = vec![("codex", &scripted)];
        let mut request = default_request(&registry);
        request.workflow_run_id = materialized.run.id;
        let err = execute_next_runnable_node(&store, request).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowRunControlConflict(_)));
    }

    #[tokio::test]
    async fn cancelled_token_fails_the_node_as_aborted_when_run_is_not_paused() {
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

        let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
            ProviderEventType::Result,
            Some("x".into()),
        )]);
        let registry: Vec<(&str, &dyn Provider)> = vec![("codex", &scripted)];

        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let mut request = default_request(&registry);
        request.workflow_run_id = materialized.run.id;
        request.run_options.cancellation = Some(token);

        let outcome = execute_next_runnable_node(&store, request).await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Advanced {
                outcome: NodeOutcome::Failed,
                ..
            }
        ));

        let nodes = store.latest_run_nodes(materialized.run.id).await.unwrap();
        assert_eq!(nodes[0].status, RunNodeStatus::Failed);
        assert_eq!(nodes[0].attempt, 1, "aborted attempt must not be requeued");
    }

    /// A provider whose stream never produces an event on its own, so a test
    /// can race a concurrent pause/cancel against an in-flight step.
    struct HangingProvider;

    #[async_trait::async_trait]
    impl Provider for HangingProvider {
        async fn run(
            &self,
            _prompt: String,
            _options: RunOptions,
        ) -> Result<futures::stream::BoxStream<'static, ProviderEvent>, crate::provider::ProviderError>
        {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    #[tokio::test]
    async fn pausing_a_run_mid_stream_blocks_instead_of_failing_the_node() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        single_node_tree(store.as_ref(), "demo").await;
        let materialized = materialize_run(
            store.as_ref(),
            MaterializeRunRequest {
                tree_key: "demo",
                tree_version: None,
                start_running: false,
                started_at: None,
            },
        )
        .await
        .unwrap();

        let run_id = materialized.run.id;
        let token = tokio_util::sync::CancellationToken::new();

        let step_store = Arc::clone(&store);
        let step_token = token.clone();
        let step = tokio::spawn(async move {
            let hanging = HangingProvider;
            let registry: Vec<(&str, &dyn Provider)> = vec![("codex", &hanging)];
            let mut request = default_request(&registry);
            request.workflow_run_id = run_id;
            request.run_options.cancellation = Some(step_token);
            execute_next_runnable_node(step_store.as_ref(), request).await
        });

        // Give the spawned step a chance to claim the node and start
        // awaiting the hanging stream before pausing underneath it.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        store
            .transition_run(run_id, RunStatus::Running, RunStatus::Paused)
            .await
            .unwrap();
        token.cancel();

        let outcome = step.await.unwrap().unwrap();
        assert!(matches!(outcome, StepOutcome::Blocked));

        let nodes = store.latest_run_nodes(run_id).await.unwrap();
        assert_eq!(
            nodes[0].status,
            RunNodeStatus::Running,
            "a paused node stays claimed for a later step to resume"
        );
    }
}
