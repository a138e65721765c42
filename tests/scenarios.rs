//! End-to-end scenarios driving the engine's public surface
//! (materializer + executor + lifecycle) over a `MemoryStore`, the same way
//! the teacher's own `tests/harness_lifecycle.rs` drives a whole run rather
//! than one module in isolation.

use alphred::executor::{execute_next_runnable_node, ExecuteStepRequest, NodeOutcome, StepOutcome};
use alphred::lifecycle;
use alphred::materializer::{materialize_run, MaterializeRunRequest};
use alphred::model::{RunNodeStatus, RunStatus};
use alphred::provider::{NullProvider, Provider, ProviderEvent, ProviderEventType, RunOptions, ScriptedProvider};
use alphred::store::memory::MemoryStore;
use alphred::store::Store;
use alphred::test_support::fixtures::{
    linear_two_node_tree, linear_two_node_tree_with_retries, routing_decision_tree, single_node_tree,
    single_node_tree_with_retries, spawner_join_tree,
};

fn request<'a>(run_id: uuid::Uuid, providers: &'a [(&'a str, &'a dyn Provider)]) -> ExecuteStepRequest<'a> {
    ExecuteStepRequest {
        workflow_run_id: run_id,
        providers,
        run_options: RunOptions::default(),
        context_truncation_chars: 8_000,
        context_envelope_policy_version: 1,
        diagnostics_max_bytes: 64_000,
        diagnostics_schema_version: 1,
        max_retry_ceiling: 5,
    }
}

/// S1: a single-node run completes in one step and the next step reports
/// the run as terminal.
#[tokio::test]
async fn s1_happy_path_completes_run() {
    let store = MemoryStore::new();
    single_node_tree(&store, "s1").await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "s1",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();

    let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("design doc".into()),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted)];

    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Advanced {
            outcome: NodeOutcome::Completed,
            ..
        }
    ));

    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::RunTerminal {
            status: RunStatus::Completed
        }
    ));

    let run = store.get_run(materialized.run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

/// S2: a provider stream that never emits a result event fails the node
/// without crashing the step.
#[tokio::test]
async fn s2_missing_result_event_fails_node() {
    let store = MemoryStore::new();
    single_node_tree(&store, "s2").await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "s2",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();

    let scripted = ScriptedProvider::new(vec![ProviderEvent::new(ProviderEventType::System, None)]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted)];

    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Advanced {
            outcome: NodeOutcome::Failed,
            ..
        }
    ));

    let nodes = store.latest_run_nodes(materialized.run.id).await.unwrap();
    assert_eq!(nodes[0].status, RunNodeStatus::Pending, "requeued under retry budget");
    assert_eq!(nodes[0].attempt, 2);
}

/// S3: a node that keeps failing past its retry ceiling leaves the run
/// failed rather than looping forever.
#[tokio::test]
async fn s3_exhausting_retries_fails_the_run() {
    let store = MemoryStore::new();
    single_node_tree_with_retries(&store, "s3", 1).await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "s3",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();

    let failing = NullProvider {
        message: "boom".into(),
    };
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &failing)];

    // attempt 1 fails, requeued (max_retries = 1 means 2 total attempts).
    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Advanced {
            outcome: NodeOutcome::Failed,
            ..
        }
    ));
    let nodes = store.latest_run_nodes(materialized.run.id).await.unwrap();
    assert_eq!(nodes[0].attempt, 2);
    assert_eq!(nodes[0].status, RunNodeStatus::Pending);

    // attempt 2 fails, no attempts left: node stays failed, run is terminal failed.
    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Advanced {
            outcome: NodeOutcome::Failed,
            ..
        }
    ));
    let nodes = store.latest_run_nodes(materialized.run.id).await.unwrap();
    assert_eq!(nodes[0].status, RunNodeStatus::Failed);
    assert_eq!(nodes[0].attempt, 2, "no further requeue past the ceiling");

    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::RunTerminal {
            status: RunStatus::Failed
        }
    ));
}

/// S4: a routing decision in the agent's result content selects the
/// guarded revisit edge over the default auto edge.
#[tokio::test]
async fn s4_routing_decision_selects_guarded_revisit_edge() {
    let store = MemoryStore::new();
    routing_decision_tree(&store, "s4").await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "s4",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();

    // design -> implement (auto edge, no decision content needed).
    let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("design doc".into()),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted)];
    execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();

    // implement emits a routingDecision requesting changes, which should
    // select the guarded revisit-to-design edge over the default auto edge
    // to review.
    let reviewer = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("needs more work".into()),
    )
    .with_metadata(serde_json::json!({ "routingDecision": "changes_requested" }))]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &reviewer)];
    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Advanced {
            outcome: NodeOutcome::Completed,
            ..
        }
    ));

    // design should now be runnable again (revisited), not review.
    let scripted2 = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("design v2".into()),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted2)];
    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    match outcome {
        StepOutcome::Advanced { node_key, .. } => assert_eq!(node_key, "design"),
        other => panic!("expected design to be revisited, got {other:?}"),
    }
}

/// S5: cancelling a run's token fails an in-flight node as aborted rather
/// than requeuing it, and the run ends up cancelled.
#[tokio::test]
async fn s5_cancel_aborts_in_flight_node() {
    use tokio_util::sync::CancellationToken;

    let store = MemoryStore::new();
    single_node_tree(&store, "s5").await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "s5",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();

    let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("x".into()),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted)];

    let token = CancellationToken::new();
    token.cancel();
    let mut req = request(materialized.run.id, &registry);
    req.run_options.cancellation = Some(token);

    let outcome = execute_next_runnable_node(&store, req).await.unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::Advanced {
            outcome: NodeOutcome::Failed,
            ..
        }
    ));
    let nodes = store.latest_run_nodes(materialized.run.id).await.unwrap();
    assert_eq!(nodes[0].status, RunNodeStatus::Failed);
    assert_eq!(nodes[0].attempt, 1, "aborted attempt is not requeued");

    let cancel = lifecycle::cancel_run(&store, materialized.run.id).await.unwrap();
    assert_eq!(cancel.outcome, lifecycle::LifecycleOutcome::Applied);
    let run = store.get_run(materialized.run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
}

/// S6: a spawner node's result fans out into child nodes behind a pending
/// join barrier, and completing every child releases the join.
#[tokio::test]
async fn s6_fan_out_and_join_barrier_release() {
    let store = MemoryStore::new();
    spawner_join_tree(&store, "s6").await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "s6",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();

    let spawner_output = serde_json::json!({
        "schemaVersion": 1,
        "subtasks": [
            {"title": "a", "prompt": "pA"},
            {"title": "b", "prompt": "pB"}
        ]
    })
    .to_string();
    let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some(spawner_output),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted)];
    execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();

    let nodes = store.latest_run_nodes(materialized.run.id).await.unwrap();
    let children: Vec<_> = nodes
        .iter()
        .filter(|n| n.node_key.starts_with("spawner__"))
        .collect();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.status == RunNodeStatus::Pending));

    // complete both children; each step claims whichever child is runnable.
    let child_provider = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("child report".into()),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &child_provider)];
    execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();

    // join should now be runnable and complete the run.
    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    match outcome {
        StepOutcome::Advanced { node_key, outcome, .. } => {
            assert_eq!(node_key, "join");
            assert_eq!(outcome, NodeOutcome::Completed);
        }
        other => panic!("expected join to run next, got {other:?}"),
    }

    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::RunTerminal {
            status: RunStatus::Completed
        }
    ));
}

/// A linear two-node tree exercises materialization's initial-runnable-set
/// computation beyond the single-node fixture the module tests already use.
#[tokio::test]
async fn linear_tree_advances_through_both_nodes() {
    let store = MemoryStore::new();
    linear_two_node_tree(&store, "linear").await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "linear",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(materialized.initial_runnable_node_keys, vec!["design".to_string()]);

    let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("ok".into()),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted)];

    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    match outcome {
        StepOutcome::Advanced { node_key, .. } => assert_eq!(node_key, "design"),
        other => panic!("unexpected outcome {other:?}"),
    }
    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    match outcome {
        StepOutcome::Advanced { node_key, .. } => assert_eq!(node_key, "implement"),
        other => panic!("unexpected outcome {other:?}"),
    }
    let outcome = execute_next_runnable_node(&store, request(materialized.run.id, &registry))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        StepOutcome::RunTerminal {
            status: RunStatus::Completed
        }
    ));
}

/// A retried node's own outgoing edge (`design -> implement`) must be
/// re-pointed at the new attempt, or `implement` never becomes reachable
/// once `design` is retried and completes.
#[tokio::test]
async fn retry_rewires_the_retried_nodes_outgoing_edge() {
    let store = MemoryStore::new();
    linear_two_node_tree_with_retries(&store, "retry-outgoing", 1, 0).await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "retry-outgoing",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();
    let run_id = materialized.run.id;

    let design_attempt_1 = store
        .latest_run_nodes(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.node_key == "design")
        .unwrap();

    let failing = NullProvider {
        message: "boom".into(),
    };
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &failing)];
    execute_next_runnable_node(&store, request(run_id, &registry))
        .await
        .unwrap();

    let design_attempt_2 = store
        .latest_run_nodes(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.node_key == "design")
        .unwrap();
    assert_eq!(design_attempt_2.attempt, 2);
    assert_ne!(design_attempt_2.id, design_attempt_1.id);

    let edges = store.run_node_edges(run_id).await.unwrap();
    let design_to_implement = edges
        .iter()
        .find(|e| e.source_run_node_id == design_attempt_2.id || e.source_run_node_id == design_attempt_1.id)
        .unwrap();
    assert_eq!(
        design_to_implement.source_run_node_id, design_attempt_2.id,
        "edge must follow the retried node to its new attempt"
    );

    let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("design v2".into()),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted)];
    let outcome = execute_next_runnable_node(&store, request(run_id, &registry))
        .await
        .unwrap();
    match outcome {
        StepOutcome::Advanced { node_key, outcome, .. } => {
            assert_eq!(node_key, "design");
            assert_eq!(outcome, NodeOutcome::Completed);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let outcome = execute_next_runnable_node(&store, request(run_id, &registry))
        .await
        .unwrap();
    match outcome {
        StepOutcome::Advanced { node_key, .. } => assert_eq!(node_key, "implement"),
        other => panic!("implement never became reachable after design's retry: {other:?}"),
    }
}

/// A retried node's own incoming edge (`design -> implement`) must also be
/// re-pointed at the new attempt, or the retried `implement` looks like it
/// has no incoming edge at all and becomes unconditionally selectable.
#[tokio::test]
async fn retry_rewires_the_retried_nodes_incoming_edge() {
    let store = MemoryStore::new();
    linear_two_node_tree_with_retries(&store, "retry-incoming", 0, 1).await;
    let materialized = materialize_run(
        &store,
        MaterializeRunRequest {
            tree_key: "retry-incoming",
            tree_version: None,
            start_running: true,
            started_at: None,
        },
    )
    .await
    .unwrap();
    let run_id = materialized.run.id;

    let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
        ProviderEventType::Result,
        Some("design doc".into()),
    )]);
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &scripted)];
    execute_next_runnable_node(&store, request(run_id, &registry))
        .await
        .unwrap();

    let implement_attempt_1 = store
        .latest_run_nodes(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.node_key == "implement")
        .unwrap();

    let failing = NullProvider {
        message: "boom".into(),
    };
    let registry: Vec<(&str, &dyn Provider)> = vec![("scripted", &failing)];
    execute_next_runnable_node(&store, request(run_id, &registry))
        .await
        .unwrap();

    let implement_attempt_2 = store
        .latest_run_nodes(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|n| n.node_key == "implement")
        .unwrap();
    assert_eq!(implement_attempt_2.attempt, 2);

    let edges = store.run_node_edges(run_id).await.unwrap();
    let design_to_implement = edges
        .iter()
        .find(|e| e.target_run_node_id == implement_attempt_2.id || e.target_run_node_id == implement_attempt_1.id)
        .unwrap();
    assert_eq!(
        design_to_implement.target_run_node_id, implement_attempt_2.id,
        "edge must follow the retried node to its new attempt"
    );
}
