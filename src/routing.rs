//! Routing & selection (C5, §4.5).
//!
//! Operates entirely over the latest-attempt snapshot: which outgoing edge a
//! completed or failed node "selected", which pending/completed node is next
//! runnable, and the skipped-node fixed point. No visited-set is cached
//! across calls — cyclic trees (`implement<->design`) terminate via
//! `maxRetries` exhaustion and skip-propagation, not via memoized traversal
//! (§9).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::guard;
use crate::model::*;
use crate::store::Store;

/// A decision counts as applicable to the node's *current* attempt iff it
/// was captured during that attempt and is not older than the node's latest
/// report artifact (§4.5 step 1).
fn decision_applicable(
    decision: &RoutingDecision,
    run_node: &RunNode,
    latest_report_created_at: Option<DateTime<Utc>>,
) -> bool {
    let same_attempt = decision
        .raw_output
        .get("attempt")
        .and_then(|v| v.as_u64())
        == Some(run_node.attempt as u64);
    let not_stale = latest_report_created_at
        .map(|created| decision.created_at >= created)
        .unwrap_or(true);
    same_attempt && not_stale
}

/// Per-run snapshot of which edge each terminal source node "selected", used
/// both to pick the next runnable node and to drive skip-propagation.
pub struct RoutingSnapshot {
    pub nodes: Vec<RunNode>,
    pub node_by_id: HashMap<Uuid, RunNode>,
    pub incoming_by_target: HashMap<Uuid, Vec<RunNodeEdge>>,
    /// source run-node id -> target run-node id, for sources that resolved a
    /// selected edge (completed+success or failed+failure/terminal).
    pub selected_target_by_source: HashMap<Uuid, Uuid>,
    /// Failed sources whose failure routed to an executable target (so the
    /// failure is "handled" and should not alone fail the run).
    pub failure_handled_sources: HashSet<Uuid>,
}

async fn resolve_success_edge(
    store: &dyn Store,
    node: &RunNode,
    candidates: &[RunNodeEdge],
) -> EngineResult<Option<Uuid>> {
    let decision = store.latest_routing_decision(node.id).await?;
    let latest_artifact = store.latest_artifact(node.id, ArtifactType::Report).await?;
    let applicable = decision
        .as_ref()
        .filter(|d| decision_applicable(d, node, latest_artifact.as_ref().map(|a| a.created_at)));

    for edge in candidates {
        let decision_matches = match applicable {
            Some(d) if d.decision_type != DecisionType::NoRoute => match &edge.guard {
                Some(g) => guard::evaluate(
                    g,
                    &serde_json::json!({ "decision": d.decision_type.as_guard_str() }),
                ),
                None => true,
            },
            _ => false,
        };
        let matches = edge.auto || decision_matches;
        if matches {
            return Ok(Some(edge.target_run_node_id));
        }
    }
    Ok(None)
}

/// Build the routing snapshot for a run: latest attempts, their incoming
/// edges, and each terminal source's selected outgoing edge (§4.5 steps 1-2).
pub async fn compute_snapshot(store: &dyn Store, run_id: Uuid) -> EngineResult<RoutingSnapshot> {
    let nodes = store.latest_run_nodes(run_id).await?;
    let edges = store.run_node_edges(run_id).await?;
    let node_by_id: HashMap<Uuid, RunNode> = nodes.iter().map(|n| (n.id, n.clone())).collect();

    let mut by_source_success: HashMap<Uuid, Vec<RunNodeEdge>> = HashMap::new();
    let mut by_source_failure: HashMap<Uuid, Vec<RunNodeEdge>> = HashMap::new();
    let mut by_source_terminal: HashMap<Uuid, Vec<RunNodeEdge>> = HashMap::new();
    let mut incoming_by_target: HashMap<Uuid, Vec<RunNodeEdge>> = HashMap::new();
    for edge in edges {
        incoming_by_target
            .entry(edge.target_run_node_id)
            .or_default()
            .push(edge.clone());
        match edge.route_on {
            RouteOn::Success => by_source_success.entry(edge.source_run_node_id).or_default().push(edge),
            RouteOn::Failure => by_source_failure.entry(edge.source_run_node_id).or_default().push(edge),
            RouteOn::Terminal => by_source_terminal.entry(edge.source_run_node_id).or_default().push(edge),
        };
    }
    for group in by_source_success.values_mut() {
        group.sort_by_key(|e| e.priority);
    }
    for group in by_source_failure.values_mut() {
        group.sort_by_key(|e| e.priority);
    }
    for group in by_source_terminal.values_mut() {
        group.sort_by_key(|e| e.priority);
    }

    let mut selected_target_by_source = HashMap::new();
    let mut failure_handled_sources = HashSet::new();

    for node in &nodes {
        match node.status {
            RunNodeStatus::Completed => {
                if let Some(candidates) = by_source_success.get(&node.id) {
                    if let Some(target) = resolve_success_edge(store, node, candidates).await? {
                        selected_target_by_source.insert(node.id, target);
                    }
                }
            }
            RunNodeStatus::Failed => {
                let chosen = by_source_failure
                    .get(&node.id)
                    .and_then(|v| v.first())
                    .or_else(|| by_source_terminal.get(&node.id).and_then(|v| v.first()));
                if let Some(edge) = chosen {
                    selected_target_by_source.insert(node.id, edge.target_run_node_id);
                    if let Some(target) = node_by_id.get(&edge.target_run_node_id) {
                        if matches!(
                            target.status,
                            RunNodeStatus::Pending | RunNodeStatus::Running | RunNodeStatus::Completed
                        ) {
                            failure_handled_sources.insert(node.id);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(RoutingSnapshot {
        nodes,
        node_by_id,
        incoming_by_target,
        selected_target_by_source,
        failure_handled_sources,
    })
}

fn edge_is_selected(snapshot: &RoutingSnapshot, edge: &RunNodeEdge) -> bool {
    snapshot
        .selected_target_by_source
        .get(&edge.source_run_node_id)
        == Some(&edge.target_run_node_id)
}

/// Whether a join node's incoming dynamic edges + barrier state make it
/// runnable (§4.7): all `dynamic_child_to_join` sources terminal, and the
/// most recent barrier for the `(spawner, join)` pair is `ready` or
/// `released`.
async fn is_join_runnable(
    store: &dyn Store,
    snapshot: &RoutingSnapshot,
    join_node: &RunNode,
) -> EngineResult<bool> {
    let incoming = snapshot
        .incoming_by_target
        .get(&join_node.id)
        .cloned()
        .unwrap_or_default();
    let child_edges: Vec<&RunNodeEdge> = incoming
        .iter()
        .filter(|e| e.edge_kind == EdgeKind::DynamicChildToJoin)
        .collect();
    if child_edges.is_empty() {
        return Ok(false);
    }
    let mut spawner_id = None;
    for edge in &child_edges {
        let source = snapshot.node_by_id.get(&edge.source_run_node_id);
        let terminal = source.map(|s| s.status.is_child_terminal()).unwrap_or(false);
        if !terminal {
            return Ok(false);
        }
        if let Some(s) = source {
            spawner_id = s.spawner_node_id;
        }
    }
    let Some(spawner_id) = spawner_id else {
        return Ok(false);
    };
    let barrier = store.active_barrier(spawner_id, join_node.id).await?;
    Ok(matches!(
        barrier.map(|b| b.status),
        Some(BarrierStatus::Ready) | Some(BarrierStatus::Released)
    ))
}

/// Is `node` selectable as the next runnable node (§4.5 "next runnable
/// selection")? `pending` nodes need no incoming edge, or a selected
/// incoming edge from a completed source; `completed` nodes are selectable
/// for revisit when a newer upstream observation exists.
async fn is_selectable(
    store: &dyn Store,
    snapshot: &RoutingSnapshot,
    node: &RunNode,
) -> EngineResult<bool> {
    if node.node_role == NodeRole::Join && node.status == RunNodeStatus::Pending {
        return is_join_runnable(store, snapshot, node).await;
    }

    let incoming = snapshot.incoming_by_target.get(&node.id);
    match node.status {
        RunNodeStatus::Pending => {
            let Some(incoming) = incoming else {
                return Ok(true);
            };
            if incoming.is_empty() {
                return Ok(true);
            }
            Ok(incoming.iter().any(|e| edge_is_selected(snapshot, e)))
        }
        RunNodeStatus::Completed => {
            let Some(incoming) = incoming else {
                return Ok(false);
            };
            let own_artifact = store.latest_artifact(node.id, ArtifactType::Report).await?;
            let own_id = own_artifact.map(|a| a.id);
            for edge in incoming {
                if !edge_is_selected(snapshot, edge) {
                    continue;
                }
                let upstream_artifact = store
                    .latest_artifact(edge.source_run_node_id, ArtifactType::Report)
                    .await?;
                if let Some(upstream) = upstream_artifact {
                    let is_newer = match own_id {
                        Some(mine) => upstream.id != mine && upstream.created_at > own_artifact_created_at(store, own_id, node).await?,
                        None => true,
                    };
                    if is_newer {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

async fn own_artifact_created_at(
    store: &dyn Store,
    own_id: Option<Uuid>,
    node: &RunNode,
) -> EngineResult<DateTime<Utc>> {
    if let Some(_id) = own_id {
        if let Some(artifact) = store.latest_artifact(node.id, ArtifactType::Report).await? {
            return Ok(artifact.created_at);
        }
    }
    Ok(DateTime::<Utc>::MIN_UTC)
}

/// First selectable node in deterministic `(sequenceIndex, nodeKey, id)`
/// order, or `None` if nothing can currently progress.
pub async fn select_next_runnable(store: &dyn Store, run_id: Uuid) -> EngineResult<Option<RunNode>> {
    let snapshot = compute_snapshot(store, run_id).await?;
    for node in &snapshot.nodes {
        if matches!(node.status, RunNodeStatus::Pending | RunNodeStatus::Completed)
            && is_selectable(store, &snapshot, node).await?
        {
            return Ok(Some(node.clone()));
        }
    }
    Ok(None)
}

/// A pending node has no potential incoming route once every incoming
/// edge's source is either completed-but-not-selected or
/// failed-and-handled-elsewhere.
fn has_potential_incoming_route(snapshot: &RoutingSnapshot, node: &RunNode) -> bool {
    let Some(incoming) = snapshot.incoming_by_target.get(&node.id) else {
        return true;
    };
    if incoming.is_empty() {
        return true;
    }
    incoming.iter().any(|edge| {
        let Some(source) = snapshot.node_by_id.get(&edge.source_run_node_id) else {
            return true;
        };
        match source.status {
            RunNodeStatus::Completed => edge_is_selected(snapshot, edge),
            RunNodeStatus::Failed => !snapshot.failure_handled_sources.contains(&source.id),
            RunNodeStatus::Pending | RunNodeStatus::Running => true,
            RunNodeStatus::Skipped | RunNodeStatus::Cancelled => false,
        }
    })
}

/// Repeatedly mark pending nodes with no potential incoming route as
/// skipped, to a fixed point (§4.5, §8 property 8). Returns the run-node ids
/// transitioned to `skipped`.
pub async fn propagate_skips(store: &dyn Store, run_id: Uuid) -> EngineResult<Vec<Uuid>> {
    let mut skipped = Vec::new();
    loop {
        let snapshot = compute_snapshot(store, run_id).await?;
        let mut progressed = false;
        for node in &snapshot.nodes {
            if node.status != RunNodeStatus::Pending || node.node_role == NodeRole::Join {
                continue;
            }
            if !has_potential_incoming_route(&snapshot, node) {
                store.mark_skipped(node.id).await?;
                skipped.push(node.id);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    Ok(skipped)
}

/// True iff every latest-attempt node is in a terminal status, meaning the
/// run itself can be finalized.
pub fn all_nodes_terminal(snapshot: &RoutingSnapshot) -> bool {
    snapshot.nodes.iter().all(|n| n.status.is_terminal())
}

/// True iff any latest-attempt node ended `failed` without a handled
/// failure route (drives the run's terminal `failed` classification).
pub fn any_unhandled_failure(snapshot: &RoutingSnapshot) -> bool {
    snapshot.nodes.iter().any(|n| {
        n.status == RunNodeStatus::Failed && !snapshot.failure_handled_sources.contains(&n.id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::test_support::fixtures::routing_decision_tree;

    async fn complete_with_decision(
        store: &MemoryStore,
        run_node: &RunNode,
        decision_type: DecisionType,
    ) {
        store
            .transition_run_node(run_node.id, RunNodeStatus::Pending, RunNodeStatus::Running)
            .await
            .unwrap();
        store
            .insert_artifact(PhaseArtifact {
                id: Uuid::new_v4(),
                workflow_run_id: run_node.workflow_run_id,
                run_node_id: run_node.id,
                artifact_type: ArtifactType::Report,
                content_type: ContentType::Text,
                content: "body".into(),
                metadata: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .insert_routing_decision(RoutingDecision {
                id: Uuid::new_v4(),
                workflow_run_id: run_node.workflow_run_id,
                run_node_id: run_node.id,
                decision_type,
                raw_output: serde_json::json!({"attempt": run_node.attempt}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .transition_run_node(run_node.id, RunNodeStatus::Running, RunNodeStatus::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn changes_requested_decision_selects_guarded_revisit_edge() {
        let store = MemoryStore::new();
        routing_decision_tree(&store, "demo").await;
        let materialized = crate::materializer::materialize_run(
            &store,
            crate::materializer::MaterializeRunRequest {
                tree_key: "demo",
                tree_version: None,
                start_running: true,
                started_at: None,
            },
        )
        .await
        .unwrap();

        let design = store
            .latest_run_nodes(materialized.run.id)
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.node_key == "design")
            .unwrap();
        complete_with_decision(&store, &design, DecisionType::Approved).await;

        let implement = store
            .latest_run_nodes(materialized.run.id)
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.node_key == "implement")
            .unwrap();
        complete_with_decision(&store, &implement, DecisionType::ChangesRequested).await;

        let next = select_next_runnable(&store, materialized.run.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.node_key, "design");
        assert_eq!(next.status, RunNodeStatus::Completed);
    }
}
