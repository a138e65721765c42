//! Fan-out & join engine (C7, §4.7).
//!
//! Parses a spawner node's `report` artifact into a batch of children,
//! inserts their run-nodes/dynamic edges/join barrier atomically via
//! [`crate::store::Store::fan_out`], and owns the barrier counter
//! transitions the executor drives as children and joins terminate.
//! Grounded on the teacher's `core/child_additions.rs` validation shape
//! (restricting *where* new nodes may be introduced into a tree) and
//! `agents/decomposer.rs`'s parse-untrusted-agent-JSON-into-typed-children
//! pattern, generalized from a single decomposition target to a spawner's
//! dynamic fan-out-then-join batch.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{EdgeKind, NodeRole, RouteOn, RunNode, RunNodeStatus};
use crate::store::{ChildOutcome, ChildSpec, FanOutInput, FanOutResult, Store};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Subtask {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub node_key: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpawnerOutput {
    pub schema_version: u32,
    pub subtasks: Vec<Subtask>,
}

const SUPPORTED_SCHEMA_VERSION: u32 = 1;
const KNOWN_PROVIDERS: &[&str] = &["codex", "claude"];

/// Lowercase, non-alphanumeric runs collapsed to a single `-` (§4.7 child
/// `nodeKey` normalization).
pub fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_dash = false;
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Parse a spawner's `report` artifact content into a typed [`SpawnerOutput`]
/// (§4.7). Malformed JSON or an unsupported `schemaVersion` is
/// `SPAWNER_OUTPUT_INVALID`.
pub fn parse_spawner_output(content: &str) -> EngineResult<SpawnerOutput> {
    let output: SpawnerOutput = serde_json::from_str(content)
        .map_err(|e| EngineError::SpawnerOutputInvalid(format!("invalid JSON: {e}")))?;
    if output.schema_version != SUPPORTED_SCHEMA_VERSION {
        return Err(EngineError::SpawnerOutputInvalid(format!(
            "unsupported schemaVersion {} (expected {SUPPORTED_SCHEMA_VERSION})",
            output.schema_version
        )));
    }
    for subtask in &output.subtasks {
        if let Some(provider) = &subtask.provider {
            if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
                return Err(EngineError::SpawnerOutputInvalid(format!(
                    "unknown subtask provider {provider:?}"
                )));
            }
        }
    }
    Ok(output)
}

/// Derive child keys (defaulting/normalizing per §4.7) and enforce run-wide
/// uniqueness against `existing_keys`.
pub fn build_child_specs(
    spawner_key: &str,
    subtasks: &[Subtask],
    existing_keys: &HashSet<String>,
) -> EngineResult<Vec<ChildSpec>> {
    let normalized_spawner = normalize(spawner_key);
    let mut used: HashSet<String> = existing_keys.clone();
    let mut specs = Vec::with_capacity(subtasks.len());
    for (index, subtask) in subtasks.iter().enumerate() {
        let key = match &subtask.node_key {
            Some(explicit) => normalize(explicit),
            None => format!("{normalized_spawner}__{}", index + 1),
        };
        if !used.insert(key.clone()) {
            return Err(EngineError::SpawnerOutputInvalid(format!(
                "duplicate child node_key {key:?} in run"
            )));
        }
        specs.push(ChildSpec {
            node_key: key,
            prompt: Some(subtask.prompt.clone()),
            provider: subtask.provider.clone(),
            model: subtask.model.clone(),
            metadata: subtask.metadata.clone(),
        });
    }
    Ok(specs)
}

/// Resolve the spawner's single outgoing `success+tree` edge and confirm its
/// target is a `join` node (§4.7). Returns the join run-node id.
async fn resolve_join_target(store: &dyn Store, spawner: &RunNode) -> EngineResult<Uuid> {
    let edges = store.run_node_edges(spawner.workflow_run_id).await?;
    let candidates: Vec<_> = edges
        .iter()
        .filter(|e| {
            e.source_run_node_id == spawner.id
                && e.route_on == RouteOn::Success
                && e.edge_kind == EdgeKind::Tree
        })
        .collect();
    let [edge] = candidates.as_slice() else {
        return Err(EngineError::SpawnerOutputInvalid(format!(
            "spawner {} must have exactly one outgoing success edge to a join node, found {}",
            spawner.node_key,
            candidates.len()
        )));
    };
    let join = store.get_run_node(edge.target_run_node_id).await?;
    if join.node_role != NodeRole::Join {
        return Err(EngineError::SpawnerOutputInvalid(format!(
            "spawner {} success edge targets non-join node {}",
            spawner.node_key, join.node_key
        )));
    }
    Ok(join.id)
}

/// Parse a spawner's report, validate it against the spawner's topology and
/// `maxChildren`, and materialize the fan-out batch (§4.7).
pub async fn fan_out_from_report(
    store: &dyn Store,
    spawner: &RunNode,
    spawn_source_artifact_id: Uuid,
    report_content: &str,
) -> EngineResult<FanOutResult> {
    if spawner.lineage_depth > 0 {
        return Err(EngineError::SpawnerDepthExceeded(spawner.lineage_depth));
    }

    let output = parse_spawner_output(report_content)?;
    if output.subtasks.len() as u32 > spawner.max_children {
        return Err(EngineError::SpawnerOutputInvalid(format!(
            "{} subtasks exceeds spawner maxChildren {}",
            output.subtasks.len(),
            spawner.max_children
        )));
    }

    let join_run_node_id = resolve_join_target(store, spawner).await?;

    let existing_keys: HashSet<String> = store
        .latest_run_nodes(spawner.workflow_run_id)
        .await?
        .into_iter()
        .map(|n| n.node_key)
        .collect();
    let children = build_child_specs(&spawner.node_key, &output.subtasks, &existing_keys)?;

    let result = store
        .fan_out(FanOutInput {
            spawner_run_node: spawner,
            join_run_node_id,
            spawn_source_artifact_id,
            children,
        })
        .await?;
    Ok(result)
}

/// Update the barrier a fan-out child belongs to when the child reaches a
/// terminal status (§4.6 step 9, §4.7). No-ops if the child has no
/// `joinNodeId` (i.e. is not a fan-out child).
pub async fn record_child_terminal(
    store: &dyn Store,
    child: &RunNode,
    outcome: ChildOutcome,
) -> EngineResult<()> {
    let (Some(spawner_id), Some(join_id)) = (child.spawner_node_id, child.join_node_id) else {
        return Ok(());
    };
    let Some(barrier) = store.active_barrier(spawner_id, join_id).await? else {
        return Ok(());
    };
    store.record_child_terminal(barrier.id, outcome).await?;
    Ok(())
}

/// Reopen a fan-out child's barrier on retry requeue (§4.6 retry policy): the
/// child's prior terminal contribution is reverted so the barrier expects it
/// again.
pub async fn reopen_on_retry(
    store: &dyn Store,
    prior_child: &RunNode,
    prior_outcome: ChildOutcome,
) -> EngineResult<()> {
    let (Some(spawner_id), Some(join_id)) = (prior_child.spawner_node_id, prior_child.join_node_id)
    else {
        return Ok(());
    };
    let Some(barrier) = store.active_barrier(spawner_id, join_id).await? else {
        return Ok(());
    };
    store.reopen_child_on_retry(barrier.id, prior_outcome).await?;
    Ok(())
}

/// Release a join node's barrier once the join node itself completes
/// successfully (§4.7).
pub async fn release_barrier_for_join(store: &dyn Store, join: &RunNode) -> EngineResult<()> {
    let edges = store.run_node_edges(join.workflow_run_id).await?;
    let mut spawners: HashSet<Uuid> = HashSet::new();
    for edge in &edges {
        if edge.target_run_node_id == join.id && edge.edge_kind == EdgeKind::DynamicChildToJoin {
            let child = store.get_run_node(edge.source_run_node_id).await?;
            if let Some(spawner_id) = child.spawner_node_id {
                spawners.insert(spawner_id);
            }
        }
    }
    for spawner_id in spawners {
        if let Some(barrier) = store.active_barrier(spawner_id, join.id).await? {
            if barrier.status == crate::model::BarrierStatus::Ready {
                store.release_barrier(barrier.id).await?;
            }
        }
    }
    Ok(())
}

/// Is `node` itself a fan-out child (i.e. was spawned dynamically)?
pub fn is_fanout_child(node: &RunNode) -> bool {
    node.spawner_node_id.is_some()
}

pub fn child_outcome_for_status(status: RunNodeStatus) -> Option<ChildOutcome> {
    match status {
        RunNodeStatus::Completed => Some(ChildOutcome::Completed),
        RunNodeStatus::Failed => Some(ChildOutcome::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materializer::{materialize_run, MaterializeRunRequest};
    use crate::model::BarrierStatus;
    use crate::store::memory::MemoryStore;
    use crate::test_support::fixtures::spawner_join_tree;

    #[test]
    fn normalize_lowercases_and_collapses_punctuation() {
        assert_eq!(normalize("Fix Bug #123!!"), "fix-bug-123");
        assert_eq!(normalize("  leading"), "leading");
    }

    #[test]
    fn parse_rejects_unsupported_schema_version() {
        let err = parse_spawner_output(r#"{"schemaVersion":2,"subtasks":[]}"#).unwrap_err();
        assert!(matches!(err, EngineError::SpawnerOutputInvalid(_)));
    }

    #[test]
    fn default_child_keys_use_spawner_prefix_and_index() {
        let subtasks = vec![
            Subtask {
                title: "a".into(),
                prompt: "pA".into(),
                node_key: None,
                provider: None,
                model: None,
                metadata: None,
            },
            Subtask {
                title: "b".into(),
                prompt: "pB".into(),
                node_key: None,
                provider: None,
                model: None,
                metadata: None,
            },
        ];
        let specs = build_child_specs("spawner", &subtasks, &HashSet::new()).unwrap();
        assert_eq!(specs[0].node_key, "spawner__1");
        assert_eq!(specs[1].node_key, "spawner__2");
    }

    #[tokio::test]
    async fn fan_out_creates_children_and_pending_barrier() {
        let store = MemoryStore::new();
        spawner_join_tree(&store, "demo").await;
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
        let spawner = nodes.iter().find(|n| n.node_key == "spawner").unwrap();

        let report = serde_json::json!({
            "schemaVersion": 1,
            "subtasks": [
                {"title": "a", "prompt": "pA"},
                {"title": "b", "prompt": "pB"}
            ]
        })
        .to_string();

        let result = fan_out_from_report(&store, spawner, Uuid::new_v4(), &report)
            .await
            .unwrap();
        assert_eq!(result.children.len(), 2);
        assert_eq!(result.barrier.expected_children, 2);
        assert_eq!(result.barrier.status, BarrierStatus::Pending);
        assert_eq!(result.children[0].node_key, "spawner__1");
    }
}
