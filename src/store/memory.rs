//! In-process store adapter.
//!
//! This is the store every test in this crate runs against (we do not run a
//! live database in this environment). It honors the same contracts as
//! [`super::postgres::PgStore`]: optimistic preconditions on transitions,
//! atomic multi-row writes for materialization and fan-out, and the
//! deterministic orderings §4.3/§4.8 require. Grounded on the
//! pool/connection-handle split the teacher's `io/run_state.rs` and
//! `io/tree_store.rs` use for durable state, generalized from one JSON file
//! per entity to one in-memory table per entity guarded by a single
//! `tokio::sync::Mutex`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::diagnostics::RunNodeDiagnosticsPayload;
use crate::model::*;

use super::{
    ChildOutcome, ChildSpec, FanOutInput, FanOutResult, MaterializeInput, MaterializeResult,
    Store, StoreError,
};

#[derive(Default)]
struct Inner {
    trees: HashMap<Uuid, WorkflowTree>,
    tree_by_key_version: HashMap<(String, i64), Uuid>,
    tree_nodes: HashMap<Uuid, TreeNode>,
    tree_nodes_by_tree: HashMap<Uuid, Vec<Uuid>>,
    tree_edges: HashMap<Uuid, TreeEdge>,
    tree_edges_by_tree: HashMap<Uuid, Vec<Uuid>>,
    prompt_templates: HashMap<Uuid, PromptTemplate>,

    runs: HashMap<Uuid, WorkflowRun>,
    run_nodes: HashMap<Uuid, RunNode>,
    run_nodes_by_run: HashMap<Uuid, Vec<Uuid>>,
    run_edges: HashMap<Uuid, RunNodeEdge>,
    run_edges_by_run: HashMap<Uuid, Vec<Uuid>>,

    artifacts: HashMap<Uuid, PhaseArtifact>,
    artifacts_by_run_node: HashMap<Uuid, Vec<Uuid>>,
    decisions: HashMap<Uuid, RoutingDecision>,
    decisions_by_run_node: HashMap<Uuid, Vec<Uuid>>,
    diagnostics: Vec<RunNodeDiagnosticsPayload>,

    barriers: HashMap<Uuid, RunJoinBarrier>,
    active_barrier_by_pair: HashMap<(Uuid, Uuid), Uuid>,

    last_issued_at: Option<DateTime<Utc>>,
}

impl Inner {
    /// A strictly-increasing clock so artifact/decision ordering is
    /// deterministic in tests regardless of OS timer resolution.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamped = match self.last_issued_at {
            Some(prev) if prev >= now => prev + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_issued_at = Some(stamped);
        stamped
    }
}

/// In-process implementation of [`Store`] backed by a single mutex.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seed a tree version. Test/fixture helper — not part of the `Store`
    /// trait, since topology authoring is an external collaborator (§1).
    pub async fn seed_tree(
        &self,
        tree: WorkflowTree,
        nodes: Vec<TreeNode>,
        edges: Vec<TreeEdge>,
        prompts: Vec<PromptTemplate>,
    ) {
        let mut inner = self.inner.lock().await;
        inner
            .tree_by_key_version
            .insert((tree.tree_key.clone(), tree.version), tree.id);
        let node_ids: Vec<Uuid> = nodes.iter().map(|n| n.id).collect();
        let edge_ids: Vec<Uuid> = edges.iter().map(|e| e.id).collect();
        inner.tree_nodes_by_tree.insert(tree.id, node_ids);
        inner.tree_edges_by_tree.insert(tree.id, edge_ids);
        for n in nodes {
            inner.tree_nodes.insert(n.id, n);
        }
        for e in edges {
            inner.tree_edges.insert(e.id, e);
        }
        for p in prompts {
            inner.prompt_templates.insert(p.id, p);
        }
        inner.trees.insert(tree.id, tree);
    }

    /// All diagnostics payloads persisted for a run's node key, in insertion
    /// order. Test/inspection helper — the `Store` trait itself has no
    /// reader since §6 describes diagnostics as write-only engine output.
    #[cfg(any(test, feature = "test-support"))]
    pub async fn diagnostics_for_node_key(
        &self,
        run_id: Uuid,
        node_key: &str,
    ) -> Vec<RunNodeDiagnosticsPayload> {
        let inner = self.inner.lock().await;
        inner
            .diagnostics
            .iter()
            .filter(|d| d.workflow_run_id == run_id && d.node_key == node_key)
            .cloned()
            .collect()
    }

    fn sorted_nodes(inner: &Inner, tree_id: Uuid) -> Vec<TreeNode> {
        let mut nodes: Vec<TreeNode> = inner
            .tree_nodes_by_tree
            .get(&tree_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.tree_nodes.get(id).cloned())
            .collect();
        nodes.sort_by(|a, b| {
            (a.sequence_index, &a.node_key, a.id).cmp(&(b.sequence_index, &b.node_key, b.id))
        });
        nodes
    }

    fn sorted_edges(inner: &Inner, tree_id: Uuid, nodes: &[TreeNode]) -> Vec<TreeEdge> {
        let seq_of: HashMap<Uuid, i64> = nodes.iter().map(|n| (n.id, n.sequence_index)).collect();
        let mut edges: Vec<TreeEdge> = inner
            .tree_edges_by_tree
            .get(&tree_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.tree_edges.get(id).cloned())
            .collect();
        edges.sort_by(|a, b| {
            let a_key = (
                seq_of.get(&a.source_node_id).copied().unwrap_or(i64::MAX),
                route_on_rank(a.route_on),
                a.priority,
                seq_of.get(&a.target_node_id).copied().unwrap_or(i64::MAX),
                a.id,
            );
            let b_key = (
                seq_of.get(&b.source_node_id).copied().unwrap_or(i64::MAX),
                route_on_rank(b.route_on),
                b.priority,
                seq_of.get(&b.target_node_id).copied().unwrap_or(i64::MAX),
                b.id,
            );
            a_key.cmp(&b_key)
        });
        edges
    }

    /// Latest attempt per `node_key` within `run_node_by_run` for `run_id`:
    /// max `attempt`, then max `id` (§3).
    fn latest_by_node_key(inner: &Inner, run_id: Uuid) -> Vec<RunNode> {
        let mut best: HashMap<String, RunNode> = HashMap::new();
        for id in inner.run_nodes_by_run.get(&run_id).into_iter().flatten() {
            let Some(rn) = inner.run_nodes.get(id) else {
                continue;
            };
            match best.get(&rn.node_key) {
                Some(existing) if (existing.attempt, existing.id) >= (rn.attempt, rn.id) => {}
                _ => {
                    best.insert(rn.node_key.clone(), rn.clone());
                }
            }
        }
        let mut out: Vec<RunNode> = best.into_values().collect();
        out.sort_by_key(|n| (n.sequence_index, n.node_key.clone()));
        out
    }
}

fn route_on_rank(r: RouteOn) -> u8 {
    match r {
        RouteOn::Success => 0,
        RouteOn::Failure => 1,
        RouteOn::Terminal => 2,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_published_tree_versions(&self, tree_key: &str) -> Result<Vec<i64>, StoreError> {
        let inner = self.inner.lock().await;
        let mut versions: Vec<i64> = inner
            .tree_by_key_version
            .keys()
            .filter(|(k, _)| k == tree_key)
            .filter_map(|(k, v)| {
                let id = inner.tree_by_key_version.get(&(k.clone(), *v))?;
                let tree = inner.trees.get(id)?;
                (tree.status == TreeStatus::Published).then_some(*v)
            })
            .collect();
        versions.sort_unstable();
        versions.dedup();
        Ok(versions)
    }

    async fn load_tree_version(
        &self,
        tree_key: &str,
        version: i64,
    ) -> Result<(WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>), StoreError> {
        let inner = self.inner.lock().await;
        let id = inner
            .tree_by_key_version
            .get(&(tree_key.to_string(), version))
            .ok_or_else(|| StoreError::NotFound(format!("tree {tree_key} v{version}")))?;
        let tree = inner.trees.get(id).cloned().expect("indexed tree present");
        let nodes = Self::sorted_nodes(&inner, tree.id);
        let edges = Self::sorted_edges(&inner, tree.id, &nodes);
        Ok((tree, nodes, edges))
    }

    async fn get_prompt_template(&self, id: Uuid) -> Result<PromptTemplate, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .prompt_templates
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("prompt template {id}")))
    }

    async fn materialize_run(
        &self,
        input: MaterializeInput<'_>,
    ) -> Result<MaterializeResult, StoreError> {
        let mut inner = self.inner.lock().await;
        let run_id = Uuid::new_v4();
        let now = inner.tick();
        let run = WorkflowRun {
            id: run_id,
            workflow_tree_id: input.tree.id,
            status: if input.start_running {
                RunStatus::Running
            } else {
                RunStatus::Pending
            },
            started_at: if input.start_running {
                Some(input.started_at.unwrap_or(now))
            } else {
                None
            },
            completed_at: None,
        };

        let mut tree_to_run: HashMap<Uuid, Uuid> = HashMap::new();
        let mut run_nodes = Vec::with_capacity(input.nodes.len());
        for tn in input.nodes {
            let run_node_id = Uuid::new_v4();
            tree_to_run.insert(tn.id, run_node_id);
            let (prompt, prompt_content_type) = match input.rendered_prompts.get(&tn.id) {
                Some((text, content_type)) => (Some(text.clone()), *content_type),
                None => (None, ContentType::Text),
            };
            run_nodes.push(RunNode {
                id: run_node_id,
                workflow_run_id: run_id,
                tree_node_id: tn.id,
                node_key: tn.node_key.clone(),
                node_role: tn.node_role,
                node_type: tn.node_type,
                provider: tn.provider.clone(),
                model: tn.model.clone(),
                prompt,
                prompt_content_type,
                execution_permissions: tn.execution_permissions.clone(),
                error_handler_config: tn.error_handler_config.clone(),
                max_children: tn.max_children,
                max_retries: tn.max_retries,
                spawner_node_id: None,
                join_node_id: None,
                lineage_depth: 0,
                sequence_path: tn.sequence_index.to_string(),
                status: RunNodeStatus::Pending,
                sequence_index: tn.sequence_index,
                attempt: 1,
                started_at: None,
                completed_at: None,
            });
        }

        let mut has_incoming: HashMap<Uuid, bool> =
            input.nodes.iter().map(|n| (n.id, false)).collect();
        let mut run_edges = Vec::with_capacity(input.edges.len());
        for te in input.edges {
            let source = *tree_to_run.get(&te.source_node_id).ok_or_else(|| {
                StoreError::Conflict(format!(
                    "edge {} source {} has no run-node mapping",
                    te.id, te.source_node_id
                ))
            })?;
            let target = *tree_to_run.get(&te.target_node_id).ok_or_else(|| {
                StoreError::Conflict(format!(
                    "edge {} target {} has no run-node mapping",
                    te.id, te.target_node_id
                ))
            })?;
            has_incoming.insert(te.target_node_id, true);
            run_edges.push(RunNodeEdge {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                source_run_node_id: source,
                target_run_node_id: target,
                route_on: te.route_on,
                auto: te.auto,
                guard: te.guard.clone(),
                priority: te.priority,
                edge_kind: EdgeKind::Tree,
            });
        }

        let initial_runnable_node_keys: Vec<String> = input
            .nodes
            .iter()
            .filter(|n| !*has_incoming.get(&n.id).unwrap_or(&false))
            .map(|n| n.node_key.clone())
            .collect();

        inner.runs.insert(run_id, run.clone());
        inner
            .run_nodes_by_run
            .insert(run_id, run_nodes.iter().map(|n| n.id).collect());
        for rn in &run_nodes {
            inner.run_nodes.insert(rn.id, rn.clone());
        }
        inner
            .run_edges_by_run
            .insert(run_id, run_edges.iter().map(|e| e.id).collect());
        for re in &run_edges {
            inner.run_edges.insert(re.id, re.clone());
        }

        Ok(MaterializeResult {
            run,
            run_nodes,
            run_edges,
            initial_runnable_node_keys,
        })
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))
    }

    async fn latest_run_nodes(&self, run_id: Uuid) -> Result<Vec<RunNode>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(Self::latest_by_node_key(&inner, run_id))
    }

    async fn get_run_node(&self, run_node_id: Uuid) -> Result<RunNode, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .run_nodes
            .get(&run_node_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("run node {run_node_id}")))
    }

    async fn run_node_edges(&self, run_id: Uuid) -> Result<Vec<RunNodeEdge>, StoreError> {
        let inner = self.inner.lock().await;
        let mut edges: Vec<RunNodeEdge> = inner
            .run_edges_by_run
            .get(&run_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.run_edges.get(id).cloned())
            .collect();
        edges.sort_by_key(|e| e.id);
        Ok(edges)
    }

    async fn latest_routing_decision(
        &self,
        run_node_id: Uuid,
    ) -> Result<Option<RoutingDecision>, StoreError> {
        let inner = self.inner.lock().await;
        let latest = inner
            .decisions_by_run_node
            .get(&run_node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.decisions.get(id).cloned())
            .max_by_key(|d| d.created_at);
        Ok(latest)
    }

    async fn latest_artifact(
        &self,
        run_node_id: Uuid,
        artifact_type: ArtifactType,
    ) -> Result<Option<PhaseArtifact>, StoreError> {
        let inner = self.inner.lock().await;
        let latest = inner
            .artifacts_by_run_node
            .get(&run_node_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.artifacts.get(id).cloned())
            .filter(|a| a.artifact_type == artifact_type)
            .max_by_key(|a| a.created_at);
        Ok(latest)
    }

    async fn latest_reports_for_run(&self, run_id: Uuid) -> Result<Vec<PhaseArtifact>, StoreError> {
        let inner = self.inner.lock().await;
        let latest_nodes = Self::latest_by_node_key(&inner, run_id);
        let mut out = Vec::new();
        for rn in &latest_nodes {
            if let Some(a) = inner
                .artifacts_by_run_node
                .get(&rn.id)
                .into_iter()
                .flatten()
                .filter_map(|id| inner.artifacts.get(id).cloned())
                .filter(|a| a.artifact_type == ArtifactType::Report)
                .max_by_key(|a| a.created_at)
            {
                out.push((rn.sequence_index, rn.node_key.clone(), a));
            }
        }
        out.sort_by(|a, b| (a.0, &a.1, a.2.run_node_id).cmp(&(b.0, &b.1, b.2.run_node_id)));
        Ok(out.into_iter().map(|(_, _, a)| a).collect())
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        to: RunStatus,
    ) -> Result<WorkflowRun, StoreError> {
        if !crate::state_machine::run_transition_allowed(expected, to) {
            return Err(StoreError::Conflict(format!(
                "illegal run transition {expected:?} -> {to:?}"
            )));
        }
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        if run.status != expected {
            return Err(StoreError::PreconditionFailed {
                expected: format!("{expected:?}"),
                actual: format!("{:?}", run.status),
            });
        }
        run.status = to;
        match crate::state_machine::run_timestamp_effect(to) {
            crate::state_machine::TimestampEffect::StampStarted => run.started_at = Some(now),
            crate::state_machine::TimestampEffect::StampCompleted => run.completed_at = Some(now),
            _ => {}
        }
        Ok(run.clone())
    }

    async fn transition_run_node(
        &self,
        run_node_id: Uuid,
        expected: RunNodeStatus,
        to: RunNodeStatus,
    ) -> Result<RunNode, StoreError> {
        if !crate::state_machine::run_node_transition_allowed(expected, to) {
            return Err(StoreError::Conflict(format!(
                "illegal run-node transition {expected:?} -> {to:?}"
            )));
        }
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let rn = inner
            .run_nodes
            .get_mut(&run_node_id)
            .ok_or_else(|| StoreError::NotFound(format!("run node {run_node_id}")))?;
        if rn.status != expected {
            return Err(StoreError::PreconditionFailed {
                expected: format!("{expected:?}"),
                actual: format!("{:?}", rn.status),
            });
        }
        rn.status = to;
        match crate::state_machine::run_node_timestamp_effect(to) {
            crate::state_machine::TimestampEffect::StampStarted => rn.started_at = Some(now),
            crate::state_machine::TimestampEffect::StampCompleted => rn.completed_at = Some(now),
            crate::state_machine::TimestampEffect::ClearStarted => rn.started_at = None,
            crate::state_machine::TimestampEffect::None => {}
        }
        Ok(rn.clone())
    }

    async fn cancel_all_nonterminal(&self, run_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let ids: Vec<Uuid> = Self::latest_by_node_key(&inner, run_id)
            .into_iter()
            .filter(|n| !n.status.is_terminal())
            .map(|n| n.id)
            .collect();
        let mut cancelled = Vec::new();
        for id in ids {
            if let Some(rn) = inner.run_nodes.get_mut(&id) {
                if !rn.status.is_terminal() {
                    rn.status = RunNodeStatus::Cancelled;
                    rn.completed_at = Some(now);
                    cancelled.push(id);
                }
            }
        }
        Ok(cancelled)
    }

    async fn insert_artifact(&self, artifact: PhaseArtifact) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .artifacts_by_run_node
            .entry(artifact.run_node_id)
            .or_default()
            .push(artifact.id);
        inner.artifacts.insert(artifact.id, artifact);
        Ok(())
    }

    async fn insert_routing_decision(&self, decision: RoutingDecision) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .decisions_by_run_node
            .entry(decision.run_node_id)
            .or_default()
            .push(decision.id);
        inner.decisions.insert(decision.id, decision);
        Ok(())
    }

    async fn insert_diagnostics(
        &self,
        payload: RunNodeDiagnosticsPayload,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.diagnostics.push(payload);
        Ok(())
    }

    async fn requeue_attempt(
        &self,
        prior: &RunNode,
        overrides: Option<ErrorHandlerConfig>,
    ) -> Result<RunNode, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut next = prior.clone();
        next.id = Uuid::new_v4();
        next.attempt = prior.attempt + 1;
        next.status = RunNodeStatus::Pending;
        next.started_at = None;
        next.completed_at = None;
        next.prompt = None;
        if let Some(handler) = overrides {
            if let Some(p) = &handler.provider {
                next.provider = Some(p.clone());
            }
            if let Some(m) = &handler.model {
                next.model = Some(m.clone());
            }
        }
        inner
            .run_nodes_by_run
            .entry(next.workflow_run_id)
            .or_default()
            .push(next.id);
        inner.run_nodes.insert(next.id, next.clone());

        // Re-point every edge that referenced the prior attempt's id at the
        // new attempt: edges are keyed by literal run-node id, not by the
        // attempt-stable tree_node_id/node_key, so a requeue that left them
        // alone would make the new attempt's incoming/outgoing edges
        // invisible to routing.rs's snapshot.
        if let Some(edge_ids) = inner.run_edges_by_run.get(&next.workflow_run_id).cloned() {
            for edge_id in edge_ids {
                if let Some(edge) = inner.run_edges.get_mut(&edge_id) {
                    if edge.source_run_node_id == prior.id {
                        edge.source_run_node_id = next.id;
                    }
                    if edge.target_run_node_id == prior.id {
                        edge.target_run_node_id = next.id;
                    }
                }
            }
        }

        Ok(next)
    }

    async fn fan_out(&self, input: FanOutInput<'_>) -> Result<FanOutResult, StoreError> {
        if input.spawner_run_node.lineage_depth > 0 {
            return Err(StoreError::Conflict(
                "SPAWNER_DEPTH_EXCEEDED: nested fan-out is rejected".into(),
            ));
        }
        let key = (input.spawner_run_node.id, input.join_run_node_id);
        let mut inner = self.inner.lock().await;
        if let Some(existing_id) = inner.active_barrier_by_pair.get(&key) {
            if let Some(existing) = inner.barriers.get(existing_id) {
                if !matches!(
                    existing.status,
                    BarrierStatus::Released | BarrierStatus::Cancelled
                ) {
                    return Err(StoreError::Conflict(format!(
                        "active join barrier already exists for spawner {} / join {}",
                        input.spawner_run_node.id, input.join_run_node_id
                    )));
                }
            }
        }

        let now = inner.tick();
        let run_id = input.spawner_run_node.workflow_run_id;
        let mut children = Vec::with_capacity(input.children.len());
        let mut edges = Vec::new();
        for spec in &input.children {
            let child_id = Uuid::new_v4();
            let child = RunNode {
                id: child_id,
                workflow_run_id: run_id,
                tree_node_id: input.spawner_run_node.tree_node_id,
                node_key: spec.node_key.clone(),
                node_role: NodeRole::Standard,
                node_type: input.spawner_run_node.node_type,
                provider: spec
                    .provider
                    .clone()
                    .or_else(|| input.spawner_run_node.provider.clone()),
                model: spec
                    .model
                    .clone()
                    .or_else(|| input.spawner_run_node.model.clone()),
                prompt: spec.prompt.clone(),
                prompt_content_type: ContentType::Text,
                execution_permissions: input.spawner_run_node.execution_permissions.clone(),
                error_handler_config: input.spawner_run_node.error_handler_config.clone(),
                max_children: 0,
                max_retries: input.spawner_run_node.max_retries,
                spawner_node_id: Some(input.spawner_run_node.id),
                join_node_id: Some(input.join_run_node_id),
                lineage_depth: input.spawner_run_node.lineage_depth + 1,
                sequence_path: format!(
                    "{}.{}",
                    input.spawner_run_node.sequence_path,
                    children.len()
                ),
                status: RunNodeStatus::Pending,
                sequence_index: input.spawner_run_node.sequence_index,
                attempt: 1,
                started_at: None,
                completed_at: None,
            };
            edges.push(RunNodeEdge {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                source_run_node_id: input.spawner_run_node.id,
                target_run_node_id: child_id,
                route_on: RouteOn::Terminal,
                auto: true,
                guard: None,
                priority: 0,
                edge_kind: EdgeKind::DynamicSpawnerToChild,
            });
            edges.push(RunNodeEdge {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                source_run_node_id: child_id,
                target_run_node_id: input.join_run_node_id,
                route_on: RouteOn::Terminal,
                auto: true,
                guard: None,
                priority: 0,
                edge_kind: EdgeKind::DynamicChildToJoin,
            });
            children.push(child);
        }

        let expected = children.len() as u32;
        let barrier = RunJoinBarrier {
            id: Uuid::new_v4(),
            workflow_run_id: run_id,
            spawner_run_node_id: input.spawner_run_node.id,
            join_run_node_id: input.join_run_node_id,
            spawn_source_artifact_id: input.spawn_source_artifact_id,
            expected_children: expected,
            terminal_children: 0,
            completed_children: 0,
            failed_children: 0,
            status: if expected == 0 {
                BarrierStatus::Ready
            } else {
                BarrierStatus::Pending
            },
            created_at: now,
            updated_at: now,
            released_at: None,
        };

        inner
            .run_nodes_by_run
            .entry(run_id)
            .or_default()
            .extend(children.iter().map(|c| c.id));
        for c in &children {
            inner.run_nodes.insert(c.id, c.clone());
        }
        inner
            .run_edges_by_run
            .entry(run_id)
            .or_default()
            .extend(edges.iter().map(|e| e.id));
        for e in &edges {
            inner.run_edges.insert(e.id, e.clone());
        }
        inner.active_barrier_by_pair.insert(key, barrier.id);
        inner.barriers.insert(barrier.id, barrier.clone());

        Ok(FanOutResult {
            children,
            edges,
            barrier,
        })
    }

    async fn active_barrier(
        &self,
        spawner_run_node_id: Uuid,
        join_run_node_id: Uuid,
    ) -> Result<Option<RunJoinBarrier>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .active_barrier_by_pair
            .get(&(spawner_run_node_id, join_run_node_id))
            .and_then(|id| inner.barriers.get(id))
            .cloned())
    }

    async fn record_child_terminal(
        &self,
        barrier_id: Uuid,
        outcome: ChildOutcome,
    ) -> Result<RunJoinBarrier, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let barrier = inner
            .barriers
            .get_mut(&barrier_id)
            .ok_or_else(|| StoreError::NotFound(format!("barrier {barrier_id}")))?;
        match outcome {
            ChildOutcome::Completed => barrier.completed_children += 1,
            ChildOutcome::Failed => barrier.failed_children += 1,
        }
        barrier.terminal_children += 1;
        if barrier.terminal_children > barrier.expected_children
            || barrier.completed_children + barrier.failed_children > barrier.terminal_children
        {
            return Err(StoreError::Conflict(format!(
                "JOIN_BARRIER_STATE_INVALID: barrier {barrier_id} counters out of range"
            )));
        }
        if barrier.terminal_children == barrier.expected_children {
            barrier.status = BarrierStatus::Ready;
        }
        barrier.updated_at = now;
        Ok(barrier.clone())
    }

    async fn reopen_child_on_retry(
        &self,
        barrier_id: Uuid,
        prior_outcome: ChildOutcome,
    ) -> Result<RunJoinBarrier, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let barrier = inner
            .barriers
            .get_mut(&barrier_id)
            .ok_or_else(|| StoreError::NotFound(format!("barrier {barrier_id}")))?;
        match prior_outcome {
            ChildOutcome::Completed => {
                barrier.completed_children = barrier.completed_children.saturating_sub(1)
            }
            ChildOutcome::Failed => barrier.failed_children = barrier.failed_children.saturating_sub(1),
        }
        barrier.terminal_children = barrier.terminal_children.saturating_sub(1);
        if barrier.terminal_children < barrier.expected_children
            && barrier.status == BarrierStatus::Ready
        {
            barrier.status = BarrierStatus::Pending;
        }
        barrier.updated_at = now;
        Ok(barrier.clone())
    }

    async fn release_barrier(&self, barrier_id: Uuid) -> Result<RunJoinBarrier, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let barrier = inner
            .barriers
            .get_mut(&barrier_id)
            .ok_or_else(|| StoreError::NotFound(format!("barrier {barrier_id}")))?;
        if barrier.status != BarrierStatus::Ready {
            return Err(StoreError::Conflict(format!(
                "barrier {barrier_id} is {:?}, not ready for release",
                barrier.status
            )));
        }
        barrier.status = BarrierStatus::Released;
        barrier.released_at = Some(now);
        barrier.updated_at = now;
        Ok(barrier.clone())
    }

    async fn mark_skipped(&self, run_node_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = inner.tick();
        let rn = inner
            .run_nodes
            .get_mut(&run_node_id)
            .ok_or_else(|| StoreError::NotFound(format!("run node {run_node_id}")))?;
        if rn.status != RunNodeStatus::Pending {
            return Err(StoreError::PreconditionFailed {
                expected: "Pending".into(),
                actual: format!("{:?}", rn.status),
            });
        }
        rn.status = RunNodeStatus::Skipped;
        rn.completed_at = Some(now);
        Ok(())
    }
}
