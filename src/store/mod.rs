//! Store adapter (C2): typed persistence over a relational store with
//! transactions and optimistic preconditions.
//!
//! The specification describes a generic `transaction(f)` primitive; this
//! crate realizes it as a set of concrete, named compound operations instead
//! of a callback-based combinator (HRTB closures over `&mut dyn Tx` do not
//! compose cleanly with `async fn` in traits without extra boxing machinery
//! that buys nothing here — see `DESIGN.md`). Each compound operation below
//! that crosses entity boundaries (run materialization, fan-out) is
//! implemented atomically by its adapter: `memory::MemoryStore` holds a
//! single `tokio::sync::Mutex` for the whole store; `postgres::PgStore` wraps
//! the equivalent statements in one `sqlx::Transaction`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::*;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: expected status {expected}, row is now {actual}")]
    PreconditionFailed { expected: String, actual: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

/// Specification for a single child created by the fan-out engine.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub node_key: String,
    pub prompt: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Everything the run materializer needs to build run-nodes/run-edges from a
/// resolved tree version (§4.4).
pub struct MaterializeInput<'a> {
    pub tree: &'a WorkflowTree,
    pub nodes: &'a [TreeNode],
    pub edges: &'a [TreeEdge],
    pub start_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Rendered prompt text for nodes that resolved a `prompt_template_id`,
    /// keyed by `TreeNode::id`. Nodes absent from this map get `prompt:
    /// None`, same as a node with no template.
    pub rendered_prompts: &'a std::collections::HashMap<Uuid, (String, ContentType)>,
}

pub struct MaterializeResult {
    pub run: WorkflowRun,
    pub run_nodes: Vec<RunNode>,
    pub run_edges: Vec<RunNodeEdge>,
    pub initial_runnable_node_keys: Vec<String>,
}

/// Everything the fan-out engine needs to write one spawn batch atomically
/// (§4.7).
pub struct FanOutInput<'a> {
    pub spawner_run_node: &'a RunNode,
    pub join_run_node_id: Uuid,
    pub spawn_source_artifact_id: Uuid,
    pub children: Vec<ChildSpec>,
}

pub struct FanOutResult {
    pub children: Vec<RunNode>,
    pub edges: Vec<RunNodeEdge>,
    pub barrier: RunJoinBarrier,
}

/// Which counter a terminal child transition increments on its barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Completed,
    Failed,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- Topology (read-only; populated out of band by an external loader UI) --
    async fn find_published_tree_versions(&self, tree_key: &str) -> Result<Vec<i64>, StoreError>;
    async fn load_tree_version(
        &self,
        tree_key: &str,
        version: i64,
    ) -> Result<(WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>), StoreError>;
    async fn get_prompt_template(&self, id: Uuid) -> Result<PromptTemplate, StoreError>;

    // -- Run materialization (C4) --
    async fn materialize_run(
        &self,
        input: MaterializeInput<'_>,
    ) -> Result<MaterializeResult, StoreError>;

    // -- Run + run-node reads --
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError>;
    /// Latest attempt per `node_key`, per §3: max `attempt` then max `id`.
    async fn latest_run_nodes(&self, run_id: Uuid) -> Result<Vec<RunNode>, StoreError>;
    async fn get_run_node(&self, run_node_id: Uuid) -> Result<RunNode, StoreError>;
    async fn run_node_edges(&self, run_id: Uuid) -> Result<Vec<RunNodeEdge>, StoreError>;
    async fn latest_routing_decision(
        &self,
        run_node_id: Uuid,
    ) -> Result<Option<RoutingDecision>, StoreError>;
    async fn latest_artifact(
        &self,
        run_node_id: Uuid,
        artifact_type: ArtifactType,
    ) -> Result<Option<PhaseArtifact>, StoreError>;
    /// All upstream-report-bearing nodes' latest artifacts, ordered for
    /// context handoff (§4.8): `(sequence_index, node_key, run_node_id)`.
    async fn latest_reports_for_run(&self, run_id: Uuid) -> Result<Vec<PhaseArtifact>, StoreError>;

    // -- Transitions with optimistic preconditions --
    async fn transition_run(
        &self,
        run_id: Uuid,
        expected: RunStatus,
        to: RunStatus,
    ) -> Result<WorkflowRun, StoreError>;
    async fn transition_run_node(
        &self,
        run_node_id: Uuid,
        expected: RunNodeStatus,
        to: RunNodeStatus,
    ) -> Result<RunNode, StoreError>;
    /// Best-effort cancel of every non-terminal latest-attempt run-node in a
    /// run; used by lifecycle cancel (§4.10). Never fails on a losing race —
    /// it simply skips rows that moved under it.
    async fn cancel_all_nonterminal(&self, run_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    // -- Artifacts / decisions / diagnostics --
    async fn insert_artifact(&self, artifact: PhaseArtifact) -> Result<(), StoreError>;
    async fn insert_routing_decision(&self, decision: RoutingDecision) -> Result<(), StoreError>;
    async fn insert_diagnostics(
        &self,
        payload: crate::diagnostics::RunNodeDiagnosticsPayload,
    ) -> Result<(), StoreError>;

    /// Create the next attempt of a failed run-node (§4.6 retry policy).
    async fn requeue_attempt(
        &self,
        prior: &RunNode,
        overrides: Option<ErrorHandlerConfig>,
    ) -> Result<RunNode, StoreError>;

    // -- Fan-out / join (C7) --
    async fn fan_out(&self, input: FanOutInput<'_>) -> Result<FanOutResult, StoreError>;
    async fn active_barrier(
        &self,
        spawner_run_node_id: Uuid,
        join_run_node_id: Uuid,
    ) -> Result<Option<RunJoinBarrier>, StoreError>;
    async fn record_child_terminal(
        &self,
        barrier_id: Uuid,
        outcome: ChildOutcome,
    ) -> Result<RunJoinBarrier, StoreError>;
    async fn reopen_child_on_retry(
        &self,
        barrier_id: Uuid,
        prior_outcome: ChildOutcome,
    ) -> Result<RunJoinBarrier, StoreError>;
    async fn release_barrier(&self, barrier_id: Uuid) -> Result<RunJoinBarrier, StoreError>;

    async fn mark_skipped(&self, run_node_id: Uuid) -> Result<(), StoreError>;
}
