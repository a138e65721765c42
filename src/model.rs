//! Entity types for the workflow-tree data model.
//!
//! These are plain data definitions (§3 of the specification); they carry no
//! I/O and no behavior beyond small derived helpers. Store adapters map these
//! to rows; core/business modules operate on them in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a [`WorkflowTree`] version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeStatus {
    Draft,
    Published,
    Archived,
}

/// A versioned workflow topology definition.
///
/// Uniqueness: `(tree_key, version)`. The *active* version for a `tree_key`
/// is the highest `version` with `status = Published`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTree {
    pub id: Uuid,
    pub tree_key: String,
    pub version: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: TreeStatus,
}

/// The functional role a node plays in the execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Standard,
    Spawner,
    Join,
}

/// What kind of actor executes a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Agent,
    Human,
    Tool,
}

/// Error-handler override applied to retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlerConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// A node in a workflow tree's topology (template, not a run instance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: Uuid,
    pub tree_id: Uuid,
    pub node_key: String,
    pub node_role: NodeRole,
    pub node_type: NodeType,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub execution_permissions: Option<serde_json::Value>,
    pub error_handler_config: Option<ErrorHandlerConfig>,
    pub max_children: u32,
    pub max_retries: u32,
    pub sequence_index: i64,
    pub prompt_template_id: Option<Uuid>,
}

/// Which terminal class of the source node an edge is taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOn {
    Success,
    Failure,
    /// Used only by run-edges created for fan-out joins.
    Terminal,
}

/// A directed edge between two tree nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEdge {
    pub id: Uuid,
    pub tree_id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub route_on: RouteOn,
    pub priority: i64,
    pub auto: bool,
    pub guard: Option<GuardExpression>,
}

/// A leaf comparison or a boolean combination of leaves, evaluated against a
/// JSON context map with dotted field paths (e.g. `"decision.kind"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardExpression {
    Leaf {
        field: String,
        op: GuardOp,
        value: serde_json::Value,
    },
    Logic {
        logic: GuardLogic,
        conditions: Vec<GuardExpression>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardLogic {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Markdown,
    Json,
    Diff,
}

/// A reusable, versioned prompt body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: Uuid,
    pub template_key: String,
    pub version: i64,
    pub content: String,
    pub content_type: ContentType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One execution instance of a [`WorkflowTree`] version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_tree_id: Uuid,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunNodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl RunNodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunNodeStatus::Completed
                | RunNodeStatus::Failed
                | RunNodeStatus::Skipped
                | RunNodeStatus::Cancelled
        )
    }

    /// Terminal in the sense the spawner/join engine cares about: a state
    /// from which the barrier no longer expects further transitions.
    pub fn is_child_terminal(self) -> bool {
        matches!(
            self,
            RunNodeStatus::Completed | RunNodeStatus::Failed | RunNodeStatus::Cancelled
        )
    }
}

/// A per-attempt execution record for a tree node within a run.
///
/// Lineage fields (`id`, `tree_node_id`, `node_key`, `attempt`) never mutate
/// once written; only status-related fields mutate across the attempt's
/// lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNode {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub tree_node_id: Uuid,
    pub node_key: String,
    pub node_role: NodeRole,
    pub node_type: NodeType,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub prompt_content_type: ContentType,
    pub execution_permissions: Option<serde_json::Value>,
    pub error_handler_config: Option<ErrorHandlerConfig>,
    pub max_children: u32,
    pub max_retries: u32,
    pub spawner_node_id: Option<Uuid>,
    pub join_node_id: Option<Uuid>,
    pub lineage_depth: u32,
    pub sequence_path: String,
    pub status: RunNodeStatus,
    pub sequence_index: i64,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Tree,
    DynamicSpawnerToChild,
    DynamicChildToJoin,
}

/// An edge materialized for a specific run (from a tree edge, or appended
/// dynamically by fan-out).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNodeEdge {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub source_run_node_id: Uuid,
    pub target_run_node_id: Uuid,
    pub route_on: RouteOn,
    pub auto: bool,
    pub guard: Option<GuardExpression>,
    pub priority: i64,
    pub edge_kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Report,
    Log,
    Note,
}

/// A single output recorded for a run-node attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseArtifact {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub run_node_id: Uuid,
    pub artifact_type: ArtifactType,
    pub content_type: ContentType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Approved,
    ChangesRequested,
    Blocked,
    Retry,
    NoRoute,
}

impl DecisionType {
    pub fn as_guard_str(self) -> &'static str {
        match self {
            DecisionType::Approved => "approved",
            DecisionType::ChangesRequested => "changes_requested",
            DecisionType::Blocked => "blocked",
            DecisionType::Retry => "retry",
            DecisionType::NoRoute => "no_route",
        }
    }
}

/// A structured routing signal captured from provider metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub run_node_id: Uuid,
    pub decision_type: DecisionType,
    pub raw_output: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierStatus {
    Pending,
    Ready,
    Released,
    Cancelled,
}

/// Tracks a fan-out batch's progress towards its join node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJoinBarrier {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub spawner_run_node_id: Uuid,
    pub join_run_node_id: Uuid,
    pub spawn_source_artifact_id: Uuid,
    pub expected_children: u32,
    pub terminal_children: u32,
    pub completed_children: u32,
    pub failed_children: u32,
    pub status: BarrierStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Active,
    Removed,
}

/// Consumed from the external worktree/SCM collaborator; the engine only
/// reads and reports on these, it never creates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWorktree {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub repository_id: Uuid,
    pub worktree_path: String,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub status: WorktreeStatus,
}
