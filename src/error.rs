//! Typed error taxonomy for the engine's public API (§7).
//!
//! Internal I/O-adjacent helpers still use `anyhow` the way the teacher's
//! `io/` modules do; this enum is the boundary callers match on.

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("workflow tree not found: {tree_key}{}", version.map(|v| format!(" v{v}")).unwrap_or_default())]
    WorkflowTreeNotFound {
        tree_key: String,
        version: Option<i64>,
    },

    #[error("ambiguous published version for tree {tree_key}: {versions:?}")]
    AmbiguousWorkflowTreeVersion {
        tree_key: String,
        versions: Vec<i64>,
    },

    #[error("topology integrity error: {0}")]
    IntegrityError(String),

    #[error("unknown agent provider: {0}")]
    UnknownAgentProvider(String),

    #[error("provider returned invalid options: {0}")]
    ProviderInvalidOptions(String),

    #[error("provider emitted an invalid event: {0}")]
    ProviderInvalidEvent(String),

    #[error("provider stream ended without a result event")]
    ProviderMissingResult,

    #[error("provider run failed: {0}")]
    ProviderRunFailed(String),

    #[error("spawner output invalid: {0}")]
    SpawnerOutputInvalid(String),

    #[error("spawner nested fan-out rejected: lineage depth {0} > 0")]
    SpawnerDepthExceeded(u32),

    #[error("join barrier invariant violated: {0}")]
    JoinBarrierStateInvalid(String),

    #[error("run {0} control conflict")]
    WorkflowRunControlConflict(Uuid),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

pub type EngineResult<T> = Result<T, EngineError>;
