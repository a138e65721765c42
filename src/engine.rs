//! Process-surface facade (§5.1, §6): ties the per-run concurrency model to
//! [`crate::executor`] and [`crate::lifecycle`].
//!
//! §5 requires that "an advance step for a run runs to completion or
//! cancellation before another advance step is attempted" and that lifecycle
//! cancel/pause can interrupt an in-flight provider call. Neither property
//! falls out of `executor`/`lifecycle` alone, since both take a bare `&dyn
//! Store` with no notion of "who else is touching this run right now". This
//! module owns that notion: a `DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>`
//! serializes steps and lifecycle writes per `workflowRunId`, and a
//! `DashMap<Uuid, CancellationToken>` gives cancel/pause something to signal
//! into an in-flight step without needing the lock first (signaling the
//! token is what unblocks the step so the lock can be acquired at all).
//!
//! Exposes the six operations named in §6's process surface:
//! `execute_run`, `execute_next_runnable_node`, `cancel_run`, `pause_run`,
//! `resume_run`, `retry_run`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::executor::{self, ExecuteStepRequest, StepOutcome};
use crate::lifecycle::{self, LifecycleResult};
use crate::materializer::{self, MaterializeRunRequest, MaterializedRun};
use crate::provider::Provider;
use crate::store::Store;

/// Owns the per-run locks and cancellation tokens that back the process
/// surface. Cheap to clone: the maps hold `Arc`s internally.
#[derive(Clone, Default)]
pub struct Engine {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(run_id).or_insert_with(|| Arc::new(Mutex::new(()))).value())
    }

    /// The cancellation token currently wired into steps for `run_id`,
    /// creating a fresh one on first use.
    fn token_for(&self, run_id: Uuid) -> CancellationToken {
        self.tokens.entry(run_id).or_insert_with(CancellationToken::new).value().clone()
    }

    /// Replace `run_id`'s token with a fresh, un-cancelled one so a resumed
    /// run's next step isn't immediately aborted by the token that paused
    /// it.
    fn reset_token(&self, run_id: Uuid) {
        self.tokens.insert(run_id, CancellationToken::new());
    }

    /// Materialize a run from a published (or pinned) tree version (C4).
    pub async fn execute_run(
        &self,
        store: &dyn Store,
        request: MaterializeRunRequest<'_>,
    ) -> EngineResult<MaterializedRun> {
        materializer::materialize_run(store, request).await
    }

    /// Drive one step forward, serialized against any other step or
    /// lifecycle operation on the same run. The engine's own token for this
    /// run is threaded into `request.run_options.cancellation`, overriding
    /// whatever the caller set there.
    pub async fn execute_next_runnable_node(
        &self,
        store: &dyn Store,
        mut request: ExecuteStepRequest<'_>,
    ) -> EngineResult<StepOutcome> {
        let run_id = request.workflow_run_id;
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        request.run_options.cancellation = Some(self.token_for(run_id));
        executor::execute_next_runnable_node(store, request).await
    }

    /// Signal the run's token first (so an in-flight step can notice and
    /// finalize its own node), then take the run lock and apply the
    /// store-level cancel sweep. By the time the lock is acquired any
    /// previously in-flight step has already returned.
    pub async fn cancel_run(&self, store: &dyn Store, run_id: Uuid) -> EngineResult<LifecycleResult> {
        self.token_for(run_id).cancel();
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        lifecycle::cancel_run(store, run_id).await
    }

    /// Signal the token (unblocking an in-flight step the same way
    /// `cancel_run` does), then apply the `running -> paused` transition.
    pub async fn pause_run(&self, store: &dyn Store, run_id: Uuid) -> EngineResult<LifecycleResult> {
        self.token_for(run_id).cancel();
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        lifecycle::pause_run(store, run_id).await
    }

    /// `paused -> running`, with a fresh cancellation token so the resumed
    /// run's steps aren't immediately aborted by the token that paused it.
    pub async fn resume_run(&self, store: &dyn Store, run_id: Uuid) -> EngineResult<LifecycleResult> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        let result = lifecycle::resume_run(store, run_id).await?;
        if result.outcome == lifecycle::LifecycleOutcome::Applied {
            self.reset_token(run_id);
        }
        Ok(result)
    }

    /// `failed -> running`, requeuing the run's failed nodes as new
    /// attempts.
    pub async fn retry_run(&self, store: &dyn Store, run_id: Uuid) -> EngineResult<LifecycleResult> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        lifecycle::retry_run(store, run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;
    use crate::provider::{ProviderEvent, ProviderEventType, RunOptions, ScriptedProvider};
    use crate::store::memory::MemoryStore;
    use crate::test_support::fixtures::single_node_tree;

    fn default_step_request<'a>(
        run_id: Uuid,
        providers: &'a [(&'a str, &'a dyn Provider)],
    ) -> ExecuteStepRequest<'a> {
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

    #[tokio::test]
    async fn step_and_cancel_share_the_per_run_lock_without_deadlocking() {
        let store = MemoryStore::new();
        single_node_tree(&store, "demo").await;
        let materialized = materializer::materialize_run(
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

        let engine = Engine::new();
        let scripted = ScriptedProvider::new(vec![ProviderEvent::new(
            ProviderEventType::Result,
            Some("done".into()),
        )]);
        let registry: Vec<(&str, &dyn Provider)> = vec![("codex", &scripted)];

        let request = default_step_request(materialized.run.id, &registry);
        let outcome = engine.execute_next_runnable_node(&store, request).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Advanced { .. }));

        let cancel = engine.cancel_run(&store, materialized.run.id).await.unwrap();
        assert_eq!(cancel.outcome, lifecycle::LifecycleOutcome::Noop);
        assert_eq!(cancel.run_status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn pause_resets_to_a_fresh_token_on_resume() {
        let store = MemoryStore::new();
        single_node_tree(&store, "demo").await;
        let materialized = materializer::materialize_run(
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

        let engine = Engine::new();
        let before = engine.token_for(materialized.run.id);
        let paused = engine.pause_run(&store, materialized.run.id).await.unwrap();
        assert_eq!(paused.outcome, lifecycle::LifecycleOutcome::Applied);
        assert!(before.is_cancelled());

        let resumed = engine.resume_run(&store, materialized.run.id).await.unwrap();
        assert_eq!(resumed.outcome, lifecycle::LifecycleOutcome::Applied);
        let after = engine.token_for(materialized.run.id);
        assert!(!after.is_cancelled());
    }
}
