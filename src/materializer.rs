//! Run materializer (C4, §4.4).
//!
//! Thin orchestration over [`crate::topology::load_topology`] and
//! [`crate::store::Store::materialize_run`]: resolves the tree version, then
//! asks the store to build the run-node/run-edge snapshot in one
//! transaction. The store owns the actual insert logic (it is the only
//! component that can make materialization atomic per-adapter); this module
//! is the public entry point `executeRun` callers invoke.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::model::WorkflowRun;
use crate::prompt::render_prompt_template;
use crate::store::{MaterializeInput, Store};
use crate::topology::load_topology;

pub struct MaterializeRunRequest<'a> {
    pub tree_key: &'a str,
    pub tree_version: Option<i64>,
    pub start_running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct MaterializedRun {
    pub run: WorkflowRun,
    pub initial_runnable_node_keys: Vec<String>,
}

pub async fn materialize_run(
    store: &dyn Store,
    request: MaterializeRunRequest<'_>,
) -> EngineResult<MaterializedRun> {
    let topology = load_topology(store, request.tree_key, request.tree_version).await?;

    let mut rendered_prompts = HashMap::new();
    for node in &topology.nodes {
        let Some(template_id) = node.prompt_template_id else {
            continue;
        };
        let template = store.get_prompt_template(template_id).await?;
        let content_type = template.content_type;
        let rendered = render_prompt_template(&template, &topology.tree, node)?;
        rendered_prompts.insert(node.id, (rendered, content_type));
    }

    let result = store
        .materialize_run(MaterializeInput {
            tree: &topology.tree,
            nodes: &topology.nodes,
            edges: &topology.edges,
            start_running: request.start_running,
            started_at: request.started_at,
            rendered_prompts: &rendered_prompts,
        })
        .await?;

    Ok(MaterializedRun {
        run: result.run,
        initial_runnable_node_keys: result.initial_runnable_node_keys,
    })
}

pub async fn get_run(store: &dyn Store, run_id: Uuid) -> EngineResult<WorkflowRun> {
    Ok(store.get_run(run_id).await?)
}
