//! `sqlx`/Postgres-backed store adapter (feature = "postgres").
//!
//! Grounded on the `sqlx::PgPool` + explicit `Transaction` idiom used by
//! `forge-core`'s route handlers and the connection-provider trait split in
//! `chem-persistence`'s `pg::mod` (a thin seam so tests can substitute a pool
//! without touching call sites). Enum and guard columns are stored as
//! `TEXT`/`JSONB` and converted at the boundary — see `enum_sql` below —
//! rather than via custom `sqlx::Type` impls, keeping the mapping obvious to
//! audit against `migrations/0001_init.sql`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::diagnostics::RunNodeDiagnosticsPayload;
use crate::model::*;

use super::{
    ChildOutcome, FanOutInput, FanOutResult, MaterializeInput, MaterializeResult, Store,
    StoreError,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

mod enum_sql {
    use crate::model::*;

    pub fn tree_status(s: TreeStatus) -> &'static str {
        match s {
            TreeStatus::Draft => "draft",
            TreeStatus::Published => "published",
            TreeStatus::Archived => "archived",
        }
    }
    pub fn parse_tree_status(s: &str) -> TreeStatus {
        match s {
            "published" => TreeStatus::Published,
            "archived" => TreeStatus::Archived,
            _ => TreeStatus::Draft,
        }
    }

    pub fn node_role(r: NodeRole) -> &'static str {
        match r {
            NodeRole::Standard => "standard",
            NodeRole::Spawner => "spawner",
            NodeRole::Join => "join",
        }
    }
    pub fn parse_node_role(s: &str) -> NodeRole {
        match s {
            "spawner" => NodeRole::Spawner,
            "join" => NodeRole::Join,
            _ => NodeRole::Standard,
        }
    }

    pub fn node_type(t: NodeType) -> &'static str {
        match t {
            NodeType::Agent => "agent",
            NodeType::Human => "human",
            NodeType::Tool => "tool",
        }
    }
    pub fn parse_node_type(s: &str) -> NodeType {
        match s {
            "human" => NodeType::Human,
            "tool" => NodeType::Tool,
            _ => NodeType::Agent,
        }
    }

    pub fn route_on(r: RouteOn) -> &'static str {
        match r {
            RouteOn::Success => "success",
            RouteOn::Failure => "failure",
            RouteOn::Terminal => "terminal",
        }
    }
    pub fn parse_route_on(s: &str) -> RouteOn {
        match s {
            "failure" => RouteOn::Failure,
            "terminal" => RouteOn::Terminal,
            _ => RouteOn::Success,
        }
    }

    pub fn content_type(c: ContentType) -> &'static str {
        match c {
            ContentType::Text => "text",
            ContentType::Markdown => "markdown",
            ContentType::Json => "json",
            ContentType::Diff => "diff",
        }
    }
    pub fn parse_content_type(s: &str) -> ContentType {
        match s {
            "markdown" => ContentType::Markdown,
            "json" => ContentType::Json,
            "diff" => ContentType::Diff,
            _ => ContentType::Text,
        }
    }

    pub fn run_status(s: RunStatus) -> &'static str {
        match s {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
    pub fn parse_run_status(s: &str) -> RunStatus {
        match s {
            "running" => RunStatus::Running,
            "paused" => RunStatus::Paused,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Pending,
        }
    }

    pub fn run_node_status(s: RunNodeStatus) -> &'static str {
        match s {
            RunNodeStatus::Pending => "pending",
            RunNodeStatus::Running => "running",
            RunNodeStatus::Completed => "completed",
            RunNodeStatus::Failed => "failed",
            RunNodeStatus::Skipped => "skipped",
            RunNodeStatus::Cancelled => "cancelled",
        }
    }
    pub fn parse_run_node_status(s: &str) -> RunNodeStatus {
        match s {
            "running" => RunNodeStatus::Running,
            "completed" => RunNodeStatus::Completed,
            "failed" => RunNodeStatus::Failed,
            "skipped" => RunNodeStatus::Skipped,
            "cancelled" => RunNodeStatus::Cancelled,
            _ => RunNodeStatus::Pending,
        }
    }

    pub fn edge_kind(k: EdgeKind) -> &'static str {
        match k {
            EdgeKind::Tree => "tree",
            EdgeKind::DynamicSpawnerToChild => "dynamic_spawner_to_child",
            EdgeKind::DynamicChildToJoin => "dynamic_child_to_join",
        }
    }
    pub fn parse_edge_kind(s: &str) -> EdgeKind {
        match s {
            "dynamic_spawner_to_child" => EdgeKind::DynamicSpawnerToChild,
            "dynamic_child_to_join" => EdgeKind::DynamicChildToJoin,
            _ => EdgeKind::Tree,
        }
    }

    pub fn artifact_type(a: ArtifactType) -> &'static str {
        match a {
            ArtifactType::Report => "report",
            ArtifactType::Log => "log",
            ArtifactType::Note => "note",
        }
    }
    pub fn parse_artifact_type(s: &str) -> ArtifactType {
        match s {
            "log" => ArtifactType::Log,
            "note" => ArtifactType::Note,
            _ => ArtifactType::Report,
        }
    }

    pub fn decision_type(d: DecisionType) -> &'static str {
        match d {
            DecisionType::Approved => "approved",
            DecisionType::ChangesRequested => "changes_requested",
            DecisionType::Blocked => "blocked",
            DecisionType::Retry => "retry",
            DecisionType::NoRoute => "no_route",
        }
    }
    pub fn parse_decision_type(s: &str) -> DecisionType {
        match s {
            "changes_requested" => DecisionType::ChangesRequested,
            "blocked" => DecisionType::Blocked,
            "retry" => DecisionType::Retry,
            "no_route" => DecisionType::NoRoute,
            _ => DecisionType::Approved,
        }
    }

    pub fn barrier_status(b: BarrierStatus) -> &'static str {
        match b {
            BarrierStatus::Pending => "pending",
            BarrierStatus::Ready => "ready",
            BarrierStatus::Released => "released",
            BarrierStatus::Cancelled => "cancelled",
        }
    }
    pub fn parse_barrier_status(s: &str) -> BarrierStatus {
        match s {
            "ready" => BarrierStatus::Ready,
            "released" => BarrierStatus::Released,
            "cancelled" => BarrierStatus::Cancelled,
            _ => BarrierStatus::Pending,
        }
    }
}
use enum_sql::*;

async fn insert_run_node(
    tx: &mut Transaction<'_, Postgres>,
    rn: &RunNode,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"INSERT INTO run_nodes (
            id, workflow_run_id, tree_node_id, node_key, node_role, node_type,
            provider, model, prompt, prompt_content_type, execution_permissions,
            error_handler_config, max_children, max_retries, spawner_node_id,
            join_node_id, lineage_depth, sequence_path, status, sequence_index,
            attempt, started_at, completed_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23)"#,
    )
    .bind(rn.id)
    .bind(rn.workflow_run_id)
    .bind(rn.tree_node_id)
    .bind(&rn.node_key)
    .bind(node_role(rn.node_role))
    .bind(node_type(rn.node_type))
    .bind(&rn.provider)
    .bind(&rn.model)
    .bind(&rn.prompt)
    .bind(content_type(rn.prompt_content_type))
    .bind(&rn.execution_permissions)
    .bind(serde_json::to_value(&rn.error_handler_config).ok())
    .bind(rn.max_children as i64)
    .bind(rn.max_retries as i64)
    .bind(rn.spawner_node_id)
    .bind(rn.join_node_id)
    .bind(rn.lineage_depth as i64)
    .bind(&rn.sequence_path)
    .bind(run_node_status(rn.status))
    .bind(rn.sequence_index)
    .bind(rn.attempt as i64)
    .bind(rn.started_at)
    .bind(rn.completed_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_run_edge(
    tx: &mut Transaction<'_, Postgres>,
    re: &RunNodeEdge,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"INSERT INTO run_node_edges (
            id, workflow_run_id, source_run_node_id, target_run_node_id,
            route_on, auto, guard, priority, edge_kind
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
    )
    .bind(re.id)
    .bind(re.workflow_run_id)
    .bind(re.source_run_node_id)
    .bind(re.target_run_node_id)
    .bind(route_on(re.route_on))
    .bind(re.auto)
    .bind(serde_json::to_value(&re.guard).ok())
    .bind(re.priority)
    .bind(edge_kind(re.edge_kind))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn find_published_tree_versions(&self, tree_key: &str) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT version FROM workflow_trees WHERE tree_key = $1 AND status = 'published' ORDER BY version",
        )
        .bind(tree_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    async fn load_tree_version(
        &self,
        tree_key: &str,
        version: i64,
    ) -> Result<(WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>), StoreError> {
        let row: Option<(Uuid, String, i64, String, Option<String>, String)> = sqlx::query_as(
            "SELECT id, tree_key, version, name, description, status FROM workflow_trees WHERE tree_key = $1 AND version = $2",
        )
        .bind(tree_key)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        let (id, tree_key, version, name, description, status) =
            row.ok_or_else(|| StoreError::NotFound(format!("tree {tree_key} v{version}")))?;
        let tree = WorkflowTree {
            id,
            tree_key,
            version,
            name,
            description,
            status: parse_tree_status(&status),
        };

        let node_rows: Vec<(
            Uuid,
            Uuid,
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<serde_json::Value>,
            Option<serde_json::Value>,
            i64,
            i64,
            i64,
            Option<Uuid>,
        )> = sqlx::query_as(
            r#"SELECT id, tree_id, node_key, node_role, node_type, provider, model,
                   execution_permissions, error_handler_config, max_children, max_retries,
                   sequence_index, prompt_template_id
            FROM tree_nodes WHERE tree_id = $1 ORDER BY sequence_index, node_key, id"#,
        )
        .bind(tree.id)
        .fetch_all(&self.pool)
        .await?;
        let nodes: Vec<TreeNode> = node_rows
            .into_iter()
            .map(
                |(
                    id,
                    tree_id,
                    node_key,
                    role,
                    ntype,
                    provider,
                    model,
                    exec_perms,
                    handler,
                    max_children,
                    max_retries,
                    sequence_index,
                    prompt_template_id,
                )| TreeNode {
                    id,
                    tree_id,
                    node_key,
                    node_role: parse_node_role(&role),
                    node_type: parse_node_type(&ntype),
                    provider,
                    model,
                    execution_permissions: exec_perms,
                    error_handler_config: handler.and_then(|v| serde_json::from_value(v).ok()),
                    max_children: max_children as u32,
                    max_retries: max_retries as u32,
                    sequence_index,
                    prompt_template_id,
                },
            )
            .collect();

        let edge_rows: Vec<(
            Uuid,
            Uuid,
            Uuid,
            Uuid,
            String,
            i64,
            bool,
            Option<serde_json::Value>,
        )> = sqlx::query_as(
            r#"SELECT te.id, te.tree_id, te.source_node_id, te.target_node_id, te.route_on,
                      te.priority, te.auto, te.guard
            FROM tree_edges te
            JOIN tree_nodes sn ON sn.id = te.source_node_id
            WHERE te.tree_id = $1
            ORDER BY sn.sequence_index, te.route_on, te.priority, te.id"#,
        )
        .bind(tree.id)
        .fetch_all(&self.pool)
        .await?;
        let edges: Vec<TreeEdge> = edge_rows
            .into_iter()
            .map(
                |(id, tree_id, source_node_id, target_node_id, route_on, priority, auto, guard)| {
                    TreeEdge {
                        id,
                        tree_id,
                        source_node_id,
                        target_node_id,
                        route_on: parse_route_on(&route_on),
                        priority,
                        auto,
                        guard: guard.and_then(|v| serde_json::from_value(v).ok()),
                    }
                },
            )
            .collect();

        Ok((tree, nodes, edges))
    }

    async fn get_prompt_template(&self, id: Uuid) -> Result<PromptTemplate, StoreError> {
        let row: Option<(Uuid, String, i64, String, String)> = sqlx::query_as(
            "SELECT id, template_key, version, content, content_type FROM prompt_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let (id, template_key, version, content, content_type_s) =
            row.ok_or_else(|| StoreError::NotFound(format!("prompt template {id}")))?;
        Ok(PromptTemplate {
            id,
            template_key,
            version,
            content,
            content_type: parse_content_type(&content_type_s),
        })
    }

    async fn materialize_run(
        &self,
        input: MaterializeInput<'_>,
    ) -> Result<MaterializeResult, StoreError> {
        let mut tx = self.pool.begin().await?;
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let status = if input.start_running {
            RunStatus::Running
        } else {
            RunStatus::Pending
        };
        let started_at = if input.start_running {
            Some(input.started_at.unwrap_or(now))
        } else {
            None
        };
        sqlx::query(
            "INSERT INTO workflow_runs (id, workflow_tree_id, status, started_at, completed_at) VALUES ($1,$2,$3,$4,NULL)",
        )
        .bind(run_id)
        .bind(input.tree.id)
        .bind(run_status(status))
        .bind(started_at)
        .execute(&mut *tx)
        .await?;

        let mut tree_to_run = std::collections::HashMap::new();
        let mut run_nodes = Vec::with_capacity(input.nodes.len());
        for tn in input.nodes {
            let run_node_id = Uuid::new_v4();
            tree_to_run.insert(tn.id, run_node_id);
            let (prompt, prompt_content_type) = match input.rendered_prompts.get(&tn.id) {
                Some((text, content_type)) => (Some(text.clone()), *content_type),
                None => (None, ContentType::Text),
            };
            let rn = RunNode {
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
            };
            insert_run_node(&mut tx, &rn).await?;
            run_nodes.push(rn);
        }

        let mut has_incoming: std::collections::HashMap<Uuid, bool> =
            input.nodes.iter().map(|n| (n.id, false)).collect();
        let mut run_edges = Vec::with_capacity(input.edges.len());
        for te in input.edges {
            let source = *tree_to_run.get(&te.source_node_id).ok_or_else(|| {
                StoreError::Conflict(format!("edge {} missing source mapping", te.id))
            })?;
            let target = *tree_to_run.get(&te.target_node_id).ok_or_else(|| {
                StoreError::Conflict(format!("edge {} missing target mapping", te.id))
            })?;
            has_incoming.insert(te.target_node_id, true);
            let re = RunNodeEdge {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                source_run_node_id: source,
                target_run_node_id: target,
                route_on: te.route_on,
                auto: te.auto,
                guard: te.guard.clone(),
                priority: te.priority,
                edge_kind: EdgeKind::Tree,
            };
            insert_run_edge(&mut tx, &re).await?;
            run_edges.push(re);
        }

        let initial_runnable_node_keys = input
            .nodes
            .iter()
            .filter(|n| !*has_incoming.get(&n.id).unwrap_or(&false))
            .map(|n| n.node_key.clone())
            .collect();

        tx.commit().await?;

        Ok(MaterializeResult {
            run: WorkflowRun {
                id: run_id,
                workflow_tree_id: input.tree.id,
                status,
                started_at,
                completed_at: None,
            },
            run_nodes,
            run_edges,
            initial_runnable_node_keys,
        })
    }

    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, StoreError> {
        let row: Option<(Uuid, Uuid, String, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                "SELECT id, workflow_tree_id, status, started_at, completed_at FROM workflow_runs WHERE id = $1",
            )
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        let (id, workflow_tree_id, status, started_at, completed_at) =
            row.ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        Ok(WorkflowRun {
            id,
            workflow_tree_id,
            status: parse_run_status(&status),
            started_at,
            completed_at,
        })
    }

    async fn latest_run_nodes(&self, run_id: Uuid) -> Result<Vec<RunNode>, StoreError> {
        let rows = sqlx::query_as::<_, RunNodeRow>(
            r#"SELECT DISTINCT ON (node_key) id, workflow_run_id, tree_node_id, node_key,
                node_role, node_type, provider, model, prompt, prompt_content_type,
                execution_permissions, error_handler_config, max_children, max_retries,
                spawner_node_id, join_node_id, lineage_depth, sequence_path, status,
                sequence_index, attempt, started_at, completed_at
            FROM run_nodes WHERE workflow_run_id = $1
            ORDER BY node_key, attempt DESC, id DESC"#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let mut nodes: Vec<RunNode> = rows.into_iter().map(Into::into).collect();
        nodes.sort_by_key(|n| (n.sequence_index, n.node_key.clone()));
        Ok(nodes)
    }

    async fn get_run_node(&self, run_node_id: Uuid) -> Result<RunNode, StoreError> {
        let row = sqlx::query_as::<_, RunNodeRow>(
            r#"SELECT id, workflow_run_id, tree_node_id, node_key, node_role, node_type,
                provider, model, prompt, prompt_content_type, execution_permissions,
                error_handler_config, max_children, max_retries, spawner_node_id,
                join_node_id, lineage_depth, sequence_path, status, sequence_index,
                attempt, started_at, completed_at
            FROM run_nodes WHERE id = $1"#,
        )
        .bind(run_node_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("run node {run_node_id}")))?;
        Ok(row.into())
    }

    async fn run_node_edges(&self, run_id: Uuid) -> Result<Vec<RunNodeEdge>, StoreError> {
        let rows: Vec<(
            Uuid,
            Uuid,
            Uuid,
            Uuid,
            String,
            bool,
            Option<serde_json::Value>,
            i64,
            String,
        )> = sqlx::query_as(
            r#"SELECT id, workflow_run_id, source_run_node_id, target_run_node_id, route_on,
                auto, guard, priority, edge_kind
            FROM run_node_edges WHERE workflow_run_id = $1 ORDER BY id"#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    workflow_run_id,
                    source_run_node_id,
                    target_run_node_id,
                    route_on,
                    auto,
                    guard,
                    priority,
                    kind,
                )| RunNodeEdge {
                    id,
                    workflow_run_id,
                    source_run_node_id,
                    target_run_node_id,
                    route_on: parse_route_on(&route_on),
                    auto,
                    guard: guard.and_then(|v| serde_json::from_value(v).ok()),
                    priority,
                    edge_kind: parse_edge_kind(&kind),
                },
            )
            .collect())
    }

    async fn latest_routing_decision(
        &self,
        run_node_id: Uuid,
    ) -> Result<Option<RoutingDecision>, StoreError> {
        let row: Option<(Uuid, Uuid, Uuid, String, serde_json::Value, DateTime<Utc>)> =
            sqlx::query_as(
                r#"SELECT id, workflow_run_id, run_node_id, decision_type, raw_output, created_at
                FROM routing_decisions WHERE run_node_id = $1 ORDER BY created_at DESC LIMIT 1"#,
            )
            .bind(run_node_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(
            |(id, workflow_run_id, run_node_id, decision_type, raw_output, created_at)| {
                RoutingDecision {
                    id,
                    workflow_run_id,
                    run_node_id,
                    decision_type: parse_decision_type(&decision_type),
                    raw_output,
                    created_at,
                }
            },
        ))
    }

    async fn latest_artifact(
        &self,
        run_node_id: Uuid,
        artifact_type: ArtifactType,
    ) -> Result<Option<PhaseArtifact>, StoreError> {
        let row: Option<ArtifactRow> = sqlx::query_as(
            r#"SELECT id, workflow_run_id, run_node_id, artifact_type, content_type, content,
                metadata, created_at
            FROM phase_artifacts WHERE run_node_id = $1 AND artifact_type = $2
            ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(run_node_id)
        .bind(enum_sql::artifact_type(artifact_type))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn latest_reports_for_run(&self, run_id: Uuid) -> Result<Vec<PhaseArtifact>, StoreError> {
        let rows: Vec<ArtifactRow> = sqlx::query_as(
            r#"SELECT DISTINCT ON (pa.run_node_id) pa.id, pa.workflow_run_id, pa.run_node_id,
                pa.artifact_type, pa.content_type, pa.content, pa.metadata, pa.created_at
            FROM phase_artifacts pa
            JOIN run_nodes rn ON rn.id = pa.run_node_id
            WHERE pa.workflow_run_id = $1 AND pa.artifact_type = 'report'
            ORDER BY pa.run_node_id, pa.created_at DESC"#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let mut with_keys: Vec<(i64, String, PhaseArtifact)> = Vec::new();
        for row in rows {
            let rn = self.get_run_node(row.run_node_id).await?;
            with_keys.push((rn.sequence_index, rn.node_key, row.into()));
        }
        with_keys.sort_by(|a, b| (a.0, &a.1, a.2.run_node_id).cmp(&(b.0, &b.1, b.2.run_node_id)));
        Ok(with_keys.into_iter().map(|(_, _, a)| a).collect())
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
        let now = Utc::now();
        let (started_clause, completed_clause) = match crate::state_machine::run_timestamp_effect(to) {
            crate::state_machine::TimestampEffect::StampStarted => ("started_at = $4", "completed_at = completed_at"),
            crate::state_machine::TimestampEffect::StampCompleted => ("started_at = started_at", "completed_at = $4"),
            _ => ("started_at = started_at", "completed_at = completed_at"),
        };
        let sql = format!(
            "UPDATE workflow_runs SET status = $1, {started_clause}, {completed_clause} WHERE id = $2 AND status = $3"
        );
        let result = sqlx::query(&sql)
            .bind(run_status(to))
            .bind(run_id)
            .bind(run_status(expected))
            .bind(now)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::PreconditionFailed {
                expected: format!("{expected:?}"),
                actual: "unknown (lost race or already transitioned)".into(),
            });
        }
        self.get_run(run_id).await
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
        let now = Utc::now();
        use crate::state_machine::TimestampEffect::*;
        let (started, completed) = match crate::state_machine::run_node_timestamp_effect(to) {
            StampStarted => (Some(now), None),
            StampCompleted => (None, Some(now)),
            ClearStarted => (Some(now), None), // cleared below via NULL bind path
            None => (Option::<DateTime<Utc>>::None, Option::<DateTime<Utc>>::None),
        };
        let clear_started = matches!(
            crate::state_machine::run_node_timestamp_effect(to),
            crate::state_machine::TimestampEffect::ClearStarted
        );
        let result = sqlx::query(
            r#"UPDATE run_nodes SET status = $1,
                started_at = CASE WHEN $5 THEN NULL WHEN $4::timestamptz IS NOT NULL THEN $4 ELSE started_at END,
                completed_at = COALESCE($6, completed_at)
            WHERE id = $2 AND status = $3"#,
        )
        .bind(run_node_status(to))
        .bind(run_node_id)
        .bind(run_node_status(expected))
        .bind(started)
        .bind(clear_started)
        .bind(completed)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::PreconditionFailed {
                expected: format!("{expected:?}"),
                actual: "unknown (lost race or already transitioned)".into(),
            });
        }
        self.get_run_node(run_node_id).await
    }

    async fn cancel_all_nonterminal(&self, run_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let latest = self.latest_run_nodes(run_id).await?;
        let mut cancelled = Vec::new();
        for rn in latest {
            if rn.status.is_terminal() {
                continue;
            }
            if self
                .transition_run_node(rn.id, rn.status, RunNodeStatus::Cancelled)
                .await
                .is_ok()
            {
                cancelled.push(rn.id);
            }
        }
        Ok(cancelled)
    }

    async fn insert_artifact(&self, artifact: PhaseArtifact) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO phase_artifacts (id, workflow_run_id, run_node_id, artifact_type,
                content_type, content, metadata, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"#,
        )
        .bind(artifact.id)
        .bind(artifact.workflow_run_id)
        .bind(artifact.run_node_id)
        .bind(artifact_type(artifact.artifact_type))
        .bind(content_type(artifact.content_type))
        .bind(&artifact.content)
        .bind(&artifact.metadata)
        .bind(artifact.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_routing_decision(&self, decision: RoutingDecision) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO routing_decisions (id, workflow_run_id, run_node_id, decision_type,
                raw_output, created_at) VALUES ($1,$2,$3,$4,$5,$6)"#,
        )
        .bind(decision.id)
        .bind(decision.workflow_run_id)
        .bind(decision.run_node_id)
        .bind(decision_type(decision.decision_type))
        .bind(&decision.raw_output)
        .bind(decision.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_diagnostics(
        &self,
        payload: RunNodeDiagnosticsPayload,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(&payload)
            .map_err(|e| StoreError::Conflict(format!("diagnostics serialize: {e}")))?;
        sqlx::query(
            r#"INSERT INTO run_node_diagnostics (id, workflow_run_id, run_node_id, attempt, payload, created_at)
            VALUES ($1,$2,$3,$4,$5,$6)"#,
        )
        .bind(Uuid::new_v4())
        .bind(payload.workflow_run_id)
        .bind(payload.run_node_id)
        .bind(payload.attempt as i64)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_attempt(
        &self,
        prior: &RunNode,
        overrides: Option<ErrorHandlerConfig>,
    ) -> Result<RunNode, StoreError> {
        let mut next = prior.clone();
        next.id = Uuid::new_v4();
        next.attempt = prior.attempt + 1;
        next.status = RunNodeStatus::Pending;
        next.started_at = None;
        next.completed_at = None;
        next.prompt = None;
        if let Some(handler) = overrides {
            if let Some(p) = handler.provider {
                next.provider = Some(p);
            }
            if let Some(m) = handler.model {
                next.model = Some(m);
            }
        }
        let mut tx = self.pool.begin().await?;
        insert_run_node(&mut tx, &next).await?;

        // Re-point every edge that referenced the prior attempt's id at the
        // new attempt: edges are keyed by literal run-node id, not by the
        // attempt-stable tree_node_id/node_key, so a requeue that left them
        // alone would make the new attempt's incoming/outgoing edges
        // invisible to routing.rs's snapshot.
        sqlx::query("UPDATE run_node_edges SET source_run_node_id = $1 WHERE source_run_node_id = $2")
            .bind(next.id)
            .bind(prior.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE run_node_edges SET target_run_node_id = $1 WHERE target_run_node_id = $2")
            .bind(next.id)
            .bind(prior.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(next)
    }

    async fn fan_out(&self, input: FanOutInput<'_>) -> Result<FanOutResult, StoreError> {
        if input.spawner_run_node.lineage_depth > 0 {
            return Err(StoreError::Conflict(
                "SPAWNER_DEPTH_EXCEEDED: nested fan-out is rejected".into(),
            ));
        }
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> = sqlx::query_as(
            r#"SELECT status FROM run_join_barriers
            WHERE spawner_run_node_id = $1 AND join_run_node_id = $2
              AND status NOT IN ('released', 'cancelled')"#,
        )
        .bind(input.spawner_run_node.id)
        .bind(input.join_run_node_id)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Err(StoreError::Conflict(format!(
                "active join barrier already exists for spawner {} / join {}",
                input.spawner_run_node.id, input.join_run_node_id
            )));
        }

        let now = Utc::now();
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
                provider: spec.provider.clone().or_else(|| input.spawner_run_node.provider.clone()),
                model: spec.model.clone().or_else(|| input.spawner_run_node.model.clone()),
                prompt: spec.prompt.clone(),
                prompt_content_type: ContentType::Text,
                execution_permissions: input.spawner_run_node.execution_permissions.clone(),
                error_handler_config: input.spawner_run_node.error_handler_config.clone(),
                max_children: 0,
                max_retries: input.spawner_run_node.max_retries,
                spawner_node_id: Some(input.spawner_run_node.id),
                join_node_id: Some(input.join_run_node_id),
                lineage_depth: input.spawner_run_node.lineage_depth + 1,
                sequence_path: format!("{}.{}", input.spawner_run_node.sequence_path, children.len()),
                status: RunNodeStatus::Pending,
                sequence_index: input.spawner_run_node.sequence_index,
                attempt: 1,
                started_at: None,
                completed_at: None,
            };
            insert_run_node(&mut tx, &child).await?;
            let spawn_edge = RunNodeEdge {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                source_run_node_id: input.spawner_run_node.id,
                target_run_node_id: child_id,
                route_on: RouteOn::Terminal,
                auto: true,
                guard: None,
                priority: 0,
                edge_kind: EdgeKind::DynamicSpawnerToChild,
            };
            insert_run_edge(&mut tx, &spawn_edge).await?;
            let join_edge = RunNodeEdge {
                id: Uuid::new_v4(),
                workflow_run_id: run_id,
                source_run_node_id: child_id,
                target_run_node_id: input.join_run_node_id,
                route_on: RouteOn::Terminal,
                auto: true,
                guard: None,
                priority: 0,
                edge_kind: EdgeKind::DynamicChildToJoin,
            };
            insert_run_edge(&mut tx, &join_edge).await?;
            edges.push(spawn_edge);
            edges.push(join_edge);
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
        sqlx::query(
            r#"INSERT INTO run_join_barriers (id, workflow_run_id, spawner_run_node_id,
                join_run_node_id, spawn_source_artifact_id, expected_children, terminal_children,
                completed_children, failed_children, status, created_at, updated_at, released_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,NULL)"#,
        )
        .bind(barrier.id)
        .bind(barrier.workflow_run_id)
        .bind(barrier.spawner_run_node_id)
        .bind(barrier.join_run_node_id)
        .bind(barrier.spawn_source_artifact_id)
        .bind(barrier.expected_children as i64)
        .bind(barrier.terminal_children as i64)
        .bind(barrier.completed_children as i64)
        .bind(barrier.failed_children as i64)
        .bind(barrier_status(barrier.status))
        .bind(barrier.created_at)
        .bind(barrier.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(FanOutResult { children, edges, barrier })
    }

    async fn active_barrier(
        &self,
        spawner_run_node_id: Uuid,
        join_run_node_id: Uuid,
    ) -> Result<Option<RunJoinBarrier>, StoreError> {
        let row: Option<BarrierRow> = sqlx::query_as(
            r#"SELECT id, workflow_run_id, spawner_run_node_id, join_run_node_id,
                spawn_source_artifact_id, expected_children, terminal_children,
                completed_children, failed_children, status, created_at, updated_at, released_at
            FROM run_join_barriers
            WHERE spawner_run_node_id = $1 AND join_run_node_id = $2
            ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(spawner_run_node_id)
        .bind(join_run_node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn record_child_terminal(
        &self,
        barrier_id: Uuid,
        outcome: ChildOutcome,
    ) -> Result<RunJoinBarrier, StoreError> {
        let column = match outcome {
            ChildOutcome::Completed => "completed_children",
            ChildOutcome::Failed => "failed_children",
        };
        let sql = format!(
            r#"UPDATE run_join_barriers SET
                {column} = {column} + 1,
                terminal_children = terminal_children + 1,
                status = CASE WHEN terminal_children + 1 = expected_children THEN 'ready' ELSE status END,
                updated_at = now()
            WHERE id = $1
            RETURNING id, workflow_run_id, spawner_run_node_id, join_run_node_id,
                spawn_source_artifact_id, expected_children, terminal_children,
                completed_children, failed_children, status, created_at, updated_at, released_at"#
        );
        let row: BarrierRow = sqlx::query_as(&sql)
            .bind(barrier_id)
            .fetch_one(&self.pool)
            .await?;
        if row.terminal_children > row.expected_children
            || row.completed_children + row.failed_children > row.terminal_children
        {
            return Err(StoreError::Conflict(format!(
                "JOIN_BARRIER_STATE_INVALID: barrier {barrier_id} counters out of range"
            )));
        }
        Ok(row.into())
    }

    async fn reopen_child_on_retry(
        &self,
        barrier_id: Uuid,
        prior_outcome: ChildOutcome,
    ) -> Result<RunJoinBarrier, StoreError> {
        let column = match prior_outcome {
            ChildOutcome::Completed => "completed_children",
            ChildOutcome::Failed => "failed_children",
        };
        let sql = format!(
            r#"UPDATE run_join_barriers SET
                {column} = GREATEST({column} - 1, 0),
                terminal_children = GREATEST(terminal_children - 1, 0),
                status = CASE WHEN status = 'ready' AND terminal_children - 1 < expected_children
                          THEN 'pending' ELSE status END,
                updated_at = now()
            WHERE id = $1
            RETURNING id, workflow_run_id, spawner_run_node_id, join_run_node_id,
                spawn_source_artifact_id, expected_children, terminal_children,
                completed_children, failed_children, status, created_at, updated_at, released_at"#
        );
        let row: BarrierRow = sqlx::query_as(&sql)
            .bind(barrier_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn release_barrier(&self, barrier_id: Uuid) -> Result<RunJoinBarrier, StoreError> {
        let result = sqlx::query(
            "UPDATE run_join_barriers SET status = 'released', released_at = now(), updated_at = now() WHERE id = $1 AND status = 'ready'",
        )
        .bind(barrier_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::Conflict(format!(
                "barrier {barrier_id} is not ready for release"
            )));
        }
        let row: BarrierRow = sqlx::query_as(
            r#"SELECT id, workflow_run_id, spawner_run_node_id, join_run_node_id,
                spawn_source_artifact_id, expected_children, terminal_children,
                completed_children, failed_children, status, created_at, updated_at, released_at
            FROM run_join_barriers WHERE id = $1"#,
        )
        .bind(barrier_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn mark_skipped(&self, run_node_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE run_nodes SET status = 'skipped', completed_at = now() WHERE id = $1 AND status = 'pending'",
        )
        .bind(run_node_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(StoreError::PreconditionFailed {
                expected: "Pending".into(),
                actual: "unknown".into(),
            });
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct RunNodeRow {
    id: Uuid,
    workflow_run_id: Uuid,
    tree_node_id: Uuid,
    node_key: String,
    node_role: String,
    node_type: String,
    provider: Option<String>,
    model: Option<String>,
    prompt: Option<String>,
    prompt_content_type: String,
    execution_permissions: Option<serde_json::Value>,
    error_handler_config: Option<serde_json::Value>,
    max_children: i64,
    max_retries: i64,
    spawner_node_id: Option<Uuid>,
    join_node_id: Option<Uuid>,
    lineage_depth: i64,
    sequence_path: String,
    status: String,
    sequence_index: i64,
    attempt: i64,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<RunNodeRow> for RunNode {
    fn from(r: RunNodeRow) -> Self {
        RunNode {
            id: r.id,
            workflow_run_id: r.workflow_run_id,
            tree_node_id: r.tree_node_id,
            node_key: r.node_key,
            node_role: parse_node_role(&r.node_role),
            node_type: parse_node_type(&r.node_type),
            provider: r.provider,
            model: r.model,
            prompt: r.prompt,
            prompt_content_type: parse_content_type(&r.prompt_content_type),
            execution_permissions: r.execution_permissions,
            error_handler_config: r.error_handler_config.and_then(|v| serde_json::from_value(v).ok()),
            max_children: r.max_children as u32,
            max_retries: r.max_retries as u32,
            spawner_node_id: r.spawner_node_id,
            join_node_id: r.join_node_id,
            lineage_depth: r.lineage_depth as u32,
            sequence_path: r.sequence_path,
            status: parse_run_node_status(&r.status),
            sequence_index: r.sequence_index,
            attempt: r.attempt as u32,
            started_at: r.started_at,
            completed_at: r.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: Uuid,
    workflow_run_id: Uuid,
    run_node_id: Uuid,
    artifact_type: String,
    content_type: String,
    content: String,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl From<ArtifactRow> for PhaseArtifact {
    fn from(r: ArtifactRow) -> Self {
        PhaseArtifact {
            id: r.id,
            workflow_run_id: r.workflow_run_id,
            run_node_id: r.run_node_id,
            artifact_type: parse_artifact_type(&r.artifact_type),
            content_type: parse_content_type(&r.content_type),
            content: r.content,
            metadata: r.metadata,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BarrierRow {
    id: Uuid,
    workflow_run_id: Uuid,
    spawner_run_node_id: Uuid,
    join_run_node_id: Uuid,
    spawn_source_artifact_id: Uuid,
    expected_children: i64,
    terminal_children: i64,
    completed_children: i64,
    failed_children: i64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
}

impl From<BarrierRow> for RunJoinBarrier {
    fn from(r: BarrierRow) -> Self {
        RunJoinBarrier {
            id: r.id,
            workflow_run_id: r.workflow_run_id,
            spawner_run_node_id: r.spawner_run_node_id,
            join_run_node_id: r.join_run_node_id,
            spawn_source_artifact_id: r.spawn_source_artifact_id,
            expected_children: r.expected_children as u32,
            terminal_children: r.terminal_children as u32,
            completed_children: r.completed_children as u32,
            failed_children: r.failed_children as u32,
            status: parse_barrier_status(&r.status),
            created_at: r.created_at,
            updated_at: r.updated_at,
            released_at: r.released_at,
        }
    }
}
