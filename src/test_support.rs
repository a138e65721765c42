//! Fixture helpers shared by unit and integration tests. Mirrors the
//! teacher's `test_support` role: build small, realistic seed data so
//! individual module tests don't hand-roll entity graphs.

use chrono::Utc;
use uuid::Uuid;

use crate::model::*;
use crate::store::memory::MemoryStore;

pub mod fixtures {
    use super::*;

    fn node(
        tree_id: Uuid,
        node_key: &str,
        role: NodeRole,
        sequence_index: i64,
        max_children: u32,
        max_retries: u32,
    ) -> TreeNode {
        TreeNode {
            id: Uuid::new_v4(),
            tree_id,
            node_key: node_key.to_string(),
            node_role: role,
            node_type: NodeType::Agent,
            provider: Some("scripted".into()),
            model: None,
            execution_permissions: None,
            error_handler_config: None,
            max_children,
            max_retries,
            sequence_index,
            prompt_template_id: None,
        }
    }

    fn edge(
        tree_id: Uuid,
        source_node_id: Uuid,
        target_node_id: Uuid,
        route_on: RouteOn,
        priority: i64,
        auto: bool,
        guard: Option<GuardExpression>,
    ) -> TreeEdge {
        TreeEdge {
            id: Uuid::new_v4(),
            tree_id,
            source_node_id,
            target_node_id,
            route_on,
            priority,
            auto,
            guard,
        }
    }

    /// A single-node tree: `design`, no edges. Used by S1/S2/S3/S5.
    pub async fn single_node_tree(
        store: &MemoryStore,
        tree_key: &str,
    ) -> (WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>) {
        single_node_tree_with_retries(store, tree_key, 0).await
    }

    pub async fn single_node_tree_with_retries(
        store: &MemoryStore,
        tree_key: &str,
        max_retries: u32,
    ) -> (WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>) {
        let tree = WorkflowTree {
            id: Uuid::new_v4(),
            tree_key: tree_key.to_string(),
            version: 1,
            name: tree_key.to_string(),
            description: None,
            status: TreeStatus::Published,
        };
        let design = node(tree.id, "design", NodeRole::Standard, 0, 0, max_retries);
        let nodes = vec![design];
        let edges = vec![];
        store
            .seed_tree(tree.clone(), nodes.clone(), edges.clone(), vec![])
            .await;
        (tree, nodes, edges)
    }

    /// `design -success/auto-> implement`: two nodes, one edge.
    pub async fn linear_two_node_tree(
        store: &MemoryStore,
        tree_key: &str,
    ) -> (WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>) {
        linear_two_node_tree_with_retries(store, tree_key, 0, 0).await
    }

    /// Same shape as [`linear_two_node_tree`], with configurable retry
    /// budgets on each node so a test can drive a requeue on either side of
    /// the `design -> implement` edge.
    pub async fn linear_two_node_tree_with_retries(
        store: &MemoryStore,
        tree_key: &str,
        design_max_retries: u32,
        implement_max_retries: u32,
    ) -> (WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>) {
        let tree = WorkflowTree {
            id: Uuid::new_v4(),
            tree_key: tree_key.to_string(),
            version: 1,
            name: tree_key.to_string(),
            description: None,
            status: TreeStatus::Published,
        };
        let design = node(tree.id, "design", NodeRole::Standard, 0, 0, design_max_retries);
        let implement = node(
            tree.id,
            "implement",
            NodeRole::Standard,
            1,
            0,
            implement_max_retries,
        );
        let design_to_implement = edge(
            tree.id,
            design.id,
            implement.id,
            RouteOn::Success,
            0,
            true,
            None,
        );
        let nodes = vec![design, implement];
        let edges = vec![design_to_implement];
        store
            .seed_tree(tree.clone(), nodes.clone(), edges.clone(), vec![])
            .await;
        (tree, nodes, edges)
    }

    /// `implement` with two outgoing success edges: a guarded revisit back to
    /// `design` (priority 0) and an auto edge to `review` (priority 1). Plus
    /// `design -auto-> implement` so the run can reach `implement` at all.
    /// Mirrors spec §8 scenario S4.
    pub async fn routing_decision_tree(
        store: &MemoryStore,
        tree_key: &str,
    ) -> (WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>) {
        let tree = WorkflowTree {
            id: Uuid::new_v4(),
            tree_key: tree_key.to_string(),
            version: 1,
            name: tree_key.to_string(),
            description: None,
            status: TreeStatus::Published,
        };
        let design = node(tree.id, "design", NodeRole::Standard, 0, 0, 0);
        let implement = node(tree.id, "implement", NodeRole::Standard, 1, 0, 0);
        let review = node(tree.id, "review", NodeRole::Standard, 2, 0, 0);
        let design_to_implement = edge(
            tree.id,
            design.id,
            implement.id,
            RouteOn::Success,
            0,
            true,
            None,
        );
        let to_design = edge(
            tree.id,
            implement.id,
            design.id,
            RouteOn::Success,
            0,
            false,
            Some(GuardExpression::Leaf {
                field: "decision".into(),
                op: GuardOp::Eq,
                value: serde_json::json!("changes_requested"),
            }),
        );
        let to_review = edge(tree.id, implement.id, review.id, RouteOn::Success, 1, true, None);
        let nodes = vec![design, implement, review];
        let edges = vec![design_to_implement, to_design, to_review];
        store
            .seed_tree(tree.clone(), nodes.clone(), edges.clone(), vec![])
            .await;
        (tree, nodes, edges)
    }

    /// `spawner` (role=Spawner, maxChildren=4) with one success/auto edge to
    /// `join` (role=Join). Mirrors spec §8 scenario S6.
    pub async fn spawner_join_tree(
        store: &MemoryStore,
        tree_key: &str,
    ) -> (WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>) {
        let tree = WorkflowTree {
            id: Uuid::new_v4(),
            tree_key: tree_key.to_string(),
            version: 1,
            name: tree_key.to_string(),
            description: None,
            status: TreeStatus::Published,
        };
        let spawner = node(tree.id, "spawner", NodeRole::Spawner, 0, 4, 0);
        let join = node(tree.id, "join", NodeRole::Join, 1, 0, 0);
        let to_join = edge(tree.id, spawner.id, join.id, RouteOn::Success, 0, true, None);
        let nodes = vec![spawner, join];
        let edges = vec![to_join];
        store
            .seed_tree(tree.clone(), nodes.clone(), edges.clone(), vec![])
            .await;
        (tree, nodes, edges)
    }

    /// A single templated node: `design` resolves `prompt_template_id` to a
    /// template that substitutes `{{ node_key }}`/`{{ tree_name }}`.
    pub async fn single_templated_node_tree(
        store: &MemoryStore,
        tree_key: &str,
    ) -> (WorkflowTree, Vec<TreeNode>, Vec<TreeEdge>) {
        let tree = WorkflowTree {
            id: Uuid::new_v4(),
            tree_key: tree_key.to_string(),
            version: 1,
            name: tree_key.to_string(),
            description: None,
            status: TreeStatus::Published,
        };
        let template = PromptTemplate {
            id: Uuid::new_v4(),
            template_key: "design-template".into(),
            version: 1,
            content: "Work on {{ node_key }} for tree {{ tree_name }}.".into(),
            content_type: ContentType::Text,
        };
        let mut design = node(tree.id, "design", NodeRole::Standard, 0, 0, 0);
        design.prompt_template_id = Some(template.id);
        let nodes = vec![design];
        let edges = vec![];
        store
            .seed_tree(tree.clone(), nodes.clone(), edges.clone(), vec![template])
            .await;
        (tree, nodes, edges)
    }

    pub fn now() -> chrono::DateTime<Utc> {
        Utc::now()
    }
}
