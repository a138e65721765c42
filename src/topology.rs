//! Topology loader (C3, §4.3).
//!
//! Resolves the active tree version for a `treeKey` (or a pinned version),
//! then returns its nodes/edges in deterministic order plus the set of
//! node keys with no incoming edge.

use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, EngineResult};
use crate::model::{TreeEdge, TreeNode, WorkflowTree};
use crate::store::Store;

pub struct ResolvedTopology {
    pub tree: WorkflowTree,
    pub nodes: Vec<TreeNode>,
    pub edges: Vec<TreeEdge>,
    pub initial_runnable_node_keys: Vec<String>,
}

/// Load and resolve a tree's topology (§4.3).
///
/// If `tree_version` is given, the exact `(tree_key, version)` row is loaded.
/// Otherwise the highest-versioned `published` row is selected; zero
/// candidates is `WorkflowTreeNotFound`, more than one row tied at the max
/// version is `AmbiguousWorkflowTreeVersion`.
pub async fn load_topology(
    store: &dyn Store,
    tree_key: &str,
    tree_version: Option<i64>,
) -> EngineResult<ResolvedTopology> {
    let version = match tree_version {
        Some(v) => v,
        None => {
            let mut versions = store.find_published_tree_versions(tree_key).await?;
            versions.sort_unstable();
            let max = *versions
                .last()
                .ok_or_else(|| EngineError::WorkflowTreeNotFound {
                    tree_key: tree_key.to_string(),
                    version: None,
                })?;
            let tied_at_max = versions.iter().filter(|v| **v == max).count();
            if tied_at_max > 1 {
                return Err(EngineError::AmbiguousWorkflowTreeVersion {
                    tree_key: tree_key.to_string(),
                    versions: versions.into_iter().filter(|v| *v == max).collect(),
                });
            }
            max
        }
    };

    let (tree, mut nodes, mut edges) = store.load_tree_version(tree_key, version).await.map_err(|e| {
        match e {
            crate::store::StoreError::NotFound(_) => EngineError::WorkflowTreeNotFound {
                tree_key: tree_key.to_string(),
                version: Some(version),
            },
            other => other.into(),
        }
    })?;

    nodes.sort_by(|a, b| (a.sequence_index, &a.node_key, a.id).cmp(&(b.sequence_index, &b.node_key, b.id)));

    let sequence_by_node: HashMap<_, _> = nodes.iter().map(|n| (n.id, n.sequence_index)).collect();
    for edge in &edges {
        if !sequence_by_node.contains_key(&edge.source_node_id)
            || !sequence_by_node.contains_key(&edge.target_node_id)
        {
            return Err(EngineError::IntegrityError(format!(
                "edge {} references a node outside tree {tree_key} v{version}",
                edge.id
            )));
        }
    }
    edges.sort_by(|a, b| {
        let a_key = (
            sequence_by_node[&a.source_node_id],
            a.route_on as u8,
            a.priority,
            sequence_by_node[&a.target_node_id],
            a.id,
        );
        let b_key = (
            sequence_by_node[&b.source_node_id],
            b.route_on as u8,
            b.priority,
            sequence_by_node[&b.target_node_id],
            b.id,
        );
        a_key.cmp(&b_key)
    });

    let mut has_incoming: HashSet<_> = HashSet::new();
    for edge in &edges {
        has_incoming.insert(edge.target_node_id);
    }
    let initial_runnable_node_keys = nodes
        .iter()
        .filter(|n| !has_incoming.contains(&n.id))
        .map(|n| n.node_key.clone())
        .collect();

    Ok(ResolvedTopology {
        tree,
        nodes,
        edges,
        initial_runnable_node_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::test_support::fixtures::linear_two_node_tree;

    #[tokio::test]
    async fn resolves_highest_published_version_when_unpinned() {
        let store = MemoryStore::new();
        let (tree, nodes, edges) = linear_two_node_tree(&store, "demo").await;
        let resolved = load_topology(&store, "demo", None).await.unwrap();
        assert_eq!(resolved.tree.id, tree.id);
        assert_eq!(resolved.nodes.len(), nodes.len());
        assert_eq!(resolved.edges.len(), edges.len());
        assert_eq!(resolved.initial_runnable_node_keys, vec!["design".to_string()]);
    }

    #[tokio::test]
    async fn missing_tree_key_is_not_found() {
        let store = MemoryStore::new();
        let err = load_topology(&store, "nope", None).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowTreeNotFound { .. }));
    }
}
