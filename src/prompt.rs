//! Prompt template rendering (§4.4, §4.6).
//!
//! A [`TreeNode`] may reference a [`PromptTemplate`] instead of carrying a
//! literal prompt string. Grounded on the pack's `prompt_lab::render`
//! (`minijinja::Environment` + `context!`) sibling to the teacher crate: the
//! same templating engine, applied here at run-materialization time instead
//! of at prompt-authoring time, with a node/tree context instead of a
//! file-read goal/history/tree-summary context.

use minijinja::{context, Environment};

use crate::error::{EngineError, EngineResult};
use crate::model::{PromptTemplate, TreeNode, WorkflowTree};

/// Render `template.content` as a minijinja template against the node and
/// tree it was resolved for. A template with no `{{ }}`/`{% %}` syntax
/// renders to itself unchanged, so this is safe to call for templates that
/// are really just static text.
pub fn render_prompt_template(template: &PromptTemplate, tree: &WorkflowTree, node: &TreeNode) -> EngineResult<String> {
    let mut env = Environment::new();
    env.add_template("prompt", &template.content)
        .map_err(|e| EngineError::IntegrityError(format!("prompt template {}: {e}", template.id)))?;
    let rendered = env
        .get_template("prompt")
        .and_then(|t| {
            t.render(context! {
                tree_key => &tree.tree_key,
                tree_name => &tree.name,
                node_key => &node.node_key,
                node_role => format!("{:?}", node.node_role),
            })
        })
        .map_err(|e| EngineError::IntegrityError(format!("prompt template {}: {e}", template.id)))?;
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeRole, NodeType, TreeStatus};
    use uuid::Uuid;

    fn tree() -> WorkflowTree {
        WorkflowTree {
            id: Uuid::new_v4(),
            tree_key: "demo".into(),
            version: 1,
            name: "Demo".into(),
            description: None,
            status: TreeStatus::Published,
        }
    }

    fn node(tree_id: Uuid) -> TreeNode {
        TreeNode {
            id: Uuid::new_v4(),
            tree_id,
            node_key: "design".into(),
            node_role: NodeRole::Standard,
            node_type: NodeType::Agent,
            provider: None,
            model: None,
            execution_permissions: None,
            error_handler_config: None,
            max_children: 0,
            max_retries: 0,
            sequence_index: 0,
            prompt_template_id: None,
        }
    }

    #[test]
    fn substitutes_node_and_tree_variables() {
        let tree = tree();
        let template = PromptTemplate {
            id: Uuid::new_v4(),
            template_key: "design".into(),
            version: 1,
            content: "Work on {{ node_key }} for tree {{ tree_name }}.".into(),
            content_type: crate::model::ContentType::Text,
        };
        let rendered = render_prompt_template(&template, &tree, &node(tree.id)).unwrap();
        assert_eq!(rendered, "Work on design for tree Demo.");
    }

    #[test]
    fn static_content_with_no_template_syntax_is_unchanged() {
        let tree = tree();
        let template = PromptTemplate {
            id: Uuid::new_v4(),
            template_key: "design".into(),
            version: 1,
            content: "Plain instructions, no variables.".into(),
            content_type: crate::model::ContentType::Text,
        };
        let rendered = render_prompt_template(&template, &tree, &node(tree.id)).unwrap();
        assert_eq!(rendered, "Plain instructions, no variables.");
    }

    #[test]
    fn malformed_template_syntax_is_an_integrity_error() {
        let tree = tree();
        let template = PromptTemplate {
            id: Uuid::new_v4(),
            template_key: "design".into(),
            version: 1,
            content: "{{ unterminated".into(),
            content_type: crate::model::ContentType::Text,
        };
        let err = render_prompt_template(&template, &tree, &node(tree.id)).unwrap_err();
        assert!(matches!(err, EngineError::IntegrityError(_)));
    }
}
