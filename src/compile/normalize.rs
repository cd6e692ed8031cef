//! Normalization passes.
//!
//! Idempotent in-place passes run in fixed order before any handler is
//! compiled:
//!
//! 1. attach the owning field code to validations and qualify `@self`
//!    subjects inside them,
//! 2. lift field formatter lists into a derived format pipeline
//!    (`Pipeline(input = post.<code>, steps = formatters)`),
//! 3. rewrite any remaining `@self` path tokens under a field to its code.
//!
//! Normalizers use the shared id generator and never observe evaluation
//! state, so the ids they mint are deterministic.

use serde_json::json;

use crate::compile::collect_subtree;
use crate::error::CompileError;
use crate::node::factory::CreatedNode;
use crate::node::{
    ExprNode, NodeFactory, NodeId, NodeIdGenerator, NodeKind, NodeRegistry, PathSegment,
};

/// Run all passes over `scope` (a set of registered node ids). Nodes the
/// passes synthesize are returned for the caller to register and wire.
pub fn normalize_scope(
    nodes: &mut NodeRegistry,
    ids: &NodeIdGenerator,
    scope: &[NodeId],
) -> Result<Vec<CreatedNode>, CompileError> {
    attach_validation_codes(nodes, scope);
    let created = formatters_to_pipeline(nodes, ids, scope)?;
    resolve_self_references(nodes, scope);
    Ok(created)
}

/// Field blocks in `scope`, paired with their codes.
fn field_blocks(nodes: &NodeRegistry, scope: &[NodeId]) -> Vec<(NodeId, String)> {
    scope
        .iter()
        .filter_map(|id| {
            let node = nodes.get(*id)?;
            match &node.kind {
                NodeKind::Block(block) => block.code.clone().map(|code| (*id, code)),
                _ => None,
            }
        })
        .collect()
}

/// Pass 1: every validation under a field block learns the field's code,
/// and `@self` subjects inside validations are qualified to it.
fn attach_validation_codes(nodes: &mut NodeRegistry, scope: &[NodeId]) {
    for (block_id, code) in field_blocks(nodes, scope) {
        let validations = match &nodes.get(block_id).expect("block in scope").kind {
            NodeKind::Block(block) => block.validate.clone(),
            _ => unreachable!("field_blocks only yields blocks"),
        };
        for validation in validations {
            if let Some(node) = nodes.get_mut(validation) {
                if let NodeKind::Expression(ExprNode::Validation { block_code, .. }) =
                    &mut node.kind
                {
                    *block_code = Some(code.clone());
                }
            }
            for id in collect_subtree(nodes, validation) {
                rewrite_self(nodes, id, &code);
            }
        }
    }
}

/// Pass 2: derive `formatPipeline` from a field's formatter list. The
/// `formatters` property itself stays untouched - it is applied verbatim at
/// submission, the pipeline only serves answer resolution.
fn formatters_to_pipeline(
    nodes: &mut NodeRegistry,
    ids: &NodeIdGenerator,
    scope: &[NodeId],
) -> Result<Vec<CreatedNode>, CompileError> {
    let mut created = Vec::new();
    for (block_id, code) in field_blocks(nodes, scope) {
        let needs_pipeline = match &nodes.get(block_id).expect("block in scope").kind {
            NodeKind::Block(block) => {
                !block.formatters.is_empty() && block.format_pipeline.is_none()
            }
            _ => unreachable!("field_blocks only yields blocks"),
        };
        if !needs_pipeline {
            continue;
        }

        let (formatters, block_path) = match &nodes.get(block_id).expect("block in scope").kind {
            NodeKind::Block(block) => (
                block.formatters.clone(),
                nodes.path(block_id).unwrap_or("block").to_string(),
            ),
            _ => unreachable!(),
        };

        let definition = json!({
            "expressionType": "pipeline",
            "input": {"expressionType": "reference", "path": ["post", code]},
            "steps": formatters,
        });

        let mut factory = NodeFactory::new(ids);
        let pipeline_id = factory.create_node(
            &definition,
            &format!("{block_path}.formatPipeline"),
            Some(block_id),
        )?;
        created.extend(factory.into_created());

        if let Some(node) = nodes.get_mut(block_id) {
            if let NodeKind::Block(block) = &mut node.kind {
                block.format_pipeline = Some(pipeline_id);
            }
        }
    }
    Ok(created)
}

/// Pass 3: sweep everything under each field block for leftover `@self`
/// tokens (default values, display properties, dependents).
fn resolve_self_references(nodes: &mut NodeRegistry, scope: &[NodeId]) {
    for (block_id, code) in field_blocks(nodes, scope) {
        for id in collect_subtree(nodes, block_id) {
            rewrite_self(nodes, id, &code);
        }
    }
}

/// Replace `@self` path tokens in a reference node with the field code.
fn rewrite_self(nodes: &mut NodeRegistry, id: NodeId, code: &str) {
    let Some(node) = nodes.get_mut(id) else {
        return;
    };
    if let NodeKind::Expression(ExprNode::Reference { path, .. }) = &mut node.kind {
        for segment in path.iter_mut() {
            if matches!(segment, PathSegment::Key(key) if key == "@self") {
                *segment = PathSegment::Key(code.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{condition, field, validation, self_value};
    use crate::node::NodeFactory;
    use serde_json::json;

    fn register_tree(def: &serde_json::Value) -> (NodeRegistry, NodeIdGenerator, Vec<NodeId>) {
        let ids = NodeIdGenerator::new();
        let mut factory = NodeFactory::new(&ids);
        factory.create_node(def, "block", None).unwrap();

        let mut nodes = NodeRegistry::new();
        let mut scope = Vec::new();
        for created in factory.into_created() {
            let id = created.node.id;
            nodes.insert(created.node, created.path).unwrap();
            scope.push(id);
        }
        (nodes, ids, scope)
    }

    #[test]
    fn validation_learns_its_block_code() {
        let def = field("text-input", "email")
            .validate(validation(
                self_value().not_matches(condition("isValidEmail", vec![])),
                "Enter a valid email address",
            ))
            .build();
        let (mut nodes, ids, scope) = register_tree(&def);

        normalize_scope(&mut nodes, &ids, &scope).unwrap();

        let validation_node = scope
            .iter()
            .find_map(|id| match &nodes.get(*id)?.kind {
                NodeKind::Expression(ExprNode::Validation { block_code, .. }) => {
                    Some(block_code.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(validation_node.as_deref(), Some("email"));
    }

    #[test]
    fn self_tokens_resolve_to_field_code() {
        let def = field("text-input", "email")
            .validate(validation(
                self_value().not_matches(condition("isValidEmail", vec![])),
                "Enter a valid email address",
            ))
            .build();
        let (mut nodes, ids, scope) = register_tree(&def);

        normalize_scope(&mut nodes, &ids, &scope).unwrap();

        let has_self = scope.iter().any(|id| match &nodes.get(*id).unwrap().kind {
            NodeKind::Expression(ExprNode::Reference { path, .. }) => path
                .iter()
                .any(|s| matches!(s, PathSegment::Key(k) if k == "@self")),
            _ => false,
        });
        assert!(!has_self);

        let qualified = scope.iter().any(|id| match &nodes.get(*id).unwrap().kind {
            NodeKind::Expression(ExprNode::Reference { path, .. }) => path
                .iter()
                .any(|s| matches!(s, PathSegment::Key(k) if k == "email")),
            _ => false,
        });
        assert!(qualified);
    }

    #[test]
    fn formatters_lift_into_a_pipeline() {
        let def = field("text-input", "name")
            .formatter(json!({"expressionType": "transformer", "name": "trim", "arguments": []}))
            .formatter(json!({"expressionType": "transformer", "name": "toTitleCase", "arguments": []}))
            .build();
        let (mut nodes, ids, scope) = register_tree(&def);

        let created = normalize_scope(&mut nodes, &ids, &scope).unwrap();
        // pipeline + post reference + two transformer steps
        assert_eq!(created.len(), 4);

        let block_id = scope[0];
        let (pipeline, formatters_len) = match &nodes.get(block_id).unwrap().kind {
            NodeKind::Block(block) => (block.format_pipeline, block.formatters.len()),
            _ => panic!("expected block"),
        };
        assert!(pipeline.is_some());
        // formatters stay untouched for submission-time use
        assert_eq!(formatters_len, 2);
    }

    #[test]
    fn normalization_is_idempotent() {
        let def = field("text-input", "name")
            .formatter(json!({"expressionType": "transformer", "name": "trim", "arguments": []}))
            .build();
        let (mut nodes, ids, mut scope) = register_tree(&def);

        let created = normalize_scope(&mut nodes, &ids, &scope).unwrap();
        for node in created {
            let id = node.node.id;
            nodes.insert(node.node, node.path).unwrap();
            scope.push(id);
        }

        let again = normalize_scope(&mut nodes, &ids, &scope).unwrap();
        assert!(again.is_empty());
    }
}
