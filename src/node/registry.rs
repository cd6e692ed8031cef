//! Arena registries for AST nodes, pseudo-nodes, and node metadata.
//!
//! Registration is append-only; a duplicate id is a hard compile error.

use rustc_hash::FxHashMap;

use crate::error::CompileError;
use crate::node::{AstNode, NodeId, PseudoNode, SourceKey};

// ============================================================================
// AST NODE REGISTRY
// ============================================================================

/// Arena of typed AST nodes plus their structural paths.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: FxHashMap<NodeId, AstNode>,
    paths: FxHashMap<NodeId, String>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node with its structural path. Duplicate ids are rejected.
    pub fn insert(&mut self, node: AstNode, path: impl Into<String>) -> Result<(), CompileError> {
        let id = node.id;
        if self.nodes.contains_key(&id) {
            return Err(CompileError::DuplicateId { id });
        }
        self.nodes.insert(id, node);
        self.paths.insert(id, path.into());
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&AstNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut AstNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Structural path of a node (e.g. `journey.steps[0].blocks[2]`).
    pub fn path(&self, id: NodeId) -> Option<&str> {
        self.paths.get(&id).map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AstNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drain all nodes, preserving paths, for overlay merges.
    pub fn drain(&mut self) -> Vec<(AstNode, String)> {
        let paths = std::mem::take(&mut self.paths);
        std::mem::take(&mut self.nodes)
            .into_values()
            .map(|node| {
                let path = paths.get(&node.id).cloned().unwrap_or_default();
                (node, path)
            })
            .collect()
    }
}

// ============================================================================
// PSEUDO-NODE REGISTRY
// ============================================================================

/// Pseudo-node arena with a `(namespace, key)` index: one pseudo-node per
/// distinct source per compilation scope.
#[derive(Debug, Default)]
pub struct PseudoRegistry {
    nodes: FxHashMap<NodeId, PseudoNode>,
    by_source: FxHashMap<SourceKey, NodeId>,
}

impl PseudoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: NodeId, pseudo: PseudoNode) -> Result<(), CompileError> {
        if self.nodes.contains_key(&id) {
            return Err(CompileError::DuplicateId { id });
        }
        let key = pseudo.source_key();
        if self.by_source.contains_key(&key) {
            return Err(CompileError::schema(format!(
                "pseudo-node for {}.{} registered twice",
                key.namespace.tag(),
                key.key
            )));
        }
        self.by_source.insert(key, id);
        self.nodes.insert(id, pseudo);
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&PseudoNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Resolve the pseudo-node serving `(namespace, key)`, if synthesized.
    pub fn for_source(&self, key: &SourceKey) -> Option<NodeId> {
        self.by_source.get(key).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &PseudoNode)> {
        self.nodes.iter().map(|(id, node)| (*id, node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(NodeId, PseudoNode)> {
        self.by_source.clear();
        std::mem::take(&mut self.nodes).into_iter().collect()
    }
}

// ============================================================================
// METADATA REGISTRY
// ============================================================================

/// Per-node structural metadata computed relative to the target step.
#[derive(Debug, Clone, Default)]
pub struct NodeMeta {
    pub parent: Option<NodeId>,
    /// The step this node lives under, if any.
    pub owning_step: Option<NodeId>,
    /// True for the journey chain above the target step.
    pub ancestor_of_target: bool,
    /// True for the target step itself and everything under it.
    pub on_target_step: bool,
}

#[derive(Debug, Default)]
pub struct MetadataRegistry {
    meta: FxHashMap<NodeId, NodeMeta>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&mut self, id: NodeId) -> &mut NodeMeta {
        self.meta.entry(id).or_default()
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeMeta> {
        self.meta.get(&id)
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.meta.get(&id).and_then(|m| m.parent)
    }

    pub fn owning_step(&self, id: NodeId) -> Option<NodeId> {
        self.meta.get(&id).and_then(|m| m.owning_step)
    }

    pub fn on_target_step(&self, id: NodeId) -> bool {
        self.meta.get(&id).map(|m| m.on_target_step).unwrap_or(false)
    }

    pub fn drain(&mut self) -> Vec<(NodeId, NodeMeta)> {
        std::mem::take(&mut self.meta).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{AstNode, NodeIdGenerator, NodeKind, Namespace, PredicateNode};
    use serde_json::json;

    fn dummy_node(id: NodeId) -> AstNode {
        AstNode {
            id,
            kind: NodeKind::Predicate(PredicateNode::And { operands: vec![] }),
            raw: json!({}),
        }
    }

    #[test]
    fn duplicate_ast_id_is_rejected() {
        let ids = NodeIdGenerator::new();
        let id = ids.ast_id();

        let mut registry = NodeRegistry::new();
        registry.insert(dummy_node(id), "root").unwrap();

        let err = registry.insert(dummy_node(id), "root").unwrap_err();
        assert!(matches!(err, CompileError::DuplicateId { .. }));
    }

    #[test]
    fn paths_are_recorded() {
        let ids = NodeIdGenerator::new();
        let id = ids.ast_id();

        let mut registry = NodeRegistry::new();
        registry
            .insert(dummy_node(id), "journey.steps[0].blocks[1]")
            .unwrap();

        assert_eq!(registry.path(id), Some("journey.steps[0].blocks[1]"));
    }

    #[test]
    fn one_pseudo_per_source_key() {
        let ids = NodeIdGenerator::new();
        let mut registry = PseudoRegistry::new();

        registry
            .insert(ids.pseudo_id(), PseudoNode::Query { param: "page".into() })
            .unwrap();

        let err = registry
            .insert(ids.pseudo_id(), PseudoNode::Query { param: "page".into() })
            .unwrap_err();
        assert!(err.to_string().contains("registered twice"));

        let key = SourceKey::new(Namespace::Query, "page");
        assert!(registry.for_source(&key).is_some());
    }
}
