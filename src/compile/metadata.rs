//! Metadata traversal: marking nodes relative to the target step.
//!
//! Parent links are recorded at registration; this pass adds the owning
//! step and the ancestor/descendant flags handlers use to decide how much
//! of a node to evaluate.

use crate::compile::collect_subtree;
use crate::node::registry::MetadataRegistry;
use crate::node::{NodeId, NodeKind, NodeRegistry};

pub fn apply_metadata(
    nodes: &NodeRegistry,
    metadata: &mut MetadataRegistry,
    journey: NodeId,
    target_step: NodeId,
) {
    let steps = match nodes.get(journey).map(|n| &n.kind) {
        Some(NodeKind::Journey(j)) => j.steps.clone(),
        _ => Vec::new(),
    };

    for step in steps {
        for id in collect_subtree(nodes, step) {
            metadata.entry(id).owning_step = Some(step);
        }
    }

    // The journey chain above the target step.
    metadata.entry(journey).ancestor_of_target = true;

    for id in collect_subtree(nodes, target_step) {
        metadata.entry(id).on_target_step = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{field, journey, step};
    use crate::node::{NodeFactory, NodeIdGenerator};

    #[test]
    fn flags_follow_the_target_step() {
        let ids = NodeIdGenerator::new();
        let mut factory = NodeFactory::new(&ids);
        let def = journey("/j")
            .step(step("/a").block(field("text-input", "name")))
            .step(step("/b").block(field("text-input", "email")))
            .build();
        let journey_id = factory.create_journey(&def).unwrap();

        let mut nodes = NodeRegistry::new();
        let mut metadata = MetadataRegistry::new();
        let mut parents = Vec::new();
        for created in factory.into_created() {
            let id = created.node.id;
            parents.push((id, created.parent));
            nodes.insert(created.node, created.path).unwrap();
        }
        for (id, parent) in parents {
            metadata.entry(id).parent = parent;
        }

        let (step_a, step_b) = match &nodes.get(journey_id).unwrap().kind {
            NodeKind::Journey(j) => (j.steps[0], j.steps[1]),
            _ => panic!("expected journey"),
        };

        apply_metadata(&nodes, &mut metadata, journey_id, step_a);

        assert!(metadata.on_target_step(step_a));
        assert!(!metadata.on_target_step(step_b));
        assert!(metadata.get(journey_id).unwrap().ancestor_of_target);
        assert_eq!(metadata.owning_step(step_a), Some(step_a));

        let block_a = match &nodes.get(step_a).unwrap().kind {
            NodeKind::Step(s) => s.blocks[0],
            _ => panic!("expected step"),
        };
        assert!(metadata.on_target_step(block_a));
        assert_eq!(metadata.owning_step(block_a), Some(step_a));
    }
}
