//! Pseudo-node synthesis.
//!
//! One pseudo-node per distinct `(namespace, key)` observed in reference
//! paths within the compilation scope; references share it. Fields on the
//! target step additionally get their ANSWER_LOCAL and POST pseudo-nodes
//! regardless of authored references, since answer resolution always needs
//! them.

use rustc_hash::FxHashMap;

use crate::error::CompileError;
use crate::node::{
    ExprNode, Namespace, NodeId, NodeIdGenerator, NodeKind, NodeRegistry, PathSegment, PseudoNode,
    PseudoRegistry, SourceKey,
};

/// Synthesize pseudo-nodes for `scope`. `existing` resolves sources already
/// served by a parent layer (compiled form and runtime layer, for
/// overlays); those are reused, not duplicated. Returns the newly created
/// pseudo ids.
pub fn synthesize_scope(
    nodes: &NodeRegistry,
    scope: &[NodeId],
    ids: &NodeIdGenerator,
    target_fields: &FxHashMap<String, NodeId>,
    existing: &dyn Fn(&SourceKey) -> Option<NodeId>,
    pseudo: &mut PseudoRegistry,
) -> Result<Vec<NodeId>, CompileError> {
    let mut created = Vec::new();
    let mut wanted: Vec<SourceKey> = Vec::new();

    // Sources observed in reference paths.
    for id in scope {
        let Some(node) = nodes.get(*id) else {
            continue;
        };
        if let NodeKind::Expression(ExprNode::Reference { path, base }) = &node.kind {
            if base.is_some() {
                continue;
            }
            let Some(PathSegment::Key(first)) = path.first() else {
                continue;
            };
            let Some(namespace) = Namespace::from_token(first) else {
                continue;
            };
            let key = match path.get(1) {
                Some(PathSegment::Key(key)) => key.clone(),
                Some(PathSegment::Index(index)) => index.to_string(),
                // Dynamic keys resolve their pseudo-node at request time.
                _ => continue,
            };
            push_wanted(&mut wanted, SourceKey::new(namespace, key));
        }
    }

    // Every target-step field participates in answer resolution.
    for (code, field) in target_fields {
        if scope.contains(field) {
            push_wanted(&mut wanted, SourceKey::new(Namespace::Answers, code.as_str()));
            push_wanted(&mut wanted, SourceKey::new(Namespace::Post, code.as_str()));
        }
    }

    // An answers source always pulls the field's POST source with it: the
    // local-answer waterfall consults POST.
    let answer_codes: Vec<String> = wanted
        .iter()
        .filter(|key| key.namespace == Namespace::Answers)
        .map(|key| key.key.clone())
        .collect();
    for code in answer_codes {
        if target_fields.contains_key(&code) {
            push_wanted(&mut wanted, SourceKey::new(Namespace::Post, code));
        }
    }

    for key in wanted {
        if existing(&key).is_some() || pseudo.for_source(&key).is_some() {
            continue;
        }
        let node = match key.namespace {
            Namespace::Post => PseudoNode::Post {
                field_code: key.key.clone(),
                field_node: target_fields.get(&key.key).copied(),
            },
            Namespace::Query => PseudoNode::Query {
                param: key.key.clone(),
            },
            Namespace::Params => PseudoNode::Params {
                param: key.key.clone(),
            },
            Namespace::Data => PseudoNode::Data {
                property: key.key.clone(),
            },
            Namespace::Answers => match target_fields.get(&key.key) {
                Some(field_node) => PseudoNode::AnswerLocal {
                    field_code: key.key.clone(),
                    field_node: *field_node,
                },
                None => PseudoNode::AnswerRemote {
                    field_code: key.key.clone(),
                },
            },
        };
        let id = ids.pseudo_id();
        pseudo.insert(id, node)?;
        created.push(id);
    }

    Ok(created)
}

fn push_wanted(wanted: &mut Vec<SourceKey>, key: SourceKey) {
    if !wanted.contains(&key) {
        wanted.push(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{answer, data, field, post};
    use crate::node::NodeFactory;

    fn compile_refs(defs: &[serde_json::Value]) -> (NodeRegistry, NodeIdGenerator, Vec<NodeId>) {
        let ids = NodeIdGenerator::new();
        let mut factory = NodeFactory::new(&ids);
        for (i, def) in defs.iter().enumerate() {
            factory.create_node(def, &format!("ref[{i}]"), None).unwrap();
        }
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
    fn one_pseudo_per_source() {
        let (nodes, ids, scope) = compile_refs(&[
            data("items").build(),
            data("items").path("length").build(),
            post("email").build(),
        ]);

        let mut pseudo = PseudoRegistry::new();
        let created = synthesize_scope(
            &nodes,
            &scope,
            &ids,
            &FxHashMap::default(),
            &|_| None,
            &mut pseudo,
        )
        .unwrap();

        // data.items shared, post.email separate
        assert_eq!(created.len(), 2);
        assert!(pseudo
            .for_source(&SourceKey::new(Namespace::Data, "items"))
            .is_some());
        assert!(pseudo
            .for_source(&SourceKey::new(Namespace::Post, "email"))
            .is_some());
    }

    #[test]
    fn answers_split_local_and_remote() {
        let (mut nodes, ids, mut scope) = compile_refs(&[
            answer("email").build(),
            answer("employment_status").build(),
        ]);

        // Register a target-step field block for "email".
        let mut factory = NodeFactory::new(&ids);
        let field_id = factory
            .create_node(&field("text-input", "email").build(), "block", None)
            .unwrap();
        for created in factory.into_created() {
            let id = created.node.id;
            nodes.insert(created.node, created.path).unwrap();
            scope.push(id);
        }
        let mut target_fields = FxHashMap::default();
        target_fields.insert("email".to_string(), field_id);

        let mut pseudo = PseudoRegistry::new();
        synthesize_scope(&nodes, &scope, &ids, &target_fields, &|_| None, &mut pseudo).unwrap();

        let local = pseudo
            .for_source(&SourceKey::new(Namespace::Answers, "email"))
            .unwrap();
        assert!(matches!(
            pseudo.get(local),
            Some(PseudoNode::AnswerLocal { .. })
        ));

        let remote = pseudo
            .for_source(&SourceKey::new(Namespace::Answers, "employment_status"))
            .unwrap();
        assert!(matches!(
            pseudo.get(remote),
            Some(PseudoNode::AnswerRemote { .. })
        ));

        // The local answer pulled its POST source in.
        assert!(pseudo
            .for_source(&SourceKey::new(Namespace::Post, "email"))
            .is_some());
    }

    #[test]
    fn existing_sources_are_reused() {
        let (nodes, ids, scope) = compile_refs(&[data("items").build()]);
        let parent_id = ids.pseudo_id();

        let mut pseudo = PseudoRegistry::new();
        let created = synthesize_scope(
            &nodes,
            &scope,
            &ids,
            &FxHashMap::default(),
            &|key| (key.key == "items").then_some(parent_id),
            &mut pseudo,
        )
        .unwrap();

        assert!(created.is_empty());
        assert!(pseudo.is_empty());
    }
}
