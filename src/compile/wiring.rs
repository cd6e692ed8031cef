//! The wiring catalogue: typed edges per node kind.
//!
//! Wiring is purely structural - it declares who must be evaluated before
//! whom, independent of whether an edge is taken at run time. `wire_nodes`
//! is the scoped mode shared by the full build (scope = every node) and
//! runtime overlays (scope = the staged subtree).

use crate::compile::graph::{DependencyGraph, EdgeKind, EdgeMeta};
use crate::error::CompileError;
use crate::node::{
    ExprNode, Namespace, NodeId, NodeKind, NodeRegistry, OutcomeNode, PathSegment, PredicateNode,
    PropValue, PseudoNode, PseudoRegistry, SourceKey,
};

fn prop_edges(
    graph: &mut DependencyGraph,
    prop: &PropValue,
    consumer: NodeId,
    kind: EdgeKind,
    meta: &EdgeMeta,
) {
    for producer in prop.node_ids() {
        graph.add_edge(producer, consumer, kind, meta.clone());
    }
}

fn opt_prop_edges(
    graph: &mut DependencyGraph,
    prop: &Option<PropValue>,
    consumer: NodeId,
    kind: EdgeKind,
    meta: &EdgeMeta,
) {
    if let Some(prop) = prop {
        prop_edges(graph, prop, consumer, kind, meta);
    }
}

fn indexed_edges(
    graph: &mut DependencyGraph,
    producers: &[NodeId],
    consumer: NodeId,
    kind: EdgeKind,
    property: &str,
) {
    for (index, producer) in producers.iter().enumerate() {
        graph.add_edge(*producer, consumer, kind, EdgeMeta::indexed(property, index));
    }
}

fn indexed_prop_edges(
    graph: &mut DependencyGraph,
    props: &[PropValue],
    consumer: NodeId,
    kind: EdgeKind,
    property: &str,
) {
    for (index, prop) in props.iter().enumerate() {
        prop_edges(
            graph,
            prop,
            consumer,
            kind,
            &EdgeMeta::indexed(property, index),
        );
    }
}

/// Wire a set of registered nodes into the graph. `pseudo_lookup` resolves
/// `(namespace, key)` sources across layers; `load_transitions` become the
/// producers of newly synthesized DATA pseudo-nodes.
pub fn wire_nodes(
    nodes: &NodeRegistry,
    pseudo: &PseudoRegistry,
    scope: &[NodeId],
    new_pseudos: &[NodeId],
    pseudo_lookup: &dyn Fn(&SourceKey) -> Option<NodeId>,
    load_transitions: &[NodeId],
    graph: &mut DependencyGraph,
) -> Result<(), CompileError> {
    for id in scope {
        let Some(node) = nodes.get(*id) else {
            continue;
        };
        let id = *id;
        graph.add_node(id);

        // Structural edges run parent → child along structural positions.
        for child in node.child_ids() {
            graph.add_edge(id, child, EdgeKind::Structural, EdgeMeta::default());
        }

        match &node.kind {
            NodeKind::Journey(journey) => {
                for prop in journey.properties.values() {
                    prop_edges(graph, prop, id, EdgeKind::DataFlow, &EdgeMeta::default());
                }
            }
            NodeKind::Step(step) => {
                indexed_edges(graph, &step.blocks, id, EdgeKind::DataFlow, "blocks");
                for prop in step.properties.values() {
                    prop_edges(graph, prop, id, EdgeKind::DataFlow, &EdgeMeta::default());
                }
            }
            NodeKind::Block(block) => {
                opt_prop_edges(
                    graph,
                    &block.dependent,
                    id,
                    EdgeKind::ControlFlow,
                    &EdgeMeta::property("dependent"),
                );
                indexed_edges(graph, &block.validate, id, EdgeKind::DataFlow, "validate");
                indexed_edges(graph, &block.blocks, id, EdgeKind::DataFlow, "blocks");
                opt_prop_edges(
                    graph,
                    &block.default_value,
                    id,
                    EdgeKind::DataFlow,
                    &EdgeMeta::property("defaultValue"),
                );
                if let Some(pipeline) = block.format_pipeline {
                    graph.add_edge(
                        pipeline,
                        id,
                        EdgeKind::DataFlow,
                        EdgeMeta::property("formatPipeline"),
                    );
                }
                for prop in block.properties.values() {
                    prop_edges(graph, prop, id, EdgeKind::DataFlow, &EdgeMeta::default());
                }
            }
            NodeKind::Expression(expr) => {
                wire_expression(graph, id, expr, pseudo_lookup);
            }
            NodeKind::Predicate(predicate) => match predicate {
                PredicateNode::Test {
                    subject, condition, ..
                } => {
                    prop_edges(
                        graph,
                        subject,
                        id,
                        EdgeKind::DataFlow,
                        &EdgeMeta::property("subject"),
                    );
                    graph.add_edge(
                        *condition,
                        id,
                        EdgeKind::DataFlow,
                        EdgeMeta::property("condition"),
                    );
                }
                PredicateNode::And { operands }
                | PredicateNode::Or { operands }
                | PredicateNode::Xor { operands } => {
                    indexed_prop_edges(graph, operands, id, EdgeKind::DataFlow, "operands");
                }
                PredicateNode::Not { operand } => {
                    prop_edges(
                        graph,
                        operand,
                        id,
                        EdgeKind::DataFlow,
                        &EdgeMeta::property("operand"),
                    );
                }
            },
            NodeKind::Transition(transition) => {
                use crate::node::TransitionNode::*;
                match transition {
                    Load { effects } => {
                        indexed_edges(graph, effects, id, EdgeKind::EffectFlow, "effects");
                    }
                    Access {
                        guards,
                        effects,
                        next,
                    } => {
                        opt_prop_edges(
                            graph,
                            guards,
                            id,
                            EdgeKind::ControlFlow,
                            &EdgeMeta::property("guards"),
                        );
                        indexed_edges(graph, effects, id, EdgeKind::EffectFlow, "effects");
                        indexed_edges(graph, next, id, EdgeKind::DataFlow, "next");
                    }
                    Action { when, effects } => {
                        prop_edges(
                            graph,
                            when,
                            id,
                            EdgeKind::ControlFlow,
                            &EdgeMeta::property("when"),
                        );
                        indexed_edges(graph, effects, id, EdgeKind::EffectFlow, "effects");
                    }
                    Submit {
                        when,
                        guards,
                        on_valid,
                        on_invalid,
                        on_always,
                        ..
                    } => {
                        opt_prop_edges(
                            graph,
                            when,
                            id,
                            EdgeKind::ControlFlow,
                            &EdgeMeta::property("when"),
                        );
                        opt_prop_edges(
                            graph,
                            guards,
                            id,
                            EdgeKind::ControlFlow,
                            &EdgeMeta::property("guards"),
                        );
                        for (name, branch) in [
                            ("onValid", on_valid),
                            ("onInvalid", on_invalid),
                            ("onAlways", on_always),
                        ] {
                            indexed_edges(graph, &branch.effects, id, EdgeKind::EffectFlow, name);
                            indexed_edges(graph, &branch.next, id, EdgeKind::DataFlow, name);
                        }
                    }
                }
            }
            NodeKind::Outcome(outcome) => match outcome {
                OutcomeNode::Redirect { when, goto } => {
                    opt_prop_edges(
                        graph,
                        when,
                        id,
                        EdgeKind::ControlFlow,
                        &EdgeMeta::property("when"),
                    );
                    prop_edges(
                        graph,
                        goto,
                        id,
                        EdgeKind::DataFlow,
                        &EdgeMeta::property("goto"),
                    );
                }
                OutcomeNode::ThrowError { when, message, .. } => {
                    opt_prop_edges(
                        graph,
                        when,
                        id,
                        EdgeKind::ControlFlow,
                        &EdgeMeta::property("when"),
                    );
                    prop_edges(
                        graph,
                        message,
                        id,
                        EdgeKind::DataFlow,
                        &EdgeMeta::property("message"),
                    );
                }
            },
        }
    }

    // Pseudo producers.
    for id in new_pseudos {
        let Some(node) = pseudo.get(*id) else {
            continue;
        };
        graph.add_node(*id);
        match node {
            // Values loaded by onLoad produce the DATA sources.
            PseudoNode::Data { .. } => {
                for load in load_transitions {
                    graph.add_edge(*load, *id, EdgeKind::EffectFlow, EdgeMeta::reference("data"));
                }
            }
            // The local-answer waterfall consumes the field's POST source
            // and its derived format pipeline.
            PseudoNode::AnswerLocal {
                field_code,
                field_node,
            } => {
                if let Some(post) =
                    pseudo_lookup(&SourceKey::new(Namespace::Post, field_code.as_str()))
                {
                    graph.add_edge(post, *id, EdgeKind::DataFlow, EdgeMeta::reference("post"));
                }
                if let Some(NodeKind::Block(block)) = nodes.get(*field_node).map(|n| &n.kind) {
                    if let Some(pipeline) = block.format_pipeline {
                        graph.add_edge(
                            pipeline,
                            *id,
                            EdgeKind::DataFlow,
                            EdgeMeta::property("formatPipeline"),
                        );
                    }
                    if let Some(default) = &block.default_value {
                        prop_edges(
                            graph,
                            default,
                            *id,
                            EdgeKind::DataFlow,
                            &EdgeMeta::property("defaultValue"),
                        );
                    }
                }
            }
            // Raw inputs have no producers.
            PseudoNode::Post { .. }
            | PseudoNode::Query { .. }
            | PseudoNode::Params { .. }
            | PseudoNode::AnswerRemote { .. } => {}
        }
    }

    Ok(())
}

/// Expression-specific edges, including the pseudo → reference consumer
/// edges.
fn wire_expression(
    graph: &mut DependencyGraph,
    id: NodeId,
    expr: &ExprNode,
    pseudo_lookup: &dyn Fn(&SourceKey) -> Option<NodeId>,
) {
    match expr {
        ExprNode::Reference { path, base } => {
            for segment in path {
                if let PathSegment::Node(dynamic) = segment {
                    graph.add_edge(
                        *dynamic,
                        id,
                        EdgeKind::DataFlow,
                        EdgeMeta::property("path"),
                    );
                }
            }
            if let Some(base) = base {
                graph.add_edge(*base, id, EdgeKind::DataFlow, EdgeMeta::property("base"));
            }
            if let Some(key) = static_source(path) {
                if let Some(pseudo) = pseudo_lookup(&key) {
                    graph.add_edge(
                        pseudo,
                        id,
                        EdgeKind::DataFlow,
                        EdgeMeta::reference(key.namespace.tag()),
                    );
                }
            }
        }
        ExprNode::Pipeline { input, steps } => {
            prop_edges(
                graph,
                input,
                id,
                EdgeKind::DataFlow,
                &EdgeMeta::property("input"),
            );
            indexed_edges(graph, steps, id, EdgeKind::DataFlow, "steps");
        }
        ExprNode::Format { arguments, .. } => {
            indexed_prop_edges(graph, arguments, id, EdgeKind::DataFlow, "arguments");
        }
        ExprNode::Iterate { input, .. } => {
            // The iterator template is not wired statically; the overlay
            // compiles and wires it per item.
            prop_edges(
                graph,
                input,
                id,
                EdgeKind::DataFlow,
                &EdgeMeta::property("input"),
            );
        }
        ExprNode::Conditional {
            predicate,
            then_value,
            else_value,
        } => {
            prop_edges(
                graph,
                predicate,
                id,
                EdgeKind::ControlFlow,
                &EdgeMeta::property("predicate"),
            );
            prop_edges(
                graph,
                then_value,
                id,
                EdgeKind::DataFlow,
                &EdgeMeta::property("thenValue"),
            );
            prop_edges(
                graph,
                else_value,
                id,
                EdgeKind::DataFlow,
                &EdgeMeta::property("elseValue"),
            );
        }
        ExprNode::Next { when, goto } => {
            if let Some(when) = when {
                graph.add_edge(*when, id, EdgeKind::ControlFlow, EdgeMeta::property("when"));
            }
            prop_edges(
                graph,
                goto,
                id,
                EdgeKind::DataFlow,
                &EdgeMeta::property("goto"),
            );
        }
        ExprNode::Validation { when, message, .. } => {
            graph.add_edge(*when, id, EdgeKind::ControlFlow, EdgeMeta::property("when"));
            prop_edges(
                graph,
                message,
                id,
                EdgeKind::DataFlow,
                &EdgeMeta::property("message"),
            );
        }
        ExprNode::Function { arguments, .. } => {
            indexed_prop_edges(graph, arguments, id, EdgeKind::DataFlow, "arguments");
        }
    }
}

/// Static `(namespace, key)` of a reference path, when both positions are
/// literal.
pub(crate) fn static_source(path: &[PathSegment]) -> Option<SourceKey> {
    let PathSegment::Key(first) = path.first()? else {
        return None;
    };
    let namespace = Namespace::from_token(first)?;
    let key = match path.get(1)? {
        PathSegment::Key(key) => key.clone(),
        PathSegment::Index(index) => index.to_string(),
        PathSegment::Node(_) => return None,
    };
    Some(SourceKey::new(namespace, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{all_of, answer, condition, data, test};
    use crate::node::{NodeFactory, NodeIdGenerator};

    fn build(def: &serde_json::Value) -> (NodeRegistry, NodeId, Vec<NodeId>) {
        let ids = NodeIdGenerator::new();
        let mut factory = NodeFactory::new(&ids);
        let root = factory.create_node(def, "root", None).unwrap();
        let mut nodes = NodeRegistry::new();
        let mut scope = Vec::new();
        for created in factory.into_created() {
            let id = created.node.id;
            nodes.insert(created.node, created.path).unwrap();
            scope.push(id);
        }
        (nodes, root, scope)
    }

    #[test]
    fn predicate_operands_are_indexed_data_flow() {
        let def = all_of(vec![
            test(answer("a").build(), condition("isSet", vec![])),
            test(answer("b").build(), condition("isSet", vec![])),
        ]);
        let (nodes, root, scope) = build(&def);

        let pseudo = PseudoRegistry::new();
        let mut graph = DependencyGraph::new();
        wire_nodes(&nodes, &pseudo, &scope, &[], &|_| None, &[], &mut graph).unwrap();

        assert_eq!(graph.dependencies_of(root, EdgeKind::DataFlow).len(), 2);
    }

    #[test]
    fn reference_consumes_its_pseudo() {
        let def = data("items").build();
        let (nodes, root, scope) = build(&def);

        let ids = NodeIdGenerator::new();
        let mut pseudo = PseudoRegistry::new();
        let pseudo_id = ids.pseudo_id();
        pseudo
            .insert(
                pseudo_id,
                PseudoNode::Data {
                    property: "items".into(),
                },
            )
            .unwrap();

        let mut graph = DependencyGraph::new();
        let lookup = |key: &SourceKey| pseudo.for_source(key);
        wire_nodes(&nodes, &pseudo, &scope, &[], &lookup, &[], &mut graph).unwrap();

        assert_eq!(
            graph.dependencies_of(root, EdgeKind::DataFlow).as_slice(),
            &[pseudo_id]
        );
    }

    #[test]
    fn load_transition_produces_data_pseudos() {
        let (nodes, _root, _scope) = build(&data("x").build());

        let ids = NodeIdGenerator::new();
        let load = ids.ast_id();
        let mut pseudo = PseudoRegistry::new();
        let data_pseudo = ids.pseudo_id();
        pseudo
            .insert(
                data_pseudo,
                PseudoNode::Data {
                    property: "x".into(),
                },
            )
            .unwrap();

        let mut graph = DependencyGraph::new();
        wire_nodes(
            &nodes,
            &pseudo,
            &[],
            &[data_pseudo],
            &|_| None,
            &[load],
            &mut graph,
        )
        .unwrap();

        assert_eq!(
            graph
                .dependencies_of(data_pseudo, EdgeKind::EffectFlow)
                .as_slice(),
            &[load]
        );
    }
}
