//! Thunk compilation: one handler per node, then the bottom-up async pass.
//!
//! Handlers capture everything they need from the normalized AST, so
//! evaluation never re-reads node definitions. The async pass walks the
//! topological order leaves→roots; a hybrid handler may take the sync path
//! only when every transitive value dependency is sync.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::compile::graph::DependencyGraph;
use crate::error::CompileError;
use crate::eval::handler::{AsyncFlagMap, HandlerMap, ThunkHandler};
use crate::eval::handlers::expression::{
    ConditionalHandler, FormatHandler, NextHandler, PipelineHandler, ValidationHandler,
};
use crate::eval::handlers::function::FunctionHandler;
use crate::eval::handlers::iterate::IterateHandler;
use crate::eval::handlers::predicate::{
    AndHandler, NotHandler, OrHandler, TestHandler, XorHandler,
};
use crate::eval::handlers::pseudo::{
    AnswerLocalHandler, AnswerRemoteHandler, DataHandler, ParamsHandler, PostHandler, QueryHandler,
};
use crate::eval::handlers::reference::ReferenceHandler;
use crate::eval::handlers::structural::{BlockHandler, JourneyHandler, StepHandler};
use crate::eval::handlers::transition::{
    AccessHandler, ActionHandler, LoadHandler, RedirectHandler, SubmitHandler, ThrowErrorHandler,
    ValidationPlan,
};
use crate::node::registry::MetadataRegistry;
use crate::node::{
    AstNode, ExprNode, NodeId, NodeKind, NodeRegistry, OutcomeNode, PredicateNode, PropValue,
    PseudoNode, PseudoRegistry, SourceKey, TransitionNode,
};
use crate::registry::FunctionRegistry;

/// Build handlers for a scope of AST nodes plus newly synthesized
/// pseudo-nodes. `node_lookup`/`pseudo_lookup` resolve across layers so
/// overlay compilation can see the compiled form.
#[allow(clippy::too_many_arguments)]
pub fn compile_scope(
    nodes: &NodeRegistry,
    pseudo: &PseudoRegistry,
    metadata: &MetadataRegistry,
    scope: &[NodeId],
    new_pseudos: &[NodeId],
    functions: &FunctionRegistry,
    node_lookup: &dyn Fn(NodeId) -> Option<AstNode>,
    pseudo_lookup: &dyn Fn(&SourceKey) -> Option<NodeId>,
    handlers: &mut HandlerMap,
) -> Result<(), CompileError> {
    for id in scope {
        let Some(node) = nodes.get(*id) else {
            continue;
        };
        let handler = compile_ast_handler(node, metadata, functions, node_lookup, pseudo_lookup)?;
        handlers.insert(*id, handler);
    }
    for id in new_pseudos {
        let Some(node) = pseudo.get(*id) else {
            continue;
        };
        handlers.insert(*id, compile_pseudo_handler(*id, node, node_lookup));
    }
    Ok(())
}

fn props_vec(properties: &crate::node::PropertyMap) -> Vec<(String, PropValue)> {
    properties
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn compile_ast_handler(
    node: &AstNode,
    metadata: &MetadataRegistry,
    functions: &FunctionRegistry,
    node_lookup: &dyn Fn(NodeId) -> Option<AstNode>,
    pseudo_lookup: &dyn Fn(&SourceKey) -> Option<NodeId>,
) -> Result<Arc<dyn ThunkHandler>, CompileError> {
    let id = node.id;
    let handler: Arc<dyn ThunkHandler> = match &node.kind {
        NodeKind::Journey(journey) => {
            let step_paths = journey
                .steps
                .iter()
                .filter_map(|step| match node_lookup(*step).map(|n| n.kind) {
                    Some(NodeKind::Step(step)) => Some(step.path),
                    _ => None,
                })
                .collect();
            Arc::new(JourneyHandler {
                id,
                path: journey.path.clone(),
                step_paths,
                properties: props_vec(&journey.properties),
                ancestor_of_target: metadata
                    .get(id)
                    .map(|meta| meta.ancestor_of_target)
                    .unwrap_or(false),
            })
        }
        NodeKind::Step(step) => Arc::new(StepHandler {
            id,
            path: step.path.clone(),
            blocks: step.blocks.clone(),
            properties: props_vec(&step.properties),
        }),
        NodeKind::Block(block) => Arc::new(BlockHandler {
            id,
            block_type: block.block_type,
            variant: block.variant.clone(),
            code: block.code.clone(),
            multiple: block.multiple,
            properties: props_vec(&block.properties),
            validate: block.validate.clone(),
            dependent: block.dependent.clone(),
            formatters: block.formatters.clone(),
            child_blocks: block.blocks.clone(),
            on_target: metadata.on_target_step(id),
        }),
        NodeKind::Expression(expr) => match expr {
            ExprNode::Reference { path, base } => {
                let static_pseudo =
                    crate::compile::wiring::static_source(path).and_then(|key| pseudo_lookup(&key));
                Arc::new(ReferenceHandler {
                    id,
                    path: path.clone(),
                    base: *base,
                    static_pseudo,
                })
            }
            ExprNode::Pipeline { input, steps } => Arc::new(PipelineHandler {
                id,
                input: input.clone(),
                steps: steps.clone(),
            }),
            ExprNode::Format {
                template,
                arguments,
            } => Arc::new(FormatHandler {
                id,
                template: template.clone(),
                arguments: arguments.clone(),
            }),
            ExprNode::Iterate { input, iterator } => Arc::new(IterateHandler {
                id,
                input: input.clone(),
                iterator: iterator.clone(),
            }),
            ExprNode::Conditional {
                predicate,
                then_value,
                else_value,
            } => Arc::new(ConditionalHandler {
                id,
                predicate: predicate.clone(),
                then_value: then_value.clone(),
                else_value: else_value.clone(),
            }),
            ExprNode::Next { when, goto } => Arc::new(NextHandler {
                id,
                when: *when,
                goto: goto.clone(),
            }),
            ExprNode::Validation {
                when,
                message,
                submission_only,
                details,
                block_code,
            } => Arc::new(ValidationHandler {
                id,
                when: *when,
                message: message.clone(),
                submission_only: *submission_only,
                details: details.clone(),
                block_code: block_code.clone(),
            }),
            ExprNode::Function {
                kind,
                name,
                arguments,
            } => Arc::new(FunctionHandler {
                id,
                kind: *kind,
                name: name.clone(),
                arguments: arguments.clone(),
                registered_async: functions.get(*kind, name).map(|spec| spec.is_async()),
            }),
        },
        NodeKind::Predicate(predicate) => match predicate {
            PredicateNode::Test {
                subject,
                condition,
                negate,
            } => Arc::new(TestHandler {
                id,
                subject: subject.clone(),
                condition: *condition,
                negate: *negate,
            }),
            PredicateNode::And { operands } => Arc::new(AndHandler {
                id,
                operands: operands.clone(),
            }),
            PredicateNode::Or { operands } => Arc::new(OrHandler {
                id,
                operands: operands.clone(),
            }),
            PredicateNode::Xor { operands } => Arc::new(XorHandler {
                id,
                operands: operands.clone(),
            }),
            PredicateNode::Not { operand } => Arc::new(NotHandler {
                id,
                operand: operand.clone(),
            }),
        },
        NodeKind::Transition(transition) => match transition {
            TransitionNode::Load { effects } => Arc::new(LoadHandler {
                id,
                effects: effects.clone(),
            }),
            TransitionNode::Access {
                guards,
                effects,
                next,
            } => Arc::new(AccessHandler {
                id,
                guards: guards.clone(),
                effects: effects.clone(),
                next: next.clone(),
            }),
            TransitionNode::Action { when, effects } => Arc::new(ActionHandler {
                id,
                when: when.clone(),
                effects: effects.clone(),
            }),
            TransitionNode::Submit {
                when,
                guards,
                validate,
                on_valid,
                on_invalid,
                on_always,
            } => {
                // The owning step supplies the fallback next list and the
                // blocks whose validations gate this submission.
                let (step_next, plans) = match metadata
                    .owning_step(id)
                    .and_then(node_lookup)
                    .map(|n| n.kind)
                {
                    Some(NodeKind::Step(step)) => (
                        step.next.clone(),
                        build_validation_plans(&step.blocks, node_lookup),
                    ),
                    _ => (Vec::new(), Vec::new()),
                };
                Arc::new(SubmitHandler {
                    id,
                    when: when.clone(),
                    guards: guards.clone(),
                    validate: *validate,
                    on_valid: on_valid.clone(),
                    on_invalid: on_invalid.clone(),
                    on_always: on_always.clone(),
                    step_next,
                    plans,
                })
            }
        },
        NodeKind::Outcome(outcome) => match outcome {
            OutcomeNode::Redirect { when, goto } => Arc::new(RedirectHandler {
                id,
                when: when.clone(),
                goto: goto.clone(),
            }),
            OutcomeNode::ThrowError {
                when,
                status,
                message,
            } => Arc::new(ThrowErrorHandler {
                id,
                when: when.clone(),
                status: *status,
                message: message.clone(),
            }),
        },
    };
    Ok(handler)
}

fn compile_pseudo_handler(
    id: NodeId,
    node: &PseudoNode,
    node_lookup: &dyn Fn(NodeId) -> Option<AstNode>,
) -> Arc<dyn ThunkHandler> {
    match node {
        PseudoNode::Post {
            field_code,
            field_node,
        } => {
            let multiple = field_node
                .and_then(node_lookup)
                .map(|field| match field.kind {
                    NodeKind::Block(block) => block.multiple,
                    _ => false,
                })
                .unwrap_or(false);
            Arc::new(PostHandler {
                id,
                field_code: field_code.clone(),
                multiple,
            })
        }
        PseudoNode::Query { param } => Arc::new(QueryHandler {
            id,
            param: param.clone(),
        }),
        PseudoNode::Params { param } => Arc::new(ParamsHandler {
            id,
            param: param.clone(),
        }),
        PseudoNode::Data { property } => Arc::new(DataHandler {
            id,
            property: property.clone(),
        }),
        PseudoNode::AnswerLocal {
            field_code,
            field_node,
        } => {
            let (format_pipeline, default_value) = match node_lookup(*field_node).map(|n| n.kind) {
                Some(NodeKind::Block(block)) => (block.format_pipeline, block.default_value),
                _ => (None, None),
            };
            Arc::new(AnswerLocalHandler {
                id,
                field_code: field_code.clone(),
                format_pipeline,
                default_value,
            })
        }
        PseudoNode::AnswerRemote { field_code } => Arc::new(AnswerRemoteHandler {
            id,
            field_code: field_code.clone(),
        }),
    }
}

/// Validation plans for a block list: every block contributes its
/// dependent gate and validation nodes; nested blocks are walked too.
pub fn build_validation_plans(
    blocks: &[NodeId],
    node_lookup: &dyn Fn(NodeId) -> Option<AstNode>,
) -> Vec<ValidationPlan> {
    let mut plans = Vec::new();
    let mut queue: Vec<NodeId> = blocks.to_vec();
    while let Some(id) = queue.pop() {
        let Some(NodeKind::Block(block)) = node_lookup(id).map(|n| n.kind) else {
            continue;
        };
        queue.extend(&block.blocks);
        if block.validate.is_empty() {
            continue;
        }
        plans.push(ValidationPlan {
            code: block.code.clone(),
            dependent: block.dependent.clone(),
            validations: block.validate.clone(),
        });
    }
    plans.reverse();
    plans
}

/// Compute async flags leaves→roots along the topological order. `parent`
/// supplies flags for nodes owned by an outer layer (the compiled form,
/// when compiling an overlay subtree).
pub fn compute_async_scope(
    graph: &DependencyGraph,
    handlers: &HandlerMap,
    parent: &dyn Fn(NodeId) -> Option<bool>,
    flags: &mut AsyncFlagMap,
) -> Result<(), CompileError> {
    let order = graph.topo_order()?;
    for id in order {
        let Some(handler) = handlers.get(&id) else {
            continue;
        };
        let is_async = {
            let snapshot: &FxHashMap<NodeId, bool> = flags;
            let view = move |query: NodeId| {
                snapshot
                    .get(&query)
                    .copied()
                    .or_else(|| parent(query))
                    .unwrap_or(true)
            };
            handler.compute_is_async(&view)
        };
        flags.insert(id, is_async);
    }
    Ok(())
}
