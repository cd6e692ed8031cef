//! Node model: ids, the typed AST, and pseudo-nodes.
//!
//! The compiler turns the JSON definition tree into `AstNode`s held in an
//! arena registry; children are referenced by `NodeId` handle, never by raw
//! string id. Pseudo-nodes represent request-time data sources (POST, query,
//! params, data, answers) and exist only to act as dependency producers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

pub mod factory;
pub mod registry;

pub use factory::NodeFactory;
pub use registry::{MetadataRegistry, NodeMeta, NodeRegistry, PseudoRegistry};

// ============================================================================
// NODE IDS
// ============================================================================

/// Which pool a node id was allocated from.
///
/// Compile-time ids come from the main compilation; runtime ids are allocated
/// by overlays while evaluation materializes per-item subtrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeCategory {
    CompileAst,
    CompilePseudo,
    RuntimeAst,
    RuntimePseudo,
}

impl NodeCategory {
    pub fn is_runtime(self) -> bool {
        matches!(self, NodeCategory::RuntimeAst | NodeCategory::RuntimePseudo)
    }

    fn tag(self) -> &'static str {
        match self {
            NodeCategory::CompileAst => "compile_ast",
            NodeCategory::CompilePseudo => "compile_pseudo",
            NodeCategory::RuntimeAst => "runtime_ast",
            NodeCategory::RuntimePseudo => "runtime_pseudo",
        }
    }
}

/// Opaque node identifier: category + monotonic sequence number.
///
/// Renders as `compile_ast:7` / `runtime_pseudo:41` in errors and traces.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    category: NodeCategory,
    seq: u64,
}

impl NodeId {
    pub fn category(self) -> NodeCategory {
        self.category
    }

    pub fn is_runtime(self) -> bool {
        self.category.is_runtime()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category.tag(), self.seq)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Monotonic id allocator shared between the main compilation and any
/// runtime overlays.
///
/// An overlay calls [`NodeIdGenerator::runtime_view`] to obtain a child
/// generator that allocates runtime-category ids from the same counter, so
/// compile and runtime ids never collide.
#[derive(Clone)]
pub struct NodeIdGenerator {
    counter: Arc<AtomicU64>,
    runtime: bool,
}

impl NodeIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            runtime: false,
        }
    }

    /// Child generator allocating runtime-category ids from the same counter.
    pub fn runtime_view(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            runtime: true,
        }
    }

    pub fn ast_id(&self) -> NodeId {
        NodeId {
            category: if self.runtime {
                NodeCategory::RuntimeAst
            } else {
                NodeCategory::CompileAst
            },
            seq: self.counter.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn pseudo_id(&self) -> NodeId {
        NodeId {
            category: if self.runtime {
                NodeCategory::RuntimePseudo
            } else {
                NodeCategory::CompilePseudo
            },
            seq: self.counter.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for NodeIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// PROPERTY VALUES
// ============================================================================

/// A property position that admits either a literal, a child node, or a list
/// of both.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Literal(Value),
    Node(NodeId),
    List(Vec<PropValue>),
}

impl PropValue {
    pub const NULL: PropValue = PropValue::Literal(Value::Null);

    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            PropValue::Node(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            PropValue::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// All node ids referenced anywhere inside this value.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_node_ids(&mut out);
        out
    }

    fn collect_node_ids(&self, out: &mut Vec<NodeId>) {
        match self {
            PropValue::Node(id) => out.push(*id),
            PropValue::List(items) => {
                for item in items {
                    item.collect_node_ids(out);
                }
            }
            PropValue::Literal(_) => {}
        }
    }
}

/// One segment of a reference path. The key position may itself be a node
/// (dynamic key) that must be evaluated before the path can be walked.
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
    Node(NodeId),
}

// ============================================================================
// AST NODES
// ============================================================================

/// A typed AST node. `raw` keeps the original definition for diagnostics.
#[derive(Debug, Clone)]
pub struct AstNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub raw: Value,
}

impl AstNode {
    /// Every child node id this node references, in structural order.
    pub fn child_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let push_prop = |out: &mut Vec<NodeId>, prop: &PropValue| prop.collect_node_ids(out);
        let push_opt = |out: &mut Vec<NodeId>, prop: &Option<PropValue>| {
            if let Some(prop) = prop {
                prop.collect_node_ids(out);
            }
        };
        let push_props = |out: &mut Vec<NodeId>, props: &PropertyMap| {
            for prop in props.values() {
                prop.collect_node_ids(out);
            }
        };

        match &self.kind {
            NodeKind::Journey(j) => {
                out.extend(&j.steps);
                out.extend(j.on_load);
                out.extend(&j.on_access);
                push_props(&mut out, &j.properties);
            }
            NodeKind::Step(s) => {
                out.extend(&s.blocks);
                out.extend(&s.next);
                out.extend(s.on_load);
                out.extend(&s.on_access);
                out.extend(&s.on_action);
                out.extend(&s.on_submission);
                push_props(&mut out, &s.properties);
            }
            NodeKind::Block(b) => {
                push_opt(&mut out, &b.default_value);
                out.extend(b.format_pipeline);
                out.extend(&b.validate);
                push_opt(&mut out, &b.dependent);
                out.extend(&b.blocks);
                push_props(&mut out, &b.properties);
            }
            NodeKind::Expression(expr) => match expr {
                ExprNode::Reference { path, base } => {
                    for segment in path {
                        if let PathSegment::Node(id) = segment {
                            out.push(*id);
                        }
                    }
                    out.extend(*base);
                }
                ExprNode::Pipeline { input, steps } => {
                    push_prop(&mut out, input);
                    out.extend(steps);
                }
                ExprNode::Format { arguments, .. } => {
                    for argument in arguments {
                        push_prop(&mut out, argument);
                    }
                }
                ExprNode::Iterate { input, .. } => push_prop(&mut out, input),
                ExprNode::Conditional {
                    predicate,
                    then_value,
                    else_value,
                } => {
                    push_prop(&mut out, predicate);
                    push_prop(&mut out, then_value);
                    push_prop(&mut out, else_value);
                }
                ExprNode::Next { when, goto } => {
                    out.extend(*when);
                    push_prop(&mut out, goto);
                }
                ExprNode::Validation { when, message, .. } => {
                    out.push(*when);
                    push_prop(&mut out, message);
                }
                ExprNode::Function { arguments, .. } => {
                    for argument in arguments {
                        push_prop(&mut out, argument);
                    }
                }
            },
            NodeKind::Predicate(predicate) => match predicate {
                PredicateNode::Test {
                    subject, condition, ..
                } => {
                    push_prop(&mut out, subject);
                    out.push(*condition);
                }
                PredicateNode::And { operands }
                | PredicateNode::Or { operands }
                | PredicateNode::Xor { operands } => {
                    for operand in operands {
                        push_prop(&mut out, operand);
                    }
                }
                PredicateNode::Not { operand } => push_prop(&mut out, operand),
            },
            NodeKind::Transition(transition) => match transition {
                TransitionNode::Load { effects } => out.extend(effects),
                TransitionNode::Access {
                    guards,
                    effects,
                    next,
                } => {
                    push_opt(&mut out, guards);
                    out.extend(effects);
                    out.extend(next);
                }
                TransitionNode::Action { when, effects } => {
                    push_prop(&mut out, when);
                    out.extend(effects);
                }
                TransitionNode::Submit {
                    when,
                    guards,
                    on_valid,
                    on_invalid,
                    on_always,
                    ..
                } => {
                    push_opt(&mut out, when);
                    push_opt(&mut out, guards);
                    for branch in [on_valid, on_invalid, on_always] {
                        out.extend(&branch.effects);
                        out.extend(&branch.next);
                    }
                }
            },
            NodeKind::Outcome(outcome) => match outcome {
                OutcomeNode::Redirect { when, goto } => {
                    push_opt(&mut out, when);
                    push_prop(&mut out, goto);
                }
                OutcomeNode::ThrowError { when, message, .. } => {
                    push_opt(&mut out, when);
                    push_prop(&mut out, message);
                }
            },
        }
        out
    }

    /// Coarse node type name, for traces and error messages.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Journey(_) => "journey",
            NodeKind::Step(_) => "step",
            NodeKind::Block(_) => "block",
            NodeKind::Expression(e) => e.type_name(),
            NodeKind::Predicate(p) => p.type_name(),
            NodeKind::Transition(t) => t.type_name(),
            NodeKind::Outcome(o) => o.type_name(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Journey(JourneyNode),
    Step(StepNode),
    Block(BlockNode),
    Expression(ExprNode),
    Predicate(PredicateNode),
    Transition(TransitionNode),
    Outcome(OutcomeNode),
}

/// Extra display properties keyed by name, in stable order.
pub type PropertyMap = std::collections::BTreeMap<String, PropValue>;

#[derive(Debug, Clone)]
pub struct JourneyNode {
    pub path: String,
    pub steps: Vec<NodeId>,
    pub on_load: Option<NodeId>,
    pub on_access: Vec<NodeId>,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone)]
pub struct StepNode {
    pub path: String,
    pub blocks: Vec<NodeId>,
    /// Fallback navigation used by SUBMIT branches that carry no `next` of
    /// their own.
    pub next: Vec<NodeId>,
    pub on_load: Option<NodeId>,
    pub on_access: Vec<NodeId>,
    pub on_action: Vec<NodeId>,
    pub on_submission: Vec<NodeId>,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Field,
    Basic,
}

#[derive(Debug, Clone)]
pub struct BlockNode {
    pub block_type: BlockType,
    pub variant: String,
    /// Field code; present iff `block_type == Field`.
    pub code: Option<String>,
    pub default_value: Option<PropValue>,
    /// Raw formatter definitions, preserved verbatim for submission-time use.
    pub formatters: Vec<Value>,
    /// Derived by the formatters normalizer; never authored directly.
    pub format_pipeline: Option<NodeId>,
    pub validate: Vec<NodeId>,
    pub dependent: Option<PropValue>,
    pub multiple: bool,
    /// Nested blocks (composite components).
    pub blocks: Vec<NodeId>,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone)]
pub enum ExprNode {
    Reference {
        path: Vec<PathSegment>,
        base: Option<NodeId>,
    },
    Pipeline {
        input: PropValue,
        steps: Vec<NodeId>,
    },
    Format {
        template: String,
        arguments: Vec<PropValue>,
    },
    Iterate {
        input: PropValue,
        iterator: IteratorKind,
    },
    Conditional {
        predicate: PropValue,
        then_value: PropValue,
        else_value: PropValue,
    },
    Next {
        when: Option<NodeId>,
        goto: PropValue,
    },
    Validation {
        when: NodeId,
        message: PropValue,
        submission_only: bool,
        details: Option<Value>,
        /// Attached by the validation normalizer: owning field code.
        block_code: Option<String>,
    },
    Function {
        kind: FunctionKind,
        name: String,
        arguments: Vec<PropValue>,
    },
}

impl ExprNode {
    pub fn type_name(&self) -> &'static str {
        match self {
            ExprNode::Reference { .. } => "reference",
            ExprNode::Pipeline { .. } => "pipeline",
            ExprNode::Format { .. } => "format",
            ExprNode::Iterate { .. } => "iterate",
            ExprNode::Conditional { .. } => "conditional",
            ExprNode::Next { .. } => "next",
            ExprNode::Validation { .. } => "validation",
            ExprNode::Function { kind, .. } => kind.tag(),
        }
    }
}

/// Iterator templates stay as raw JSON: the overlay instantiates a fresh
/// subtree per item so `@item` scope references resolve correctly.
#[derive(Debug, Clone)]
pub enum IteratorKind {
    Map { template: Value },
    Filter { template: Value },
    Find { template: Value },
}

impl IteratorKind {
    pub fn template(&self) -> &Value {
        match self {
            IteratorKind::Map { template }
            | IteratorKind::Filter { template }
            | IteratorKind::Find { template } => template,
        }
    }
}

/// Function category of a FUNCTION expression and of registry entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    Condition,
    Transformer,
    Effect,
    Generator,
}

impl FunctionKind {
    pub fn tag(self) -> &'static str {
        match self {
            FunctionKind::Condition => "condition",
            FunctionKind::Transformer => "transformer",
            FunctionKind::Effect => "effect",
            FunctionKind::Generator => "generator",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "condition" => Some(FunctionKind::Condition),
            "transformer" => Some(FunctionKind::Transformer),
            "effect" => Some(FunctionKind::Effect),
            "generator" => Some(FunctionKind::Generator),
            _ => None,
        }
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone)]
pub enum PredicateNode {
    Test {
        subject: PropValue,
        condition: NodeId,
        negate: bool,
    },
    And { operands: Vec<PropValue> },
    Or { operands: Vec<PropValue> },
    Xor { operands: Vec<PropValue> },
    Not { operand: PropValue },
}

impl PredicateNode {
    pub fn type_name(&self) -> &'static str {
        match self {
            PredicateNode::Test { .. } => "test",
            PredicateNode::And { .. } => "and",
            PredicateNode::Or { .. } => "or",
            PredicateNode::Xor { .. } => "xor",
            PredicateNode::Not { .. } => "not",
        }
    }
}

/// One branch of a SUBMIT transition.
#[derive(Debug, Clone, Default)]
pub struct SubmitBranch {
    pub effects: Vec<NodeId>,
    pub next: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub enum TransitionNode {
    Load {
        effects: Vec<NodeId>,
    },
    Access {
        guards: Option<PropValue>,
        effects: Vec<NodeId>,
        next: Vec<NodeId>,
    },
    Action {
        when: PropValue,
        effects: Vec<NodeId>,
    },
    Submit {
        when: Option<PropValue>,
        guards: Option<PropValue>,
        validate: bool,
        on_valid: SubmitBranch,
        on_invalid: SubmitBranch,
        on_always: SubmitBranch,
    },
}

impl TransitionNode {
    pub fn type_name(&self) -> &'static str {
        match self {
            TransitionNode::Load { .. } => "load",
            TransitionNode::Access { .. } => "access",
            TransitionNode::Action { .. } => "action",
            TransitionNode::Submit { .. } => "submit",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OutcomeNode {
    Redirect {
        when: Option<PropValue>,
        goto: PropValue,
    },
    ThrowError {
        when: Option<PropValue>,
        status: u16,
        message: PropValue,
    },
}

impl OutcomeNode {
    pub fn type_name(&self) -> &'static str {
        match self {
            OutcomeNode::Redirect { .. } => "redirect",
            OutcomeNode::ThrowError { .. } => "throwError",
        }
    }
}

// ============================================================================
// PSEUDO-NODES
// ============================================================================

/// Request-time data-source namespaces a reference path may open with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Post,
    Query,
    Params,
    Data,
    Answers,
}

impl Namespace {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "post" => Some(Namespace::Post),
            "query" => Some(Namespace::Query),
            "params" => Some(Namespace::Params),
            "data" => Some(Namespace::Data),
            "answers" => Some(Namespace::Answers),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Namespace::Post => "post",
            Namespace::Query => "query",
            Namespace::Params => "params",
            Namespace::Data => "data",
            Namespace::Answers => "answers",
        }
    }
}

/// Lookup key for a pseudo-node: one per `(namespace, key)` per scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub namespace: Namespace,
    pub key: String,
}

impl SourceKey {
    pub fn new(namespace: Namespace, key: impl Into<String>) -> Self {
        Self {
            namespace,
            key: key.into(),
        }
    }
}

/// A synthesized data-source node. Pseudo-nodes have no `raw`; they exist to
/// be dependency producers for references.
#[derive(Debug, Clone)]
pub enum PseudoNode {
    Post {
        field_code: String,
        field_node: Option<NodeId>,
    },
    Query { param: String },
    Params { param: String },
    Data { property: String },
    AnswerLocal {
        field_code: String,
        field_node: NodeId,
    },
    AnswerRemote { field_code: String },
}

impl PseudoNode {
    pub fn type_name(&self) -> &'static str {
        match self {
            PseudoNode::Post { .. } => "post",
            PseudoNode::Query { .. } => "query",
            PseudoNode::Params { .. } => "params",
            PseudoNode::Data { .. } => "data",
            PseudoNode::AnswerLocal { .. } => "answer_local",
            PseudoNode::AnswerRemote { .. } => "answer_remote",
        }
    }

    /// The `(namespace, key)` this pseudo-node serves.
    pub fn source_key(&self) -> SourceKey {
        match self {
            PseudoNode::Post { field_code, .. } => {
                SourceKey::new(Namespace::Post, field_code.as_str())
            }
            PseudoNode::Query { param } => SourceKey::new(Namespace::Query, param.as_str()),
            PseudoNode::Params { param } => SourceKey::new(Namespace::Params, param.as_str()),
            PseudoNode::Data { property } => SourceKey::new(Namespace::Data, property.as_str()),
            PseudoNode::AnswerLocal { field_code, .. }
            | PseudoNode::AnswerRemote { field_code } => {
                SourceKey::new(Namespace::Answers, field_code.as_str())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_tagged() {
        let ids = NodeIdGenerator::new();
        let a = ids.ast_id();
        let b = ids.pseudo_id();
        let c = ids.ast_id();

        assert_eq!(a.to_string(), "compile_ast:0");
        assert_eq!(b.to_string(), "compile_pseudo:1");
        assert_eq!(c.to_string(), "compile_ast:2");
        assert!(a < c);
    }

    #[test]
    fn runtime_view_shares_the_counter() {
        let ids = NodeIdGenerator::new();
        let a = ids.ast_id();
        let rt = ids.runtime_view();
        let b = rt.ast_id();
        let c = ids.ast_id();

        assert_eq!(a.to_string(), "compile_ast:0");
        assert_eq!(b.to_string(), "runtime_ast:1");
        assert_eq!(c.to_string(), "compile_ast:2");
        assert!(b.is_runtime());
        assert!(!c.is_runtime());
    }

    #[test]
    fn prop_value_collects_nested_node_ids() {
        let ids = NodeIdGenerator::new();
        let a = ids.ast_id();
        let b = ids.ast_id();

        let value = PropValue::List(vec![
            PropValue::Node(a),
            PropValue::Literal(serde_json::json!("x")),
            PropValue::List(vec![PropValue::Node(b)]),
        ]);

        assert_eq!(value.node_ids(), vec![a, b]);
    }

    #[test]
    fn source_key_for_answer_pseudos() {
        let ids = NodeIdGenerator::new();
        let field = ids.ast_id();

        let local = PseudoNode::AnswerLocal {
            field_code: "email".into(),
            field_node: field,
        };
        let remote = PseudoNode::AnswerRemote {
            field_code: "email".into(),
        };

        assert_eq!(local.source_key(), remote.source_key());
        assert_eq!(local.source_key().namespace, Namespace::Answers);
    }
}
