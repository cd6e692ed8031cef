//! The compilation pipeline.
//!
//! `FormCompiler::compile` runs the full phase sequence over a definition
//! tree for one target step:
//!
//! 1. factory transform (typed nodes, unique ids, `raw` backrefs)
//! 2. registration (arena insert, duplicate ids rejected, parent links)
//! 3. normalization (self references, formatter pipelines, block codes)
//! 4. metadata (ancestor/descendant marks relative to the target step)
//! 5. pseudo-node synthesis (one per distinct data source)
//! 6. wiring (typed dependency edges) + cycle rejection
//! 7. thunk compilation + the bottom-up async pass
//!
//! The output `CompiledForm` is immutable and shared across requests; only
//! the per-request context carries mutable state.

pub mod graph;
pub mod metadata;
pub mod normalize;
pub mod pseudo;
pub mod thunk;
pub mod wiring;

pub use graph::{DependencyGraph, EdgeKind, EdgeMeta};

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::CompileError;
use crate::eval::handler::{AsyncFlagMap, HandlerMap, ThunkHandler};
use crate::eval::handlers::transition::ValidationPlan;
use crate::node::registry::MetadataRegistry;
use crate::node::{
    AstNode, BlockType, NodeFactory, NodeId, NodeIdGenerator, NodeKind, NodeRegistry, PseudoNode,
    PseudoRegistry, SourceKey,
};
use crate::registry::FunctionRegistry;

/// All descendants of `root` reachable through child ids, including root.
pub(crate) fn collect_subtree(nodes: &NodeRegistry, root: NodeId) -> Vec<NodeId> {
    let mut out = vec![root];
    let mut cursor = 0;
    while cursor < out.len() {
        let id = out[cursor];
        cursor += 1;
        if let Some(node) = nodes.get(id) {
            for child in node.child_ids() {
                if !out.contains(&child) {
                    out.push(child);
                }
            }
        }
    }
    out
}

/// Compiles definitions against a function catalogue.
pub struct FormCompiler {
    functions: Arc<FunctionRegistry>,
}

impl FormCompiler {
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self { functions }
    }

    /// Compile `definition` scoped to the step at `target_step_path`.
    pub fn compile(
        &self,
        definition: &Value,
        target_step_path: &str,
    ) -> Result<CompiledForm, CompileError> {
        let ids = NodeIdGenerator::new();

        // Phase 1: factory transform.
        let mut factory = NodeFactory::new(&ids);
        let journey = factory.create_journey(definition)?;

        // Phase 2: registration.
        let mut nodes = NodeRegistry::new();
        let mut metadata = MetadataRegistry::new();
        let mut scope: Vec<NodeId> = Vec::new();
        for created in factory.into_created() {
            let id = created.node.id;
            nodes.insert(created.node, created.path)?;
            metadata.entry(id).parent = created.parent;
            scope.push(id);
        }

        let target_step = find_step(&nodes, journey, target_step_path)?;

        // Phase 3: normalization (may synthesize format pipelines).
        for created in normalize::normalize_scope(&mut nodes, &ids, &scope)? {
            let id = created.node.id;
            nodes.insert(created.node, created.path)?;
            metadata.entry(id).parent = created.parent;
            scope.push(id);
        }

        // Phase 4: metadata relative to the target step.
        metadata::apply_metadata(&nodes, &mut metadata, journey, target_step);

        let target_fields = collect_target_fields(&nodes, target_step);

        // Phase 5: pseudo-node synthesis.
        let mut pseudo = PseudoRegistry::new();
        let new_pseudos = pseudo::synthesize_scope(
            &nodes,
            &scope,
            &ids,
            &target_fields,
            &|_| None,
            &mut pseudo,
        )?;

        let load_transitions = collect_load_transitions(&nodes, journey, target_step);

        // Phase 6: wiring, then the DAG check.
        let mut graph = DependencyGraph::new();
        {
            let lookup = |key: &SourceKey| pseudo.for_source(key);
            wiring::wire_nodes(
                &nodes,
                &pseudo,
                &scope,
                &new_pseudos,
                &lookup,
                &load_transitions,
                &mut graph,
            )?;
        }
        graph.topo_order()?;

        // Phase 7: thunk compilation + async pass.
        let mut handlers = HandlerMap::default();
        {
            let node_lookup = |id: NodeId| nodes.get(id).cloned();
            let pseudo_lookup = |key: &SourceKey| pseudo.for_source(key);
            thunk::compile_scope(
                &nodes,
                &pseudo,
                &metadata,
                &scope,
                &new_pseudos,
                &self.functions,
                &node_lookup,
                &pseudo_lookup,
                &mut handlers,
            )?;
        }
        let mut async_flags = AsyncFlagMap::default();
        thunk::compute_async_scope(&graph, &handlers, &|_| None, &mut async_flags)?;

        let validation_plans = {
            let node_lookup = |id: NodeId| nodes.get(id).cloned();
            match nodes.get(target_step).map(|n| &n.kind) {
                Some(NodeKind::Step(step)) => {
                    thunk::build_validation_plans(&step.blocks, &node_lookup)
                }
                _ => Vec::new(),
            }
        };

        let (access_transitions, action_transitions, submit_transitions) =
            collect_lifecycle_transitions(&nodes, journey, target_step);

        debug!(
            nodes = nodes.len(),
            pseudos = pseudo.len(),
            target = %target_step,
            "form compiled"
        );

        Ok(CompiledForm {
            ids,
            nodes,
            pseudo,
            metadata,
            graph,
            handlers,
            async_flags,
            functions: Arc::clone(&self.functions),
            journey,
            target_step,
            target_fields,
            load_transitions,
            access_transitions,
            action_transitions,
            submit_transitions,
            validation_plans,
        })
    }
}

fn find_step(
    nodes: &NodeRegistry,
    journey: NodeId,
    path: &str,
) -> Result<NodeId, CompileError> {
    let steps = match nodes.get(journey).map(|n| &n.kind) {
        Some(NodeKind::Journey(j)) => j.steps.clone(),
        _ => return Err(CompileError::schema("definition root is not a journey")),
    };
    for step in steps {
        if let Some(NodeKind::Step(s)) = nodes.get(step).map(|n| &n.kind) {
            if s.path == path {
                return Ok(step);
            }
        }
    }
    Err(CompileError::schema(format!(
        "target step '{path}' not found in journey"
    )))
}

fn collect_target_fields(nodes: &NodeRegistry, target_step: NodeId) -> FxHashMap<String, NodeId> {
    let mut fields = FxHashMap::default();
    for id in collect_subtree(nodes, target_step) {
        if let Some(NodeKind::Block(block)) = nodes.get(id).map(|n| &n.kind) {
            if block.block_type == BlockType::Field {
                if let Some(code) = &block.code {
                    fields.entry(code.clone()).or_insert(id);
                }
            }
        }
    }
    fields
}

fn collect_load_transitions(
    nodes: &NodeRegistry,
    journey: NodeId,
    target_step: NodeId,
) -> Vec<NodeId> {
    let mut out = Vec::new();
    if let Some(NodeKind::Journey(j)) = nodes.get(journey).map(|n| &n.kind) {
        out.extend(j.on_load);
    }
    if let Some(NodeKind::Step(s)) = nodes.get(target_step).map(|n| &n.kind) {
        out.extend(s.on_load);
    }
    out
}

fn collect_lifecycle_transitions(
    nodes: &NodeRegistry,
    journey: NodeId,
    target_step: NodeId,
) -> (Vec<NodeId>, Vec<NodeId>, Vec<NodeId>) {
    let mut access = Vec::new();
    let mut action = Vec::new();
    let mut submit = Vec::new();
    if let Some(NodeKind::Journey(j)) = nodes.get(journey).map(|n| &n.kind) {
        access.extend(&j.on_access);
    }
    if let Some(NodeKind::Step(s)) = nodes.get(target_step).map(|n| &n.kind) {
        access.extend(&s.on_access);
        action.extend(&s.on_action);
        submit.extend(&s.on_submission);
    }
    (access, action, submit)
}

// ============================================================================
// COMPILED FORM
// ============================================================================

/// The immutable product of compilation, shared across requests.
pub struct CompiledForm {
    ids: NodeIdGenerator,
    nodes: NodeRegistry,
    pseudo: PseudoRegistry,
    metadata: MetadataRegistry,
    graph: DependencyGraph,
    handlers: HandlerMap,
    async_flags: AsyncFlagMap,
    functions: Arc<FunctionRegistry>,
    journey: NodeId,
    target_step: NodeId,
    target_fields: FxHashMap<String, NodeId>,
    load_transitions: Vec<NodeId>,
    access_transitions: Vec<NodeId>,
    action_transitions: Vec<NodeId>,
    submit_transitions: Vec<NodeId>,
    validation_plans: Vec<ValidationPlan>,
}

impl std::fmt::Debug for CompiledForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledForm")
            .field("journey", &self.journey)
            .field("target_step", &self.target_step)
            .field("target_fields", &self.target_fields)
            .field("load_transitions", &self.load_transitions)
            .field("access_transitions", &self.access_transitions)
            .field("action_transitions", &self.action_transitions)
            .field("submit_transitions", &self.submit_transitions)
            .field("validation_plans", &self.validation_plans)
            .finish_non_exhaustive()
    }
}

impl CompiledForm {
    pub fn journey(&self) -> NodeId {
        self.journey
    }

    pub fn target_step(&self) -> NodeId {
        self.target_step
    }

    pub fn ids(&self) -> &NodeIdGenerator {
        &self.ids
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn ast_node(&self, id: NodeId) -> Option<&AstNode> {
        self.nodes.get(id)
    }

    pub fn node_path(&self, id: NodeId) -> Option<&str> {
        self.nodes.path(id)
    }

    pub fn pseudo_node(&self, id: NodeId) -> Option<&PseudoNode> {
        self.pseudo.get(id)
    }

    pub fn pseudo_for(&self, key: &SourceKey) -> Option<NodeId> {
        self.pseudo.for_source(key)
    }

    pub fn handler(&self, id: NodeId) -> Option<Arc<dyn ThunkHandler>> {
        self.handlers.get(&id).map(Arc::clone)
    }

    pub fn async_flag(&self, id: NodeId) -> Option<bool> {
        self.async_flags.get(&id).copied()
    }

    pub fn field_on_target(&self, code: &str) -> Option<NodeId> {
        self.target_fields.get(code).copied()
    }

    pub fn target_fields(&self) -> &FxHashMap<String, NodeId> {
        &self.target_fields
    }

    pub fn load_transitions(&self) -> &[NodeId] {
        &self.load_transitions
    }

    pub fn access_transitions(&self) -> &[NodeId] {
        &self.access_transitions
    }

    pub fn action_transitions(&self) -> &[NodeId] {
        &self.action_transitions
    }

    pub fn submit_transitions(&self) -> &[NodeId] {
        &self.submit_transitions
    }

    pub fn validation_plans(&self) -> &[ValidationPlan] {
        &self.validation_plans
    }

    /// Metadata for a node (parent, owning step, target flags).
    pub fn metadata(&self) -> &MetadataRegistry {
        &self.metadata
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{answer, condition, field, journey, step, validation};
    use crate::node::Namespace;

    fn functions() -> Arc<FunctionRegistry> {
        Arc::new(FunctionRegistry::new())
    }

    #[test]
    fn compiles_a_minimal_journey() {
        let def = journey("/j")
            .step(step("/a").block(field("text-input", "name")))
            .build();
        let form = FormCompiler::new(functions()).compile(&def, "/a").unwrap();

        assert!(form.node_count() >= 3);
        assert!(form.field_on_target("name").is_some());
        // Target fields always get their answer and POST sources.
        assert!(form
            .pseudo_for(&SourceKey::new(Namespace::Answers, "name"))
            .is_some());
        assert!(form
            .pseudo_for(&SourceKey::new(Namespace::Post, "name"))
            .is_some());
    }

    #[test]
    fn unknown_target_step_is_a_schema_error() {
        let def = journey("/j")
            .step(step("/a").block(field("text-input", "name")))
            .build();
        let err = FormCompiler::new(functions())
            .compile(&def, "/missing")
            .unwrap_err();
        assert!(err.to_string().contains("FF-005"));
        assert!(err.to_string().contains("/missing"));
    }

    #[test]
    fn remote_answers_get_remote_pseudos() {
        let def = journey("/j")
            .step(step("/a").block(field("text-input", "name")))
            .step(
                step("/b").block(
                    field("text-input", "confirm").validate(validation(
                        crate::definition::test(
                            answer("name"),
                            condition("isSet", vec![]),
                        ),
                        "Give your name first",
                    )),
                ),
            )
            .build();
        let form = FormCompiler::new(functions()).compile(&def, "/b").unwrap();

        // "name" lives on another step: remote from /b's point of view.
        let pseudo = form
            .pseudo_for(&SourceKey::new(Namespace::Answers, "name"))
            .unwrap();
        assert!(matches!(
            form.pseudo_node(pseudo),
            Some(crate::node::PseudoNode::AnswerRemote { .. })
        ));
    }

    #[test]
    fn every_registered_node_has_a_handler_and_flag() {
        let def = journey("/j")
            .step(step("/a").block(field("text-input", "name")))
            .build();
        let form = FormCompiler::new(functions()).compile(&def, "/a").unwrap();

        for id in form.graph.node_ids() {
            assert!(form.handler(id).is_some(), "no handler for {id}");
            assert!(form.async_flag(id).is_some(), "no async flag for {id}");
        }
    }
}
