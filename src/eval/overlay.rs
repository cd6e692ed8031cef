//! Runtime overlay: materializing nodes during evaluation.
//!
//! An overlay wraps the compilation stores - id generator, node and pseudo
//! registries, metadata, graph, handler map - with a staging area. Reads
//! fall through to the request's runtime layer and then to the compiled
//! form; writes stay local until `flush()` merges them into the runtime
//! layer. Until flush, nothing the overlay created is visible to readers
//! of the parent stores.
//!
//! The iterate handler runs the six compile phases on just the staged
//! subtree: factory → register → normalize → pseudo-synthesize →
//! wire (scoped) → compile handlers → compute async (topologically).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::trace;

use crate::compile::graph::DependencyGraph;
use crate::compile::{normalize, pseudo as pseudo_pass, thunk, wiring};
use crate::error::CompileError;
use crate::eval::context::EvalContext;
use crate::eval::handler::{AsyncFlagMap, HandlerMap, ThunkHandler};
use crate::node::{
    AstNode, MetadataRegistry, NodeFactory, NodeId, NodeMeta, NodeRegistry, PseudoNode,
    PseudoRegistry, SourceKey,
};

// ============================================================================
// RUNTIME LAYER
// ============================================================================

/// Per-request extension of the compiled form's stores. Populated only by
/// overlay flushes; released with the request.
#[derive(Default)]
pub struct RuntimeLayer {
    nodes: Mutex<FxHashMap<NodeId, AstNode>>,
    pseudo: Mutex<FxHashMap<NodeId, PseudoNode>>,
    pseudo_index: Mutex<FxHashMap<SourceKey, NodeId>>,
    metadata: Mutex<FxHashMap<NodeId, NodeMeta>>,
    graph: Mutex<DependencyGraph>,
    handlers: Mutex<HandlerMap>,
    async_flags: Mutex<AsyncFlagMap>,
    node_count: AtomicUsize,
}

impl RuntimeLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ast_node(&self, id: NodeId) -> Option<AstNode> {
        self.nodes.lock().get(&id).cloned()
    }

    pub fn pseudo_node(&self, id: NodeId) -> Option<PseudoNode> {
        self.pseudo.lock().get(&id).cloned()
    }

    pub fn pseudo_for(&self, key: &SourceKey) -> Option<NodeId> {
        self.pseudo_index.lock().get(key).copied()
    }

    pub fn handler(&self, id: NodeId) -> Option<Arc<dyn ThunkHandler>> {
        self.handlers.lock().get(&id).map(Arc::clone)
    }

    pub fn async_flag(&self, id: NodeId) -> Option<bool> {
        self.async_flags.lock().get(&id).copied()
    }

    pub fn value_dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.graph.lock().value_dependents(id).to_vec()
    }

    pub fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Relaxed)
    }
}

// ============================================================================
// TEMPLATE SHAPE
// ============================================================================

/// The compiled form of an iterator template. Templates may be a single
/// tagged definition, or plain object/array structure with definitions at
/// the leaves; the structure is reassembled around the invoked node values.
#[derive(Debug, Clone)]
pub enum TemplateShape {
    Node(NodeId),
    Object(Vec<(String, TemplateShape)>),
    Array(Vec<TemplateShape>),
    Literal(Value),
}

// ============================================================================
// OVERLAY
// ============================================================================

pub struct RuntimeOverlay<'c, 'f> {
    ctx: &'c EvalContext<'f>,
    nodes: NodeRegistry,
    pseudo: PseudoRegistry,
    metadata: MetadataRegistry,
    graph: DependencyGraph,
    handlers: HandlerMap,
    async_flags: AsyncFlagMap,
    pending: Vec<NodeId>,
}

impl<'c, 'f> RuntimeOverlay<'c, 'f> {
    pub fn open(ctx: &'c EvalContext<'f>) -> Self {
        Self {
            ctx,
            nodes: NodeRegistry::new(),
            pseudo: PseudoRegistry::new(),
            metadata: MetadataRegistry::new(),
            graph: DependencyGraph::new(),
            handlers: HandlerMap::default(),
            async_flags: AsyncFlagMap::default(),
            pending: Vec::new(),
        }
    }

    /// Node ids staged in this overlay, in registration order.
    pub fn pending_node_ids(&self) -> &[NodeId] {
        &self.pending
    }

    /// Compile a raw template into an invocable shape, running the full
    /// phase sequence over the fresh subtree.
    pub fn compile_template(&mut self, template: &Value) -> Result<TemplateShape, CompileError> {
        let ids = self.ctx.runtime_ids().clone();
        let mut factory = NodeFactory::new(&ids);
        let shape = build_shape(&mut factory, template, "overlay")?;

        // Register the fresh subtree. Everything materialized at runtime
        // belongs to the target step.
        let target_step = self.ctx.form().target_step();
        let mut scope: Vec<NodeId> = Vec::new();
        for created in factory.into_created() {
            let id = created.node.id;
            self.nodes.insert(created.node, created.path)?;
            let meta = self.metadata.entry(id);
            meta.parent = created.parent;
            meta.owning_step = Some(target_step);
            meta.on_target_step = true;
            scope.push(id);
        }

        // Normalize; register anything the normalizers synthesized.
        for created in normalize::normalize_scope(&mut self.nodes, &ids, &scope)? {
            let id = created.node.id;
            self.nodes.insert(created.node, created.path)?;
            let meta = self.metadata.entry(id);
            meta.parent = created.parent;
            meta.owning_step = Some(target_step);
            meta.on_target_step = true;
            scope.push(id);
        }

        // Pseudo synthesis, reusing sources already served by the runtime
        // layer or the compiled form.
        let ctx = self.ctx;
        let own_pseudo = &mut self.pseudo;
        let new_pseudos = {
            let existing = |key: &SourceKey| ctx.pseudo_for(key);
            pseudo_pass::synthesize_scope(
                &self.nodes,
                &scope,
                &ids,
                ctx.form().target_fields(),
                &existing,
                own_pseudo,
            )?
        };

        // Scoped wiring over the staged subtree.
        {
            let pseudo_reg = &self.pseudo;
            let lookup =
                |key: &SourceKey| pseudo_reg.for_source(key).or_else(|| ctx.pseudo_for(key));
            wiring::wire_nodes(
                &self.nodes,
                pseudo_reg,
                &scope,
                &new_pseudos,
                &lookup,
                ctx.form().load_transitions(),
                &mut self.graph,
            )?;
        }

        // Handlers for the staged subtree, then the async pass in
        // topological order.
        {
            let nodes = &self.nodes;
            let pseudo_reg = &self.pseudo;
            let node_lookup = |id: NodeId| {
                nodes
                    .get(id)
                    .cloned()
                    .or_else(|| ctx.runtime().ast_node(id))
                    .or_else(|| ctx.form().ast_node(id).cloned())
            };
            let pseudo_lookup =
                |key: &SourceKey| pseudo_reg.for_source(key).or_else(|| ctx.pseudo_for(key));
            thunk::compile_scope(
                nodes,
                pseudo_reg,
                &self.metadata,
                &scope,
                &new_pseudos,
                ctx.form().functions(),
                &node_lookup,
                &pseudo_lookup,
                &mut self.handlers,
            )?;
        }
        {
            let parent = |id: NodeId| {
                ctx.runtime()
                    .async_flag(id)
                    .or_else(|| ctx.form().async_flag(id))
            };
            thunk::compute_async_scope(&self.graph, &self.handlers, &parent, &mut self.async_flags)?;
        }

        self.pending.extend(scope);
        self.pending.extend(new_pseudos);
        trace!(staged = self.pending.len(), "overlay compiled template");
        Ok(shape)
    }

    /// Merge the staged stores into the request's runtime layer and return
    /// the newly registered ids so the caller can invalidate their caches.
    pub fn flush(mut self) -> Vec<NodeId> {
        let layer = self.ctx.runtime();
        let pending = std::mem::take(&mut self.pending);

        {
            let mut nodes = layer.nodes.lock();
            for (node, _path) in self.nodes.drain() {
                nodes.insert(node.id, node);
            }
        }
        {
            let mut pseudo = layer.pseudo.lock();
            let mut index = layer.pseudo_index.lock();
            for (id, node) in self.pseudo.drain() {
                index.insert(node.source_key(), id);
                pseudo.insert(id, node);
            }
        }
        {
            let mut metadata = layer.metadata.lock();
            for (id, meta) in self.metadata.drain() {
                metadata.insert(id, meta);
            }
        }
        {
            let mut graph = layer.graph.lock();
            self.graph.merge_into(&mut graph);
        }
        {
            let mut handlers = layer.handlers.lock();
            handlers.extend(self.handlers);
        }
        {
            let mut flags = layer.async_flags.lock();
            flags.extend(self.async_flags);
        }
        layer.node_count.fetch_add(pending.len(), Ordering::Relaxed);
        pending
    }
}

/// Recursively compile a template value: tagged definitions become nodes,
/// untagged objects and arrays keep their structure with compiled leaves.
fn build_shape(
    factory: &mut NodeFactory<'_>,
    value: &Value,
    path: &str,
) -> Result<TemplateShape, CompileError> {
    if crate::node::factory::is_definition(value) {
        return Ok(TemplateShape::Node(factory.create_node(value, path, None)?));
    }
    match value {
        Value::Object(map) => {
            let mut fields = Vec::with_capacity(map.len());
            for (key, child) in map {
                fields.push((
                    key.clone(),
                    build_shape(factory, child, &format!("{path}.{key}"))?,
                ));
            }
            Ok(TemplateShape::Object(fields))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(build_shape(factory, item, &format!("{path}[{i}]"))?);
            }
            Ok(TemplateShape::Array(out))
        }
        other => Ok(TemplateShape::Literal(other.clone())),
    }
}
