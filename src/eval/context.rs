//! Per-request evaluation context.
//!
//! Owns everything mutable during a request: answers with their mutation
//! history, `data` populated by load effects, the scope stack, the result
//! cache, the security-error sink, and the runtime layer that receives
//! overlay-flushed nodes. The compiled form itself stays immutable and is
//! shared across requests.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::compile::CompiledForm;
use crate::error::HandlerError;
use crate::eval::cache::ThunkCacheManager;
use crate::eval::handler::ThunkHandler;
use crate::eval::overlay::RuntimeLayer;
use crate::eval::scope::ScopeStack;
use crate::limits::EngineLimits;
use crate::node::{Namespace, NodeId, NodeIdGenerator, PseudoNode, SourceKey};
use crate::registry::FunctionRegistry;
use crate::request::{AnswerEntry, AnswerMap, Mutation, MutationSource, RequestAdapter};

pub struct EvalContext<'f> {
    form: &'f CompiledForm,
    request: RequestAdapter,
    answers: Mutex<AnswerMap>,
    data: Mutex<Map<String, Value>>,
    scope: ScopeStack,
    cache: ThunkCacheManager,
    security_errors: Mutex<Vec<HandlerError>>,
    runtime: RuntimeLayer,
    runtime_ids: NodeIdGenerator,
    limits: EngineLimits,
}

impl<'f> EvalContext<'f> {
    pub fn new(form: &'f CompiledForm, mut request: RequestAdapter, limits: EngineLimits) -> Self {
        let answers = std::mem::take(&mut request.answers);
        let data = std::mem::take(&mut request.data);
        let runtime_ids = form.ids().runtime_view();
        Self {
            form,
            request,
            answers: Mutex::new(answers),
            data: Mutex::new(data),
            scope: ScopeStack::new(),
            cache: ThunkCacheManager::new(),
            security_errors: Mutex::new(Vec::new()),
            runtime: RuntimeLayer::new(),
            runtime_ids,
            limits,
        }
    }

    pub fn form(&self) -> &'f CompiledForm {
        self.form
    }

    pub fn request(&self) -> &RequestAdapter {
        &self.request
    }

    pub fn scope(&self) -> &ScopeStack {
        &self.scope
    }

    pub fn cache(&self) -> &ThunkCacheManager {
        &self.cache
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    pub fn functions(&self) -> &FunctionRegistry {
        self.form.functions()
    }

    pub(crate) fn runtime(&self) -> &RuntimeLayer {
        &self.runtime
    }

    /// Id generator for runtime overlays (shared counter with the form's).
    pub(crate) fn runtime_ids(&self) -> &NodeIdGenerator {
        &self.runtime_ids
    }

    // ------------------------------------------------------------------
    // Request reads
    // ------------------------------------------------------------------

    pub fn post_raw(&self, key: &str) -> Option<Value> {
        self.request.post.get(key).cloned()
    }

    pub fn query_raw(&self, key: &str) -> Option<Value> {
        self.request.query.get(key).cloned()
    }

    pub fn params_raw(&self, key: &str) -> Option<Value> {
        self.request.params.get(key).cloned()
    }

    pub fn data_get(&self, key: &str) -> Option<Value> {
        self.data.lock().get(key).cloned()
    }

    /// Write request data (load effects) and invalidate the matching DATA
    /// pseudo-node's consumers.
    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        trace!(key = %key, "set data");
        self.data.lock().insert(key.clone(), value);
        if let Some(id) = self.pseudo_for(&SourceKey::new(Namespace::Data, key)) {
            self.invalidate_cascade(vec![id]);
        }
    }

    // ------------------------------------------------------------------
    // Answers
    // ------------------------------------------------------------------

    pub fn answer_current(&self, code: &str) -> Option<Value> {
        self.answers.lock().get(code).map(|entry| entry.current.clone())
    }

    pub fn answer_entry(&self, code: &str) -> Option<AnswerEntry> {
        self.answers.lock().get(code).cloned()
    }

    /// Append a mutation and update the current value. Cached reads of the
    /// field's answer pseudo-nodes are invalidated, cascading to consumers.
    pub fn set_answer(&self, code: impl Into<String>, value: Value, source: MutationSource) {
        let code = code.into();
        debug!(code = %code, ?source, "set answer");
        {
            let mut answers = self.answers.lock();
            let entry = answers.entry(code.clone()).or_default();
            entry.current = value.clone();
            entry.mutations.push(Mutation { value, source });
        }
        self.invalidate_answer(&code);
    }

    /// Record the value an answer resolution produced, without touching the
    /// mutation log: readers do not mutate history.
    pub fn store_resolved_answer(&self, code: impl Into<String>, value: Value) {
        let code = code.into();
        let mut answers = self.answers.lock();
        answers.entry(code).or_default().current = value;
    }

    /// Whether any mutation from `source` has been recorded for `code`.
    pub fn answer_has_mutation_from(&self, code: &str, source: MutationSource) -> bool {
        self.answers
            .lock()
            .get(code)
            .map(|entry| entry.mutations.iter().any(|m| m.source == source))
            .unwrap_or(false)
    }

    /// Snapshot of the answers map for the embedder to persist.
    pub fn answers_snapshot(&self) -> AnswerMap {
        self.answers.lock().clone()
    }

    fn invalidate_answer(&self, code: &str) {
        let key = SourceKey::new(Namespace::Answers, code);
        let mut seeds = Vec::new();
        if let Some(id) = self.pseudo_for(&key) {
            seeds.push(id);
        }
        // The field's POST pseudo feeds the answer waterfall, so its cached
        // consumers go stale too.
        if let Some(id) = self.pseudo_for(&SourceKey::new(Namespace::Post, code)) {
            seeds.push(id);
        }
        if !seeds.is_empty() {
            self.invalidate_cascade(seeds);
        }
    }

    // ------------------------------------------------------------------
    // Security errors
    // ------------------------------------------------------------------

    pub fn record_security_error(&self, error: HandlerError) {
        debug!(%error, "security violation recorded");
        self.security_errors.lock().push(error);
    }

    pub fn security_errors(&self) -> Vec<HandlerError> {
        self.security_errors.lock().clone()
    }

    // ------------------------------------------------------------------
    // Layered registry reads (runtime layer first, then the compiled form)
    // ------------------------------------------------------------------

    pub fn pseudo_for(&self, key: &SourceKey) -> Option<NodeId> {
        self.runtime
            .pseudo_for(key)
            .or_else(|| self.form.pseudo_for(key))
    }

    pub fn pseudo_node(&self, id: NodeId) -> Option<PseudoNode> {
        self.runtime
            .pseudo_node(id)
            .or_else(|| self.form.pseudo_node(id).cloned())
    }

    pub fn handler(&self, id: NodeId) -> Option<Arc<dyn ThunkHandler>> {
        self.runtime.handler(id).or_else(|| self.form.handler(id))
    }

    pub fn is_async(&self, id: NodeId) -> bool {
        self.runtime
            .async_flag(id)
            .or_else(|| self.form.async_flag(id))
            .unwrap_or(true)
    }

    /// Field block on the target step carrying `code`.
    pub fn field_on_target(&self, code: &str) -> Option<NodeId> {
        self.form.field_on_target(code)
    }

    // ------------------------------------------------------------------
    // Cache invalidation
    // ------------------------------------------------------------------

    /// Invalidate the seeds and every consumer reachable from them through
    /// evaluation-order edges, in both the compiled graph and the runtime
    /// layer.
    pub fn invalidate_cascade(&self, seeds: Vec<NodeId>) {
        let mut doomed: Vec<NodeId> = Vec::new();
        let mut queue = seeds;
        while let Some(id) = queue.pop() {
            if doomed.contains(&id) {
                continue;
            }
            doomed.push(id);
            for dependent in self.form.graph().value_dependents(id) {
                queue.push(dependent);
            }
            for dependent in self.runtime.value_dependents(id) {
                queue.push(dependent);
            }
        }
        trace!(count = doomed.len(), "cache invalidation cascade");
        self.cache.invalidate_many(doomed);
    }
}

// ============================================================================
// EFFECT SCOPE
// ============================================================================

/// Mutation handle passed to EFFECT functions when they are committed.
///
/// Effects may read request input and answers, and write answers and data;
/// every answer write is logged with the committing transition as its
/// source, which is what gives action-authored values precedence over POST.
pub struct EffectScope<'a> {
    ctx: &'a dyn EffectTarget,
    source: MutationSource,
}

impl<'a> EffectScope<'a> {
    pub(crate) fn new(ctx: &'a dyn EffectTarget, source: MutationSource) -> Self {
        Self { ctx, source }
    }

    pub fn source(&self) -> MutationSource {
        self.source
    }

    pub fn set_answer(&self, code: impl Into<String>, value: Value) {
        self.ctx.effect_set_answer(code.into(), value, self.source);
    }

    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.ctx.effect_set_data(key.into(), value);
    }

    pub fn answer(&self, code: &str) -> Option<Value> {
        self.ctx.effect_answer(code)
    }

    pub fn data(&self, key: &str) -> Option<Value> {
        self.ctx.effect_data(key)
    }

    pub fn session(&self) -> Value {
        self.ctx.effect_session()
    }
}

/// Object-safe surface the effect scope needs from the context. Keeps the
/// registry module decoupled from the context's lifetime parameter.
pub trait EffectTarget: Send + Sync {
    fn effect_set_answer(&self, code: String, value: Value, source: MutationSource);
    fn effect_set_data(&self, key: String, value: Value);
    fn effect_answer(&self, code: &str) -> Option<Value>;
    fn effect_data(&self, key: &str) -> Option<Value>;
    fn effect_session(&self) -> Value;
}

impl EffectTarget for EvalContext<'_> {
    fn effect_set_answer(&self, code: String, value: Value, source: MutationSource) {
        self.set_answer(code, value, source);
    }

    fn effect_set_data(&self, key: String, value: Value) {
        self.set_data(key, value);
    }

    fn effect_answer(&self, code: &str) -> Option<Value> {
        self.answer_current(code)
    }

    fn effect_data(&self, key: &str) -> Option<Value> {
        self.data_get(key)
    }

    fn effect_session(&self) -> Value {
        self.request().session().clone()
    }
}
