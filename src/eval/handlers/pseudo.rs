//! Handlers for pseudo-nodes: the request-time data sources.
//!
//! All raw-input reads (POST, query, params, data) are synchronous. Answer
//! resolution is hybrid: a local answer may chain a format pipeline, which
//! may or may not be async.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;
use crate::eval::context::EvalContext;
use crate::eval::handler::{AsyncFlags, HandlerResult, ThunkHandler};
use crate::eval::handlers::{eval_prop, eval_prop_sync, prop_is_async};
use crate::eval::invoke::Invoker;
use crate::node::{Namespace, NodeId, PropValue, SourceKey};
use crate::request::MutationSource;
use crate::walk::{is_defined, is_safe_key};

/// Reject a forbidden property name, recording a SECURITY error and
/// degrading the read to undefined.
fn guard_key(ctx: &EvalContext<'_>, id: NodeId, key: &str) -> bool {
    if is_safe_key(key) {
        return true;
    }
    ctx.record_security_error(HandlerError::security(
        id,
        format!("forbidden property name '{key}'"),
    ));
    false
}

// ============================================================================
// POST
// ============================================================================

pub struct PostHandler {
    pub id: NodeId,
    pub field_code: String,
    /// From the field block; single-value fields reduce list submissions.
    pub multiple: bool,
}

impl PostHandler {
    fn read(&self, ctx: &EvalContext<'_>) -> HandlerResult {
        if !guard_key(ctx, self.id, &self.field_code) {
            return Ok(Value::Null);
        }
        let raw = ctx.post_raw(&self.field_code).unwrap_or(Value::Null);
        if self.multiple {
            return Ok(raw);
        }
        Ok(reduce_single(raw))
    }
}

/// A single-value field posted as a list keeps its first usable entry:
/// nulls and whitespace-only strings are skipped.
fn reduce_single(raw: Value) -> Value {
    match raw {
        Value::Array(items) => items
            .into_iter()
            .find(|item| match item {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                _ => true,
            })
            .unwrap_or(Value::Null),
        other => other,
    }
}

#[async_trait]
impl ThunkHandler for PostHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, _flags: &dyn AsyncFlags) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, _inv: &Invoker) -> HandlerResult {
        self.read(ctx)
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, _inv: &Invoker) -> HandlerResult {
        self.read(ctx)
    }
}

// ============================================================================
// QUERY / PARAMS / DATA
// ============================================================================

pub struct QueryHandler {
    pub id: NodeId,
    pub param: String,
}

#[async_trait]
impl ThunkHandler for QueryHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, _flags: &dyn AsyncFlags) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        self.evaluate_sync(ctx, inv)
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, _inv: &Invoker) -> HandlerResult {
        if !guard_key(ctx, self.id, &self.param) {
            return Ok(Value::Null);
        }
        Ok(ctx.query_raw(&self.param).unwrap_or(Value::Null))
    }
}

pub struct ParamsHandler {
    pub id: NodeId,
    pub param: String,
}

#[async_trait]
impl ThunkHandler for ParamsHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, _flags: &dyn AsyncFlags) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        self.evaluate_sync(ctx, inv)
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, _inv: &Invoker) -> HandlerResult {
        if !guard_key(ctx, self.id, &self.param) {
            return Ok(Value::Null);
        }
        Ok(ctx.params_raw(&self.param).unwrap_or(Value::Null))
    }
}

pub struct DataHandler {
    pub id: NodeId,
    pub property: String,
}

#[async_trait]
impl ThunkHandler for DataHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, _flags: &dyn AsyncFlags) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        self.evaluate_sync(ctx, inv)
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, _inv: &Invoker) -> HandlerResult {
        if !guard_key(ctx, self.id, &self.property) {
            return Ok(Value::Null);
        }
        Ok(ctx.data_get(&self.property).unwrap_or(Value::Null))
    }
}

// ============================================================================
// ANSWERS
// ============================================================================

pub struct AnswerRemoteHandler {
    pub id: NodeId,
    pub field_code: String,
}

#[async_trait]
impl ThunkHandler for AnswerRemoteHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, _flags: &dyn AsyncFlags) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        self.evaluate_sync(ctx, inv)
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, _inv: &Invoker) -> HandlerResult {
        Ok(ctx.answer_current(&self.field_code).unwrap_or(Value::Null))
    }
}

/// Waterfall resolution for a field on the current step.
///
/// A value written by a lifecycle transition this request is authoritative
/// and wins over POST; otherwise the first defined value of format pipeline
/// → POST → default expression → stored answer → default literal wins. The
/// resolved value is stored as the field's current answer without touching
/// the mutation log.
pub struct AnswerLocalHandler {
    pub id: NodeId,
    pub field_code: String,
    pub format_pipeline: Option<NodeId>,
    pub default_value: Option<PropValue>,
}

impl AnswerLocalHandler {
    fn transition_authored(&self, ctx: &EvalContext<'_>) -> Option<Value> {
        let protected = [
            MutationSource::Load,
            MutationSource::Access,
            MutationSource::Action,
            MutationSource::Submit,
        ]
        .iter()
        .any(|source| ctx.answer_has_mutation_from(&self.field_code, *source));
        if protected {
            ctx.answer_current(&self.field_code)
        } else {
            None
        }
    }

    fn post_pseudo(&self, ctx: &EvalContext<'_>) -> Option<NodeId> {
        ctx.pseudo_for(&SourceKey::new(Namespace::Post, self.field_code.as_str()))
    }

    fn finish(&self, ctx: &EvalContext<'_>, value: Value) -> HandlerResult {
        ctx.store_resolved_answer(&self.field_code, value.clone());
        Ok(value)
    }

    fn fallback(&self, ctx: &EvalContext<'_>) -> HandlerResult {
        if let Some(stored) = ctx.answer_current(&self.field_code) {
            if is_defined(&stored) {
                return Ok(stored);
            }
        }
        if let Some(PropValue::Literal(default)) = &self.default_value {
            if is_defined(default) {
                return self.finish(ctx, default.clone());
            }
        }
        Ok(Value::Null)
    }
}

#[async_trait]
impl ThunkHandler for AnswerLocalHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        let pipeline_async = self
            .format_pipeline
            .map(|id| flags.is_async(id))
            .unwrap_or(false);
        let default_async = self
            .default_value
            .as_ref()
            .map(|d| prop_is_async(d, flags))
            .unwrap_or(false);
        pipeline_async || default_async
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        if let Some(value) = self.transition_authored(ctx) {
            return Ok(value);
        }
        if let Some(pipeline) = self.format_pipeline {
            let value = inv.invoke(pipeline, ctx).await?;
            if is_defined(&value) {
                return self.finish(ctx, value);
            }
        }
        if let Some(post) = self.post_pseudo(ctx) {
            let value = inv.invoke(post, ctx).await?;
            if is_defined(&value) {
                return self.finish(ctx, value);
            }
        }
        if let Some(default @ PropValue::Node(_)) = &self.default_value {
            let value = eval_prop(default, ctx, inv).await?;
            if is_defined(&value) {
                return self.finish(ctx, value);
            }
        }
        self.fallback(ctx)
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        if let Some(value) = self.transition_authored(ctx) {
            return Ok(value);
        }
        if let Some(pipeline) = self.format_pipeline {
            let value = inv.invoke_sync(pipeline, ctx)?;
            if is_defined(&value) {
                return self.finish(ctx, value);
            }
        }
        if let Some(post) = self.post_pseudo(ctx) {
            let value = inv.invoke_sync(post, ctx)?;
            if is_defined(&value) {
                return self.finish(ctx, value);
            }
        }
        if let Some(default @ PropValue::Node(_)) = &self.default_value {
            let value = eval_prop_sync(default, ctx, inv)?;
            if is_defined(&value) {
                return self.finish(ctx, value);
            }
        }
        self.fallback(ctx)
    }
}
