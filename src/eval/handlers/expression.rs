//! Handlers for pipeline, format, conditional, next, and validation
//! expressions.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::eval::context::EvalContext;
use crate::eval::handler::{AsyncFlags, HandlerResult, ThunkHandler};
use crate::eval::handlers::{
    eval_prop, eval_prop_sync, eval_props_parallel, prop_is_async, props_are_async,
};
use crate::eval::invoke::Invoker;
use crate::eval::scope::ScopeFrame;
use crate::node::{NodeId, PropValue};
use crate::walk::is_truthy;

// ============================================================================
// PIPELINE
// ============================================================================

/// Threads a value through transformer steps. Each step sees the current
/// value as `@value` in scope; evaluation stops at the first failing step.
pub struct PipelineHandler {
    pub id: NodeId,
    pub input: PropValue,
    pub steps: Vec<NodeId>,
}

#[async_trait]
impl ThunkHandler for PipelineHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        prop_is_async(&self.input, flags) || self.steps.iter().any(|id| flags.is_async(*id))
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        if self.steps.len() > ctx.limits().max_pipeline_steps {
            return Err(HandlerError::evaluation(
                self.id,
                format!("pipeline exceeds {} steps", ctx.limits().max_pipeline_steps),
            ));
        }
        let mut current = eval_prop(&self.input, ctx, inv).await?;
        for step in &self.steps {
            let _scope = ctx.scope().push_guard(ScopeFrame::pipeline(current.clone()));
            current = inv.invoke(*step, ctx).await?;
        }
        Ok(current)
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        if self.steps.len() > ctx.limits().max_pipeline_steps {
            return Err(HandlerError::evaluation(
                self.id,
                format!("pipeline exceeds {} steps", ctx.limits().max_pipeline_steps),
            ));
        }
        let mut current = eval_prop_sync(&self.input, ctx, inv)?;
        for step in &self.steps {
            let _scope = ctx.scope().push_guard(ScopeFrame::pipeline(current.clone()));
            current = inv.invoke_sync(*step, ctx)?;
        }
        Ok(current)
    }
}

// ============================================================================
// FORMAT
// ============================================================================

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"%(\d+)").expect("valid regex"));

/// `%1..%N` substitution. Arguments evaluate concurrently on the async
/// path; missing and null arguments render as the empty string. No HTML
/// escaping happens here - that is the template layer's contract.
pub struct FormatHandler {
    pub id: NodeId,
    pub template: String,
    pub arguments: Vec<PropValue>,
}

fn render_argument(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

impl FormatHandler {
    fn substitute(&self, arguments: &[Value]) -> String {
        PLACEHOLDER
            .replace_all(&self.template, |caps: &regex::Captures<'_>| {
                let position: usize = caps[1].parse().unwrap_or(0);
                if position == 0 {
                    return String::new();
                }
                arguments
                    .get(position - 1)
                    .map(render_argument)
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

#[async_trait]
impl ThunkHandler for FormatHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        props_are_async(&self.arguments, flags)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let arguments = eval_props_parallel(&self.arguments, ctx, inv).await?;
        Ok(Value::String(self.substitute(&arguments)))
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let mut arguments = Vec::with_capacity(self.arguments.len());
        for argument in &self.arguments {
            arguments.push(eval_prop_sync(argument, ctx, inv)?);
        }
        Ok(Value::String(self.substitute(&arguments)))
    }
}

// ============================================================================
// CONDITIONAL
// ============================================================================

pub struct ConditionalHandler {
    pub id: NodeId,
    pub predicate: PropValue,
    pub then_value: PropValue,
    pub else_value: PropValue,
}

#[async_trait]
impl ThunkHandler for ConditionalHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        prop_is_async(&self.predicate, flags)
            || prop_is_async(&self.then_value, flags)
            || prop_is_async(&self.else_value, flags)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let predicate = eval_prop(&self.predicate, ctx, inv).await?;
        if is_truthy(&predicate) {
            eval_prop(&self.then_value, ctx, inv).await
        } else {
            eval_prop(&self.else_value, ctx, inv).await
        }
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let predicate = eval_prop_sync(&self.predicate, ctx, inv)?;
        if is_truthy(&predicate) {
            eval_prop_sync(&self.then_value, ctx, inv)
        } else {
            eval_prop_sync(&self.else_value, ctx, inv)
        }
    }
}

// ============================================================================
// NEXT
// ============================================================================

/// Navigation candidate. Yields null when gated off; otherwise a
/// `{"type": "redirect"}` outcome (or whatever outcome the goto produced).
pub struct NextHandler {
    pub id: NodeId,
    pub when: Option<NodeId>,
    pub goto: PropValue,
}

impl NextHandler {
    fn wrap_goto(value: Value) -> Value {
        match value {
            Value::String(path) => json!({"type": "redirect", "value": path}),
            Value::Object(obj) if obj.contains_key("type") => Value::Object(obj),
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl ThunkHandler for NextHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    // First-match control flow; never memoized.
    fn cacheable(&self) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        if let Some(when) = self.when {
            let gate = inv.invoke(when, ctx).await.unwrap_or(Value::Bool(false));
            if !is_truthy(&gate) {
                return Ok(Value::Null);
            }
        }
        let goto = eval_prop(&self.goto, ctx, inv).await?;
        Ok(Self::wrap_goto(goto))
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

/// A validation passes when its `when` predicate is falsy. A predicate
/// that fails to evaluate is reported as a failed validation rather than an
/// error - authors must never lose a validation to a bad expression.
pub struct ValidationHandler {
    pub id: NodeId,
    pub when: NodeId,
    pub message: PropValue,
    pub submission_only: bool,
    pub details: Option<Value>,
    pub block_code: Option<String>,
}

impl ValidationHandler {
    fn output(&self, passed: bool, message: Value) -> Value {
        json!({
            "passed": passed,
            "message": message,
            "submissionOnly": self.submission_only,
            "details": self.details.clone().unwrap_or(Value::Null),
            "blockCode": self.block_code.clone().map(Value::String).unwrap_or(Value::Null),
        })
    }
}

#[async_trait]
impl ThunkHandler for ValidationHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        flags.is_async(self.when) || prop_is_async(&self.message, flags)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let message = eval_prop(&self.message, ctx, inv)
            .await
            .unwrap_or(Value::Null);
        match inv.invoke(self.when, ctx).await {
            Ok(when) => Ok(self.output(!is_truthy(&when), message)),
            Err(_) => Ok(self.output(false, message)),
        }
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let message = eval_prop_sync(&self.message, ctx, inv).unwrap_or(Value::Null);
        match inv.invoke_sync(self.when, ctx) {
            Ok(when) => Ok(self.output(!is_truthy(&when), message)),
            Err(_) => Ok(self.output(false, message)),
        }
    }
}
