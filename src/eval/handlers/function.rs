//! Function-expression handlers: conditions, transformers, generators, and
//! effect capture.
//!
//! Only registered functions are callable; an unknown name is a LOOKUP
//! error carrying the owning node id. Conditions receive the enclosing
//! test's subject as implicit first argument (via `@subject` scope);
//! transformers receive the pipeline's current `@value` the same way.
//! Effects never execute here - their evaluated arguments are captured into
//! a descriptor the enclosing transition commits later.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::eval::context::EvalContext;
use crate::eval::handler::{AsyncFlags, HandlerResult, ThunkHandler};
use crate::eval::handlers::{eval_prop_sync, eval_props_parallel};
use crate::eval::invoke::Invoker;
use crate::eval::CapturedEffect;
use crate::node::{FunctionKind, NodeId, PropValue};
use crate::registry::FunctionCall;

/// Build the captured-effect descriptor an EFFECT evaluation yields.
pub(crate) fn effect_descriptor(id: NodeId, name: &str, args: Vec<Value>) -> Value {
    json!({"__effect__": {"node": id.to_string(), "name": name, "args": args}})
}

/// Parse a captured-effect descriptor back out of a handler value.
pub(crate) fn parse_effect(value: &Value) -> Option<CapturedEffect> {
    let inner = value.get("__effect__")?;
    Some(CapturedEffect {
        node: inner.get("node")?.as_str()?.to_string(),
        name: inner.get("name")?.as_str()?.to_string(),
        args: inner.get("args")?.as_array()?.clone(),
    })
}

pub struct FunctionHandler {
    pub id: NodeId,
    pub kind: FunctionKind,
    pub name: String,
    pub arguments: Vec<PropValue>,
    /// Registry flag resolved at compile time; `None` when the function was
    /// not registered (the lookup error then surfaces at evaluation).
    pub registered_async: Option<bool>,
}

impl FunctionHandler {
    /// Implicit first argument from the enclosing scope, if any.
    fn implicit_argument(&self, ctx: &EvalContext<'_>) -> Option<Value> {
        match self.kind {
            FunctionKind::Condition => ctx.scope().lookup("@subject"),
            FunctionKind::Transformer => ctx.scope().lookup("@value"),
            _ => None,
        }
    }

    fn assemble_args(&self, ctx: &EvalContext<'_>, mut args: Vec<Value>) -> Vec<Value> {
        if let Some(implicit) = self.implicit_argument(ctx) {
            args.insert(0, implicit);
        }
        args
    }
}

#[async_trait]
impl ThunkHandler for FunctionHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn cacheable(&self) -> bool {
        // Effects are captured per evaluation; generators may be impure.
        !matches!(self.kind, FunctionKind::Effect | FunctionKind::Generator)
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        if self.kind == FunctionKind::Effect {
            return true;
        }
        let args_async = self
            .arguments
            .iter()
            .any(|arg| arg.node_ids().iter().any(|id| flags.is_async(*id)));
        args_async || self.registered_async.unwrap_or(true)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let args = eval_props_parallel(&self.arguments, ctx, inv).await?;

        if self.kind == FunctionKind::Effect {
            return Ok(effect_descriptor(self.id, &self.name, args));
        }

        let Some(spec) = ctx.functions().get(self.kind, &self.name) else {
            return Err(HandlerError::lookup(
                self.id,
                format!("no {} function '{}' registered", self.kind, self.name),
            ));
        };

        let args = self.assemble_args(ctx, args);
        spec.call(FunctionCall::new(args)).await.map_err(|err| {
            HandlerError::evaluation(
                self.id,
                format!("{} function '{}' failed", self.kind, self.name),
            )
            .with_cause(err)
        })
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let mut args = Vec::with_capacity(self.arguments.len());
        for argument in &self.arguments {
            args.push(eval_prop_sync(argument, ctx, inv)?);
        }

        let Some(spec) = ctx.functions().get(self.kind, &self.name) else {
            return Err(HandlerError::lookup(
                self.id,
                format!("no {} function '{}' registered", self.kind, self.name),
            ));
        };

        let args = self.assemble_args(ctx, args);
        spec.call_sync(FunctionCall::new(args)).map_err(|err| {
            HandlerError::evaluation(
                self.id,
                format!("{} function '{}' failed", self.kind, self.name),
            )
            .with_cause(err)
        })
    }
}
