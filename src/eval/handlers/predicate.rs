//! Predicate handlers: test, and, or, xor, not.
//!
//! AND/OR short-circuit left-to-right and treat a failed operand as falsy;
//! XOR always evaluates every operand; empty AND is vacuously true, empty
//! OR false.

use async_trait::async_trait;
use serde_json::Value;

use crate::eval::context::EvalContext;
use crate::eval::handler::{AsyncFlags, HandlerResult, ThunkHandler};
use crate::eval::handlers::{eval_prop, eval_prop_sync, props_are_async, prop_is_async};
use crate::eval::invoke::Invoker;
use crate::eval::scope::ScopeFrame;
use crate::node::{NodeId, PropValue};
use crate::walk::is_truthy;

fn truthy_or_false(result: HandlerResult) -> bool {
    result.map(|value| is_truthy(&value)).unwrap_or(false)
}

// ============================================================================
// TEST
// ============================================================================

/// Evaluates the subject, then the condition function with the subject as
/// its implicit first argument (passed through the `@subject` scope).
pub struct TestHandler {
    pub id: NodeId,
    pub subject: PropValue,
    pub condition: NodeId,
    pub negate: bool,
}

#[async_trait]
impl ThunkHandler for TestHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        prop_is_async(&self.subject, flags) || flags.is_async(self.condition)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let subject = eval_prop(&self.subject, ctx, inv).await?;
        let _scope = ctx.scope().push_guard(
            ScopeFrame::new()
                .set("@subject", subject)
                .set("@type", Value::String("test".into())),
        );
        let held = inv.invoke(self.condition, ctx).await?;
        Ok(Value::Bool(is_truthy(&held) != self.negate))
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let subject = eval_prop_sync(&self.subject, ctx, inv)?;
        let _scope = ctx.scope().push_guard(
            ScopeFrame::new()
                .set("@subject", subject)
                .set("@type", Value::String("test".into())),
        );
        let held = inv.invoke_sync(self.condition, ctx)?;
        Ok(Value::Bool(is_truthy(&held) != self.negate))
    }
}

// ============================================================================
// AND / OR
// ============================================================================

pub struct AndHandler {
    pub id: NodeId,
    pub operands: Vec<PropValue>,
}

#[async_trait]
impl ThunkHandler for AndHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        props_are_async(&self.operands, flags)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        for operand in &self.operands {
            if !truthy_or_false(eval_prop(operand, ctx, inv).await) {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        for operand in &self.operands {
            if !truthy_or_false(eval_prop_sync(operand, ctx, inv)) {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    }
}

pub struct OrHandler {
    pub id: NodeId,
    pub operands: Vec<PropValue>,
}

#[async_trait]
impl ThunkHandler for OrHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        props_are_async(&self.operands, flags)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        for operand in &self.operands {
            if truthy_or_false(eval_prop(operand, ctx, inv).await) {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        for operand in &self.operands {
            if truthy_or_false(eval_prop_sync(operand, ctx, inv)) {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    }
}

// ============================================================================
// XOR / NOT
// ============================================================================

pub struct XorHandler {
    pub id: NodeId,
    pub operands: Vec<PropValue>,
}

#[async_trait]
impl ThunkHandler for XorHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        props_are_async(&self.operands, flags)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        // No short-circuit: every operand is evaluated, concurrently.
        let futures: Vec<_> = self
            .operands
            .iter()
            .map(|operand| eval_prop(operand, ctx, inv))
            .collect();
        let results = futures::future::join_all(futures).await;
        let truthy = results.into_iter().filter(|r| truthy_or_false(r.clone())).count();
        Ok(Value::Bool(truthy == 1))
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let mut truthy = 0;
        for operand in &self.operands {
            if truthy_or_false(eval_prop_sync(operand, ctx, inv)) {
                truthy += 1;
            }
        }
        Ok(Value::Bool(truthy == 1))
    }
}

pub struct NotHandler {
    pub id: NodeId,
    pub operand: PropValue,
}

#[async_trait]
impl ThunkHandler for NotHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        prop_is_async(&self.operand, flags)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let value = truthy_or_false(eval_prop(&self.operand, ctx, inv).await);
        Ok(Value::Bool(!value))
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let value = truthy_or_false(eval_prop_sync(&self.operand, ctx, inv));
        Ok(Value::Bool(!value))
    }
}
