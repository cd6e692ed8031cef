//! Lifecycle transition handlers (load, access, action, submit) and the
//! first-match outcome handlers (redirect, throwError).
//!
//! Transitions return their structured result through the uniform handler
//! protocol as tagged JSON; the evaluator facade deserializes it back into
//! [`TransitionResult`](crate::eval::TransitionResult). Effects commit
//! strictly sequentially - an effect observes every mutation made by the
//! effects before it. LOAD and ACCESS commit as they run; ACTION returns
//! captured effects for the host to commit before block evaluation; SUBMIT
//! commits inside the branch validation selected.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::HandlerError;
use crate::eval::context::{EffectScope, EvalContext};
use crate::eval::handler::{HandlerResult, ThunkHandler};
use crate::eval::handlers::eval_prop;
use crate::eval::handlers::function::parse_effect;
use crate::eval::invoke::Invoker;
use crate::eval::scope::ScopeFrame;
use crate::eval::{CapturedEffect, ValidationFailure};
use crate::node::{FunctionKind, NodeId, PropValue, SubmitBranch};
use crate::registry::FunctionCall;
use crate::request::MutationSource;
use crate::walk::is_truthy;

/// Validation work for one field block, gathered at compile time: the
/// dependent gate and the block's validation nodes.
#[derive(Debug, Clone)]
pub struct ValidationPlan {
    pub code: Option<String>,
    pub dependent: Option<PropValue>,
    pub validations: Vec<NodeId>,
}

// ============================================================================
// SHARED PIECES
// ============================================================================

async fn gate_open(
    gate: Option<&PropValue>,
    ctx: &EvalContext<'_>,
    inv: &Invoker,
) -> bool {
    match gate {
        None => true,
        Some(gate) => eval_prop(gate, ctx, inv)
            .await
            .map(|value| is_truthy(&value))
            .unwrap_or(false),
    }
}

/// Run one captured effect against the registry, with mutations logged
/// under `source`.
pub(crate) async fn commit_captured(
    ctx: &EvalContext<'_>,
    owner: NodeId,
    effect: &CapturedEffect,
    source: MutationSource,
) -> Result<Value, HandlerError> {
    let Some(spec) = ctx.functions().get(FunctionKind::Effect, &effect.name) else {
        return Err(HandlerError::lookup(
            owner,
            format!("no effect function '{}' registered", effect.name),
        ));
    };
    let scope = EffectScope::new(ctx, source);
    spec.call(FunctionCall::with_effects(effect.args.clone(), scope))
        .await
        .map_err(|err| {
            HandlerError::evaluation(owner, format!("effect '{}' failed", effect.name))
                .with_cause(err)
        })
}

/// Invoke an effect node and commit the captured result immediately.
async fn run_effect(
    ctx: &EvalContext<'_>,
    inv: &Invoker,
    owner: NodeId,
    effect_node: NodeId,
    source: MutationSource,
) -> Result<(), HandlerError> {
    let descriptor = inv.invoke(effect_node, ctx).await?;
    let Some(captured) = parse_effect(&descriptor) else {
        return Err(HandlerError::evaluation(
            owner,
            "transition effect did not produce a captured effect",
        ));
    };
    commit_captured(ctx, owner, &captured, source).await?;
    Ok(())
}

/// Evaluate a `next` list with first-match semantics. Every entry yields
/// either null (not taken) or a tagged outcome object.
pub(crate) async fn first_outcome(
    next: &[NodeId],
    ctx: &EvalContext<'_>,
    inv: &Invoker,
) -> Result<Value, HandlerError> {
    for candidate in next {
        let outcome = inv.invoke(*candidate, ctx).await?;
        if !outcome.is_null() {
            return Ok(outcome);
        }
    }
    Ok(json!({"type": "none"}))
}

/// Evaluate validation plans; returns the failures. A falsy dependent
/// skips the whole block; submission-only validations are skipped unless
/// `submission`.
pub(crate) async fn run_validation_plans(
    plans: &[ValidationPlan],
    submission: bool,
    ctx: &EvalContext<'_>,
    inv: &Invoker,
) -> Result<Vec<ValidationFailure>, HandlerError> {
    let mut failures = Vec::new();
    for plan in plans {
        let gated = match &plan.dependent {
            Some(dependent) => eval_prop(dependent, ctx, inv)
                .await
                .map(|value| is_truthy(&value))
                .unwrap_or(false),
            None => true,
        };
        if !gated {
            continue;
        }
        for validation in &plan.validations {
            let output = inv.invoke(*validation, ctx).await?;
            let passed = output
                .get("passed")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if passed {
                continue;
            }
            let submission_only = output
                .get("submissionOnly")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if submission_only && !submission {
                continue;
            }
            let block_code = plan.code.clone().or_else(|| {
                output
                    .get("blockCode")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
            let details = match output.get("details") {
                Some(Value::Null) | None => None,
                Some(other) => Some(other.clone()),
            };
            failures.push(ValidationFailure {
                block_code,
                message: output.get("message").cloned().unwrap_or(Value::Null),
                details,
                submission_only,
            });
        }
    }
    Ok(failures)
}

// ============================================================================
// LOAD
// ============================================================================

pub struct LoadHandler {
    pub id: NodeId,
    pub effects: Vec<NodeId>,
}

#[async_trait]
impl ThunkHandler for LoadHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn cacheable(&self) -> bool {
        false
    }

    #[instrument(skip_all, fields(node = %self.id))]
    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let _scope = ctx.scope().push_guard(ScopeFrame::transition("load"));
        for effect in &self.effects {
            run_effect(ctx, inv, self.id, *effect, MutationSource::Load).await?;
        }
        Ok(json!({"type": "executed"}))
    }
}

// ============================================================================
// ACCESS
// ============================================================================

pub struct AccessHandler {
    pub id: NodeId,
    pub guards: Option<PropValue>,
    pub effects: Vec<NodeId>,
    pub next: Vec<NodeId>,
}

#[async_trait]
impl ThunkHandler for AccessHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn cacheable(&self) -> bool {
        false
    }

    #[instrument(skip_all, fields(node = %self.id))]
    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let _scope = ctx.scope().push_guard(ScopeFrame::transition("access"));

        // A failed guard skips effects and falls straight through to the
        // configured outcomes (typically a redirect or throwError).
        if gate_open(self.guards.as_ref(), ctx, inv).await {
            for effect in &self.effects {
                run_effect(ctx, inv, self.id, *effect, MutationSource::Access).await?;
            }
        }
        first_outcome(&self.next, ctx, inv).await
    }
}

// ============================================================================
// ACTION
// ============================================================================

pub struct ActionHandler {
    pub id: NodeId,
    pub when: PropValue,
    pub effects: Vec<NodeId>,
}

#[async_trait]
impl ThunkHandler for ActionHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn cacheable(&self) -> bool {
        false
    }

    #[instrument(skip_all, fields(node = %self.id))]
    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let _scope = ctx.scope().push_guard(ScopeFrame::transition("action"));

        if !gate_open(Some(&self.when), ctx, inv).await {
            return Ok(json!({"type": "none"}));
        }

        // Capture only: the host commits before block evaluation so blocks
        // observe action-authored answers.
        let mut captured = Vec::with_capacity(self.effects.len());
        for effect in &self.effects {
            let descriptor = inv.invoke(*effect, ctx).await?;
            let Some(effect) = parse_effect(&descriptor) else {
                return Err(HandlerError::evaluation(
                    self.id,
                    "action effect did not produce a captured effect",
                ));
            };
            captured.push(serde_json::to_value(effect).unwrap_or(Value::Null));
        }
        debug!(count = captured.len(), "action effects captured");
        Ok(json!({"type": "captured", "effects": captured}))
    }
}

// ============================================================================
// SUBMIT
// ============================================================================

pub struct SubmitHandler {
    pub id: NodeId,
    pub when: Option<PropValue>,
    pub guards: Option<PropValue>,
    pub validate: bool,
    pub on_valid: SubmitBranch,
    pub on_invalid: SubmitBranch,
    pub on_always: SubmitBranch,
    /// Step-level `next` list, the fallback when the chosen branch carries
    /// none of its own.
    pub step_next: Vec<NodeId>,
    pub plans: Vec<ValidationPlan>,
}

#[async_trait]
impl ThunkHandler for SubmitHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn cacheable(&self) -> bool {
        false
    }

    #[instrument(skip_all, fields(node = %self.id))]
    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let _scope = ctx.scope().push_guard(ScopeFrame::transition("submit"));

        if let Some(when) = &self.when {
            if !gate_open(Some(when), ctx, inv).await {
                return Ok(json!({"type": "none"}));
            }
        }
        if let Some(guards) = &self.guards {
            if !gate_open(Some(guards), ctx, inv).await {
                return Ok(json!({"type": "none"}));
            }
        }

        // Validation runs against the pre-effect state; the chosen branch
        // commits afterwards.
        let branch = if self.validate {
            let failures = run_validation_plans(&self.plans, true, ctx, inv).await?;
            debug!(failures = failures.len(), "submit validation");
            if failures.is_empty() {
                &self.on_valid
            } else {
                &self.on_invalid
            }
        } else {
            &self.on_always
        };

        for effect in &branch.effects {
            run_effect(ctx, inv, self.id, *effect, MutationSource::Submit).await?;
        }

        let next = if branch.next.is_empty() {
            &self.step_next
        } else {
            &branch.next
        };
        first_outcome(next, ctx, inv).await
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

pub struct RedirectHandler {
    pub id: NodeId,
    pub when: Option<PropValue>,
    pub goto: PropValue,
}

#[async_trait]
impl ThunkHandler for RedirectHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        if let Some(when) = &self.when {
            if !gate_open(Some(when), ctx, inv).await {
                return Ok(Value::Null);
            }
        }
        let goto = eval_prop(&self.goto, ctx, inv).await?;
        match goto {
            Value::String(path) => Ok(json!({"type": "redirect", "value": path})),
            _ => Ok(Value::Null),
        }
    }
}

pub struct ThrowErrorHandler {
    pub id: NodeId,
    pub when: Option<PropValue>,
    pub status: u16,
    pub message: PropValue,
}

#[async_trait]
impl ThunkHandler for ThrowErrorHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        if let Some(when) = &self.when {
            if !gate_open(Some(when), ctx, inv).await {
                return Ok(Value::Null);
            }
        }
        let message = eval_prop(&self.message, ctx, inv).await.unwrap_or(Value::Null);
        let message = match message {
            Value::String(text) => text,
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Ok(json!({"type": "error", "status": self.status, "message": message}))
    }
}
