//! Per-request evaluation: the context, the invocation adapter, the handler
//! catalogue, and the `Evaluator` facade the host drives.
//!
//! A request's lifecycle through the facade:
//!
//! 1. [`Evaluator::run_load`] - commit load effects (populate `data`).
//! 2. [`Evaluator::run_access`] - guards; may redirect or error.
//! 3. [`Evaluator::run_action`] - capture action effects, then
//!    [`Evaluator::commit_effects`] before block evaluation.
//! 4. On POST: [`Evaluator::run_submit`] - validation, branch effects, and
//!    the first-match navigation outcome.
//! 5. [`Evaluator::evaluate_step`] - the evaluated view model to render.

pub mod cache;
pub mod context;
pub mod handler;
pub mod handlers;
pub mod invoke;
pub mod overlay;
pub mod scope;

pub use cache::ThunkCacheManager;
pub use context::{EffectScope, EffectTarget, EvalContext};
pub use handler::{AsyncFlagMap, AsyncFlags, HandlerMap, HandlerResult, ThunkHandler};
pub use invoke::Invoker;
pub use overlay::{RuntimeLayer, RuntimeOverlay, TemplateShape};
pub use scope::{ScopeFrame, ScopeStack};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::compile::CompiledForm;
use crate::error::HandlerError;
use crate::eval::handlers::transition::{commit_captured, run_validation_plans};
use crate::limits::EngineLimits;
use crate::node::NodeId;
use crate::request::{AnswerMap, MutationSource, RequestAdapter};

/// An evaluated block's view model (JSON shape consumed by the component
/// registry's renderers).
pub type EvaluatedBlock = Value;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// An effect whose arguments have been evaluated but whose body has not
/// run. Committing looks the function up again and executes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEffect {
    /// Display id of the function node that captured this effect.
    pub node: String,
    pub name: String,
    pub args: Vec<Value>,
}

/// The structured result a lifecycle transition hands back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransitionResult {
    Executed,
    Captured { effects: Vec<CapturedEffect> },
    Redirect { value: String },
    Error { status: u16, message: String },
    None,
}

impl TransitionResult {
    pub fn is_none(&self) -> bool {
        matches!(self, TransitionResult::None)
    }
}

/// One failed validation, grouped for display by block code.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub block_code: Option<String>,
    pub message: Value,
    pub details: Option<Value>,
    pub submission_only: bool,
}

/// All failures collected for a render or submission.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub failures: Vec<ValidationFailure>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures belonging to one block.
    pub fn for_block(&self, code: &str) -> Vec<&ValidationFailure> {
        self.failures
            .iter()
            .filter(|failure| failure.block_code.as_deref() == Some(code))
            .collect()
    }
}

/// The outcome of a SUBMIT run: the navigation result plus the validation
/// report backing it.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub result: TransitionResult,
    pub report: ValidationReport,
}

/// The evaluated view model of the target step.
#[derive(Debug, Clone)]
pub struct EvaluatedStep(Value);

impl EvaluatedStep {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn path(&self) -> Option<&str> {
        self.0.get("path").and_then(Value::as_str)
    }

    pub fn blocks(&self) -> &[Value] {
        self.0
            .get("blocks")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The first evaluated block carrying `code`.
    pub fn field(&self, code: &str) -> Option<&Value> {
        self.blocks()
            .iter()
            .find(|block| block["properties"]["code"].as_str() == Some(code))
    }
}

// ============================================================================
// EVALUATOR
// ============================================================================

fn parse_transition(value: &Value, id: NodeId) -> Result<TransitionResult, HandlerError> {
    serde_json::from_value(value.clone()).map_err(|err| {
        HandlerError::evaluation(id, "transition produced an invalid result")
            .with_cause(err.into())
    })
}

/// Per-request facade over the compiled form.
pub struct Evaluator<'f> {
    ctx: EvalContext<'f>,
    invoker: Invoker,
}

impl<'f> Evaluator<'f> {
    pub fn new(form: &'f CompiledForm, request: RequestAdapter) -> Self {
        Self::with_limits(form, request, EngineLimits::default())
    }

    pub fn with_limits(
        form: &'f CompiledForm,
        request: RequestAdapter,
        limits: EngineLimits,
    ) -> Self {
        Self {
            ctx: EvalContext::new(form, request, limits),
            invoker: Invoker::new(),
        }
    }

    pub fn context(&self) -> &EvalContext<'f> {
        &self.ctx
    }

    /// Run the journey's and target step's LOAD transitions; their effects
    /// commit as they run.
    #[instrument(skip(self))]
    pub async fn run_load(&self) -> Result<TransitionResult, HandlerError> {
        let mut executed = false;
        for id in self.ctx.form().load_transitions() {
            let value = self.invoker.invoke(*id, &self.ctx).await?;
            if parse_transition(&value, *id)? == TransitionResult::Executed {
                executed = true;
            }
        }
        Ok(if executed {
            TransitionResult::Executed
        } else {
            TransitionResult::None
        })
    }

    /// Run ACCESS transitions (journey first), stopping at the first
    /// non-none outcome.
    #[instrument(skip(self))]
    pub async fn run_access(&self) -> Result<TransitionResult, HandlerError> {
        self.first_result(self.ctx.form().access_transitions()).await
    }

    /// Run ACTION transitions, returning every captured effect. The host
    /// commits them (see [`Evaluator::commit_effects`]) before evaluating
    /// blocks, so blocks observe action-authored answers.
    #[instrument(skip(self))]
    pub async fn run_action(&self) -> Result<TransitionResult, HandlerError> {
        let mut captured = Vec::new();
        for id in self.ctx.form().action_transitions() {
            let value = self.invoker.invoke(*id, &self.ctx).await?;
            if let TransitionResult::Captured { effects } = parse_transition(&value, *id)? {
                captured.extend(effects);
            }
        }
        Ok(if captured.is_empty() {
            TransitionResult::None
        } else {
            TransitionResult::Captured { effects: captured }
        })
    }

    /// Commit previously captured effects under `source`.
    pub async fn commit_effects(
        &self,
        effects: &[CapturedEffect],
        source: MutationSource,
    ) -> Result<(), HandlerError> {
        let owner = self.ctx.form().target_step();
        for effect in effects {
            commit_captured(&self.ctx, owner, effect, source).await?;
        }
        Ok(())
    }

    /// Convenience wrapper: run ACTION transitions and commit whatever they
    /// captured.
    pub async fn run_action_and_commit(&self) -> Result<(), HandlerError> {
        if let TransitionResult::Captured { effects } = self.run_action().await? {
            self.commit_effects(&effects, MutationSource::Action).await?;
        }
        Ok(())
    }

    /// Run SUBMIT transitions, stopping at the first non-none outcome, and
    /// gather the submission validation report.
    #[instrument(skip(self))]
    pub async fn run_submit(&self) -> Result<SubmitOutcome, HandlerError> {
        let result = self.first_result(self.ctx.form().submit_transitions()).await?;
        let report = self.run_validations(true).await?;
        Ok(SubmitOutcome { result, report })
    }

    /// Evaluate the in-scope validations. Render-time calls pass
    /// `submission = false` to skip submission-only rules.
    pub async fn run_validations(
        &self,
        submission: bool,
    ) -> Result<ValidationReport, HandlerError> {
        let failures = run_validation_plans(
            self.ctx.form().validation_plans(),
            submission,
            &self.ctx,
            &self.invoker,
        )
        .await?;
        Ok(ValidationReport { failures })
    }

    /// Evaluate the target step into its view model.
    #[instrument(skip(self))]
    pub async fn evaluate_step(&self) -> Result<EvaluatedStep, HandlerError> {
        let value = self
            .invoker
            .invoke(self.ctx.form().target_step(), &self.ctx)
            .await?;
        Ok(EvaluatedStep(value))
    }

    /// Evaluate the journey's own (ancestor-visible) properties.
    pub async fn evaluate_journey(&self) -> Result<Value, HandlerError> {
        self.invoker
            .invoke(self.ctx.form().journey(), &self.ctx)
            .await
    }

    /// Snapshot of the answers map for the embedder to persist.
    pub fn answers(&self) -> AnswerMap {
        self.ctx.answers_snapshot()
    }

    /// Security violations recorded during evaluation.
    pub fn security_errors(&self) -> Vec<HandlerError> {
        self.ctx.security_errors()
    }

    async fn first_result(&self, ids: &[NodeId]) -> Result<TransitionResult, HandlerError> {
        for id in ids {
            let value = self.invoker.invoke(*id, &self.ctx).await?;
            let result = parse_transition(&value, *id)?;
            if !result.is_none() {
                return Ok(result);
            }
        }
        Ok(TransitionResult::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transition_results_roundtrip_through_json() {
        let cases = vec![
            (json!({"type": "executed"}), TransitionResult::Executed),
            (json!({"type": "none"}), TransitionResult::None),
            (
                json!({"type": "redirect", "value": "/next"}),
                TransitionResult::Redirect {
                    value: "/next".into(),
                },
            ),
            (
                json!({"type": "error", "status": 404, "message": "gone"}),
                TransitionResult::Error {
                    status: 404,
                    message: "gone".into(),
                },
            ),
        ];
        for (json, expected) in cases {
            let parsed: TransitionResult = serde_json::from_value(json.clone()).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(serde_json::to_value(&parsed).unwrap(), json);
        }
    }

    #[test]
    fn captured_effects_roundtrip() {
        let json = json!({
            "type": "captured",
            "effects": [{"node": "compile_ast:9", "name": "lookupPostcode", "args": ["SW1A 2AA"]}],
        });
        let parsed: TransitionResult = serde_json::from_value(json).unwrap();
        match &parsed {
            TransitionResult::Captured { effects } => {
                assert_eq!(effects[0].name, "lookupPostcode");
                assert_eq!(effects[0].args, vec![json!("SW1A 2AA")]);
            }
            other => panic!("expected captured, got {other:?}"),
        }
    }

    #[test]
    fn report_groups_by_block() {
        let report = ValidationReport {
            failures: vec![
                ValidationFailure {
                    block_code: Some("email".into()),
                    message: json!("Enter a valid email address"),
                    details: None,
                    submission_only: false,
                },
                ValidationFailure {
                    block_code: Some("name".into()),
                    message: json!("Enter your name"),
                    details: None,
                    submission_only: false,
                },
            ],
        };

        assert!(!report.is_valid());
        assert_eq!(report.for_block("email").len(), 1);
        assert_eq!(report.for_block("missing").len(), 0);
    }
}
