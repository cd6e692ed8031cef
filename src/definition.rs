//! Fluent builders for form definitions.
//!
//! Builders emit the tagged-JSON definition tree - the only input format the
//! compiler accepts. Expression helpers are free functions returning
//! [`serde_json::Value`] (or a small builder that converts into one);
//! structural nodes use the builder structs at the bottom of the module.
//!
//! ```rust
//! use formflow::definition::*;
//!
//! let def = journey("/contact")
//!     .step(
//!         step("/email").block(
//!             field("text-input", "email")
//!                 .prop("label", "Email address")
//!                 .validate(validation(
//!                     self_value().not_matches(condition("isValidEmail", vec![])),
//!                     "Enter a valid email address",
//!                 )),
//!         ),
//!     )
//!     .build();
//! ```

use serde_json::{json, Map, Value};

// ============================================================================
// REFERENCES
// ============================================================================

/// Builder for reference expressions.
#[derive(Debug, Clone)]
pub struct RefBuilder {
    segments: Vec<Value>,
    base: Option<Value>,
}

impl RefBuilder {
    fn root(first: impl Into<Value>) -> Self {
        Self {
            segments: vec![first.into()],
            base: None,
        }
    }

    /// Append a key segment. Pass one key per call; only dynamically
    /// computed keys are split on dots at walk time.
    pub fn path(mut self, key: impl Into<String>) -> Self {
        self.segments.push(Value::String(key.into()));
        self
    }

    /// Append an array index segment.
    pub fn index(mut self, idx: usize) -> Self {
        self.segments.push(json!(idx));
        self
    }

    /// Append a dynamic key segment - an expression evaluated at request
    /// time whose string result names the key.
    pub fn dynamic(mut self, expr: impl Into<Value>) -> Self {
        self.segments.push(expr.into());
        self
    }

    /// Shorthand: a `test` predicate asserting this reference against a
    /// condition function.
    pub fn matches(self, condition: impl Into<Value>) -> Value {
        test(self, condition)
    }

    /// Negated [`RefBuilder::matches`].
    pub fn not_matches(self, condition: impl Into<Value>) -> Value {
        let mut def = test(self, condition);
        def["negate"] = json!(true);
        def
    }

    pub fn build(self) -> Value {
        let mut def = json!({
            "expressionType": "reference",
            "path": self.segments,
        });
        if let Some(base) = self.base {
            def["base"] = base;
        }
        def
    }
}

impl From<RefBuilder> for Value {
    fn from(builder: RefBuilder) -> Value {
        builder.build()
    }
}

/// Reference to a field answer: `answers.<code>`.
pub fn answer(code: impl Into<String>) -> RefBuilder {
    RefBuilder::root("answers").path(code)
}

/// Reference to the containing field's own answer. Resolved to the concrete
/// field code during normalization.
pub fn self_value() -> RefBuilder {
    RefBuilder::root("answers").path("@self")
}

/// Reference to a raw POST value: `post.<code>`.
pub fn post(code: impl Into<String>) -> RefBuilder {
    RefBuilder::root("post").path(code)
}

/// Reference to a query-string parameter.
pub fn query(name: impl Into<String>) -> RefBuilder {
    RefBuilder::root("query").path(name)
}

/// Reference to a URL path parameter.
pub fn params(name: impl Into<String>) -> RefBuilder {
    RefBuilder::root("params").path(name)
}

/// Reference to request data loaded by `onLoad` effects: `data.<key>`.
pub fn data(key: impl Into<String>) -> RefBuilder {
    RefBuilder::root("data").path(key)
}

/// Reference to the current iteration item (`@item` scope).
pub fn item() -> RefBuilder {
    RefBuilder::root("@item")
}

/// Reference to the current iteration index.
pub fn item_index() -> RefBuilder {
    RefBuilder::root("@index")
}

/// Reference to the current pipeline value (`@value` scope).
pub fn piped_value() -> RefBuilder {
    RefBuilder::root("@value")
}

/// Reference whose path walks into the result of an arbitrary base
/// expression.
pub fn based_on(base: impl Into<Value>, first_key: impl Into<String>) -> RefBuilder {
    let mut builder = RefBuilder::root(first_key.into());
    builder.base = Some(base.into());
    builder
}

// ============================================================================
// EXPRESSIONS
// ============================================================================

/// Format-string expression: `%1..%N` placeholders substituted with the
/// argument values.
pub fn format(template: impl Into<String>, arguments: Vec<Value>) -> Value {
    json!({
        "expressionType": "format",
        "template": template.into(),
        "arguments": arguments,
    })
}

/// Pipeline expression: thread `input` through transformer steps.
pub fn pipeline(input: impl Into<Value>, steps: Vec<Value>) -> Value {
    json!({
        "expressionType": "pipeline",
        "input": input.into(),
        "steps": steps,
    })
}

/// Conditional expression.
pub fn conditional(
    predicate: impl Into<Value>,
    then_value: impl Into<Value>,
    else_value: impl Into<Value>,
) -> Value {
    json!({
        "expressionType": "conditional",
        "predicate": predicate.into(),
        "thenValue": then_value.into(),
        "elseValue": else_value.into(),
    })
}

/// Iterate with a MAP iterator: collect the yield template's value per item.
pub fn iterate_map(input: impl Into<Value>, yield_template: impl Into<Value>) -> Value {
    json!({
        "expressionType": "iterate",
        "input": input.into(),
        "iterator": {"type": "map", "yield": yield_template.into()},
    })
}

/// Iterate with a FILTER iterator: keep items whose predicate is truthy.
pub fn iterate_filter(input: impl Into<Value>, predicate: impl Into<Value>) -> Value {
    json!({
        "expressionType": "iterate",
        "input": input.into(),
        "iterator": {"type": "filter", "predicate": predicate.into()},
    })
}

/// Iterate with a FIND iterator: first item whose predicate is truthy.
pub fn iterate_find(input: impl Into<Value>, predicate: impl Into<Value>) -> Value {
    json!({
        "expressionType": "iterate",
        "input": input.into(),
        "iterator": {"type": "find", "predicate": predicate.into()},
    })
}

fn function(kind: &str, name: impl Into<String>, arguments: Vec<Value>) -> Value {
    json!({
        "expressionType": kind,
        "name": name.into(),
        "arguments": arguments,
    })
}

/// A registered CONDITION function.
pub fn condition(name: impl Into<String>, arguments: Vec<Value>) -> Value {
    function("condition", name, arguments)
}

/// A registered TRANSFORMER function.
pub fn transformer(name: impl Into<String>, arguments: Vec<Value>) -> Value {
    function("transformer", name, arguments)
}

/// A registered EFFECT function.
pub fn effect(name: impl Into<String>, arguments: Vec<Value>) -> Value {
    function("effect", name, arguments)
}

/// A registered GENERATOR function.
pub fn generator(name: impl Into<String>, arguments: Vec<Value>) -> Value {
    function("generator", name, arguments)
}

// ============================================================================
// PREDICATES
// ============================================================================

/// `test` predicate: evaluate `subject`, feed it to `condition`.
pub fn test(subject: impl Into<Value>, condition: impl Into<Value>) -> Value {
    json!({
        "predicateType": "test",
        "subject": subject.into(),
        "condition": condition.into(),
        "negate": false,
    })
}

/// Negated [`test`].
pub fn test_not(subject: impl Into<Value>, condition: impl Into<Value>) -> Value {
    json!({
        "predicateType": "test",
        "subject": subject.into(),
        "condition": condition.into(),
        "negate": true,
    })
}

/// AND over operands (vacuously true when empty).
pub fn all_of(operands: Vec<Value>) -> Value {
    json!({"predicateType": "and", "operands": operands})
}

/// OR over operands (false when empty).
pub fn any_of(operands: Vec<Value>) -> Value {
    json!({"predicateType": "or", "operands": operands})
}

/// XOR over operands: true iff exactly one is truthy.
pub fn one_of(operands: Vec<Value>) -> Value {
    json!({"predicateType": "xor", "operands": operands})
}

/// Logical negation.
pub fn not(operand: impl Into<Value>) -> Value {
    json!({"predicateType": "not", "operand": operand.into()})
}

// ============================================================================
// NAVIGATION, VALIDATION, OUTCOMES
// ============================================================================

/// Builder for `next` expressions.
#[derive(Debug, Clone)]
pub struct NextBuilder {
    when: Option<Value>,
    goto: Value,
}

impl NextBuilder {
    pub fn when(mut self, predicate: impl Into<Value>) -> Self {
        self.when = Some(predicate.into());
        self
    }

    pub fn build(self) -> Value {
        let mut def = json!({"expressionType": "next", "goto": self.goto});
        if let Some(when) = self.when {
            def["when"] = when;
        }
        def
    }
}

impl From<NextBuilder> for Value {
    fn from(builder: NextBuilder) -> Value {
        builder.build()
    }
}

/// Navigation target: a literal path, a computed expression, or a redirect
/// outcome.
pub fn next(goto: impl Into<Value>) -> NextBuilder {
    NextBuilder {
        when: None,
        goto: goto.into(),
    }
}

/// Builder for validation expressions. The validation FAILS when `when` is
/// truthy.
#[derive(Debug, Clone)]
pub struct ValidationBuilder {
    def: Value,
}

impl ValidationBuilder {
    pub fn submission_only(mut self) -> Self {
        self.def["submissionOnly"] = json!(true);
        self
    }

    pub fn details(mut self, details: impl Into<Value>) -> Self {
        self.def["details"] = details.into();
        self
    }

    pub fn build(self) -> Value {
        self.def
    }
}

impl From<ValidationBuilder> for Value {
    fn from(builder: ValidationBuilder) -> Value {
        builder.build()
    }
}

pub fn validation(when: impl Into<Value>, message: impl Into<Value>) -> ValidationBuilder {
    ValidationBuilder {
        def: json!({
            "expressionType": "validation",
            "when": when.into(),
            "message": message.into(),
        }),
    }
}

/// Builder for redirect outcomes.
#[derive(Debug, Clone)]
pub struct RedirectBuilder {
    def: Value,
}

impl RedirectBuilder {
    pub fn when(mut self, predicate: impl Into<Value>) -> Self {
        self.def["when"] = predicate.into();
        self
    }

    pub fn build(self) -> Value {
        self.def
    }
}

impl From<RedirectBuilder> for Value {
    fn from(builder: RedirectBuilder) -> Value {
        builder.build()
    }
}

pub fn redirect_to(goto: impl Into<Value>) -> RedirectBuilder {
    RedirectBuilder {
        def: json!({"outcomeType": "redirect", "goto": goto.into()}),
    }
}

/// Builder for throwError outcomes.
#[derive(Debug, Clone)]
pub struct ThrowErrorBuilder {
    def: Value,
}

impl ThrowErrorBuilder {
    pub fn when(mut self, predicate: impl Into<Value>) -> Self {
        self.def["when"] = predicate.into();
        self
    }

    pub fn build(self) -> Value {
        self.def
    }
}

impl From<ThrowErrorBuilder> for Value {
    fn from(builder: ThrowErrorBuilder) -> Value {
        builder.build()
    }
}

pub fn throw_error(status: u16, message: impl Into<Value>) -> ThrowErrorBuilder {
    ThrowErrorBuilder {
        def: json!({"outcomeType": "throwError", "status": status, "message": message.into()}),
    }
}

// ============================================================================
// TRANSITIONS
// ============================================================================

/// LOAD transition: effects committed as they run.
pub fn on_load(effects: Vec<Value>) -> Value {
    json!({"transitionType": "load", "effects": effects})
}

/// Builder for ACCESS transitions.
#[derive(Debug, Clone)]
pub struct AccessBuilder {
    guards: Option<Value>,
    effects: Vec<Value>,
    next: Vec<Value>,
}

impl AccessBuilder {
    pub fn guards(mut self, predicate: impl Into<Value>) -> Self {
        self.guards = Some(predicate.into());
        self
    }

    pub fn effect(mut self, effect: impl Into<Value>) -> Self {
        self.effects.push(effect.into());
        self
    }

    pub fn next(mut self, outcome: impl Into<Value>) -> Self {
        self.next.push(outcome.into());
        self
    }

    pub fn build(self) -> Value {
        let mut def = json!({
            "transitionType": "access",
            "effects": self.effects,
            "next": self.next,
        });
        if let Some(guards) = self.guards {
            def["guards"] = guards;
        }
        def
    }
}

impl From<AccessBuilder> for Value {
    fn from(builder: AccessBuilder) -> Value {
        builder.build()
    }
}

pub fn on_access() -> AccessBuilder {
    AccessBuilder {
        guards: None,
        effects: Vec::new(),
        next: Vec::new(),
    }
}

/// ACTION transition: effects captured, committed before block evaluation.
pub fn on_action(when: impl Into<Value>, effects: Vec<Value>) -> Value {
    json!({
        "transitionType": "action",
        "when": when.into(),
        "effects": effects,
    })
}

/// Builder for one SUBMIT branch (`onValid` / `onInvalid` / `onAlways`).
#[derive(Debug, Clone, Default)]
pub struct BranchBuilder {
    effects: Vec<Value>,
    next: Vec<Value>,
}

impl BranchBuilder {
    pub fn effect(mut self, effect: impl Into<Value>) -> Self {
        self.effects.push(effect.into());
        self
    }

    pub fn next(mut self, target: impl Into<Value>) -> Self {
        self.next.push(target.into());
        self
    }

    fn build(self) -> Value {
        json!({"effects": self.effects, "next": self.next})
    }
}

pub fn branch() -> BranchBuilder {
    BranchBuilder::default()
}

/// Builder for SUBMIT transitions.
#[derive(Debug, Clone)]
pub struct SubmitBuilder {
    def: Value,
}

impl SubmitBuilder {
    pub fn when(mut self, predicate: impl Into<Value>) -> Self {
        self.def["when"] = predicate.into();
        self
    }

    pub fn guards(mut self, predicate: impl Into<Value>) -> Self {
        self.def["guards"] = predicate.into();
        self
    }

    /// Skip validation: the `onAlways` branch runs instead of
    /// `onValid`/`onInvalid`.
    pub fn no_validate(mut self) -> Self {
        self.def["validate"] = json!(false);
        self
    }

    pub fn on_valid(mut self, branch: BranchBuilder) -> Self {
        self.def["onValid"] = branch.build();
        self
    }

    pub fn on_invalid(mut self, branch: BranchBuilder) -> Self {
        self.def["onInvalid"] = branch.build();
        self
    }

    pub fn on_always(mut self, branch: BranchBuilder) -> Self {
        self.def["onAlways"] = branch.build();
        self
    }

    pub fn build(self) -> Value {
        self.def
    }
}

impl From<SubmitBuilder> for Value {
    fn from(builder: SubmitBuilder) -> Value {
        builder.build()
    }
}

pub fn on_submission() -> SubmitBuilder {
    SubmitBuilder {
        def: json!({"transitionType": "submit", "validate": true}),
    }
}

// ============================================================================
// STRUCTURAL BUILDERS
// ============================================================================

/// Builder for field blocks.
#[derive(Debug, Clone)]
pub struct FieldBuilder {
    def: Map<String, Value>,
    validate: Vec<Value>,
    formatters: Vec<Value>,
    blocks: Vec<Value>,
}

impl FieldBuilder {
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.def.insert("defaultValue".into(), value.into());
        self
    }

    /// Append a transformer applied to the POSTed value at submission.
    pub fn formatter(mut self, transformer: impl Into<Value>) -> Self {
        self.formatters.push(transformer.into());
        self
    }

    pub fn validate(mut self, validation: impl Into<Value>) -> Self {
        self.validate.push(validation.into());
        self
    }

    pub fn dependent(mut self, predicate: impl Into<Value>) -> Self {
        self.def.insert("dependent".into(), predicate.into());
        self
    }

    /// Accept multiple POSTed values for this field.
    pub fn multiple(mut self) -> Self {
        self.def.insert("multiple".into(), json!(true));
        self
    }

    pub fn block(mut self, child: impl Into<Value>) -> Self {
        self.blocks.push(child.into());
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.def.insert(key.into(), value.into());
        self
    }

    pub fn build(mut self) -> Value {
        if !self.validate.is_empty() {
            self.def.insert("validate".into(), json!(self.validate));
        }
        if !self.formatters.is_empty() {
            self.def.insert("formatters".into(), json!(self.formatters));
        }
        if !self.blocks.is_empty() {
            self.def.insert("blocks".into(), json!(self.blocks));
        }
        Value::Object(self.def)
    }
}

impl From<FieldBuilder> for Value {
    fn from(builder: FieldBuilder) -> Value {
        builder.build()
    }
}

pub fn field(variant: impl Into<String>, code: impl Into<String>) -> FieldBuilder {
    let mut def = Map::new();
    def.insert("type".into(), json!("block"));
    def.insert("blockType".into(), json!("field"));
    def.insert("variant".into(), json!(variant.into()));
    def.insert("code".into(), json!(code.into()));
    FieldBuilder {
        def,
        validate: Vec::new(),
        formatters: Vec::new(),
        blocks: Vec::new(),
    }
}

/// Builder for basic (non-field) blocks.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    def: Map<String, Value>,
    blocks: Vec<Value>,
}

impl BlockBuilder {
    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.def.insert(key.into(), value.into());
        self
    }

    pub fn block(mut self, child: impl Into<Value>) -> Self {
        self.blocks.push(child.into());
        self
    }

    pub fn build(mut self) -> Value {
        if !self.blocks.is_empty() {
            self.def.insert("blocks".into(), json!(self.blocks));
        }
        Value::Object(self.def)
    }
}

impl From<BlockBuilder> for Value {
    fn from(builder: BlockBuilder) -> Value {
        builder.build()
    }
}

pub fn block(variant: impl Into<String>) -> BlockBuilder {
    let mut def = Map::new();
    def.insert("type".into(), json!("block"));
    def.insert("blockType".into(), json!("basic"));
    def.insert("variant".into(), json!(variant.into()));
    BlockBuilder {
        def,
        blocks: Vec::new(),
    }
}

/// Builder for steps.
#[derive(Debug, Clone)]
pub struct StepBuilder {
    def: Map<String, Value>,
    blocks: Vec<Value>,
    next: Vec<Value>,
    on_access: Vec<Value>,
    on_action: Vec<Value>,
    on_submission: Vec<Value>,
}

impl StepBuilder {
    pub fn block(mut self, block: impl Into<Value>) -> Self {
        self.blocks.push(block.into());
        self
    }

    pub fn next(mut self, next: impl Into<Value>) -> Self {
        self.next.push(next.into());
        self
    }

    pub fn on_load(mut self, transition: impl Into<Value>) -> Self {
        self.def.insert("onLoad".into(), transition.into());
        self
    }

    pub fn on_access(mut self, transition: impl Into<Value>) -> Self {
        self.on_access.push(transition.into());
        self
    }

    pub fn on_action(mut self, transition: impl Into<Value>) -> Self {
        self.on_action.push(transition.into());
        self
    }

    pub fn on_submission(mut self, transition: impl Into<Value>) -> Self {
        self.on_submission.push(transition.into());
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.def.insert(key.into(), value.into());
        self
    }

    pub fn build(mut self) -> Value {
        self.def.insert("blocks".into(), json!(self.blocks));
        if !self.next.is_empty() {
            self.def.insert("next".into(), json!(self.next));
        }
        if !self.on_access.is_empty() {
            self.def.insert("onAccess".into(), json!(self.on_access));
        }
        if !self.on_action.is_empty() {
            self.def.insert("onAction".into(), json!(self.on_action));
        }
        if !self.on_submission.is_empty() {
            self.def
                .insert("onSubmission".into(), json!(self.on_submission));
        }
        Value::Object(self.def)
    }
}

impl From<StepBuilder> for Value {
    fn from(builder: StepBuilder) -> Value {
        builder.build()
    }
}

pub fn step(path: impl Into<String>) -> StepBuilder {
    let mut def = Map::new();
    def.insert("type".into(), json!("step"));
    def.insert("path".into(), json!(path.into()));
    StepBuilder {
        def,
        blocks: Vec::new(),
        next: Vec::new(),
        on_access: Vec::new(),
        on_action: Vec::new(),
        on_submission: Vec::new(),
    }
}

/// Builder for journeys.
#[derive(Debug, Clone)]
pub struct JourneyBuilder {
    def: Map<String, Value>,
    steps: Vec<Value>,
    on_access: Vec<Value>,
}

impl JourneyBuilder {
    pub fn title(mut self, title: impl Into<Value>) -> Self {
        self.def.insert("title".into(), title.into());
        self
    }

    pub fn step(mut self, step: impl Into<Value>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn on_load(mut self, transition: impl Into<Value>) -> Self {
        self.def.insert("onLoad".into(), transition.into());
        self
    }

    pub fn on_access(mut self, transition: impl Into<Value>) -> Self {
        self.on_access.push(transition.into());
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.def.insert(key.into(), value.into());
        self
    }

    pub fn build(mut self) -> Value {
        self.def.insert("steps".into(), json!(self.steps));
        if !self.on_access.is_empty() {
            self.def.insert("onAccess".into(), json!(self.on_access));
        }
        Value::Object(self.def)
    }
}

impl From<JourneyBuilder> for Value {
    fn from(builder: JourneyBuilder) -> Value {
        builder.build()
    }
}

pub fn journey(path: impl Into<String>) -> JourneyBuilder {
    let mut def = Map::new();
    def.insert("type".into(), json!("journey"));
    def.insert("path".into(), json!(path.into()));
    JourneyBuilder {
        def,
        steps: Vec::new(),
        on_access: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_builders_emit_tagged_paths() {
        let def = answer("email").build();
        assert_eq!(
            def,
            json!({"expressionType": "reference", "path": ["answers", "email"]})
        );

        let def = data("items").index(0).path("name").build();
        assert_eq!(def["path"], json!(["data", "items", 0, "name"]));
    }

    #[test]
    fn self_reference_uses_placeholder_token() {
        let def = self_value().build();
        assert_eq!(def["path"], json!(["answers", "@self"]));
    }

    #[test]
    fn matches_builds_a_test_predicate() {
        let def = self_value().not_matches(condition("isValidEmail", vec![]));
        assert_eq!(def["predicateType"], "test");
        assert_eq!(def["negate"], json!(true));
        assert_eq!(def["condition"]["name"], "isValidEmail");
    }

    #[test]
    fn submit_builder_defaults_to_validating() {
        let def = on_submission()
            .on_valid(branch().next(next("/done")))
            .build();
        assert_eq!(def["validate"], json!(true));
        assert_eq!(def["onValid"]["next"][0]["goto"], "/done");
    }

    #[test]
    fn journey_tree_shape() {
        let def = journey("/j")
            .step(step("/a").block(field("text-input", "name")))
            .build();

        assert_eq!(def["type"], "journey");
        assert_eq!(def["steps"][0]["type"], "step");
        assert_eq!(def["steps"][0]["blocks"][0]["blockType"], "field");
        assert_eq!(def["steps"][0]["blocks"][0]["code"], "name");
    }
}
