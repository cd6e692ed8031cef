//! End-to-end engine scenarios: compile a journey, drive a request through
//! the lifecycle, and inspect the evaluated view model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use formflow::definition::*;
use formflow::{
    Evaluator, FormCompiler, FunctionCall, FunctionKind, FunctionRegistry, FunctionSpec,
    MutationSource, NativeFunction, RequestAdapter, TransitionResult,
};

/// Pretend address service: resolves a postcode to a fixed first line.
struct LookupPostcode;

#[async_trait]
impl NativeFunction for LookupPostcode {
    async fn call(&self, call: FunctionCall<'_>) -> anyhow::Result<Value> {
        let effects = call.effects.as_ref().expect("effect scope");
        effects.set_answer("addressLine1", json!("10 Downing St"));
        Ok(Value::Null)
    }
}

fn registry() -> Arc<FunctionRegistry> {
    // RUST_LOG=formflow=trace surfaces the engine's spans when debugging.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let registry = FunctionRegistry::new();
    registry
        .register_many(vec![
            FunctionSpec::sync(FunctionKind::Condition, "equals", |call| {
                Ok(json!(call.arg(0) == call.arg(1)))
            }),
            FunctionSpec::sync(FunctionKind::Condition, "isValidEmail", |call| {
                let valid = call
                    .arg(0)
                    .as_str()
                    .map(|s| s.contains('@') && s.contains('.'))
                    .unwrap_or(false);
                Ok(json!(valid))
            }),
            FunctionSpec::sync(FunctionKind::Transformer, "trim", |call| {
                Ok(match call.arg(0) {
                    Value::String(s) => json!(s.trim()),
                    other => other.clone(),
                })
            }),
            FunctionSpec::sync(FunctionKind::Transformer, "toTitleCase", |call| {
                Ok(match call.arg(0) {
                    Value::String(s) => {
                        let titled: Vec<String> = s
                            .split_whitespace()
                            .map(|word| {
                                let mut chars = word.chars();
                                match chars.next() {
                                    Some(first) => {
                                        first.to_uppercase().collect::<String>() + chars.as_str()
                                    }
                                    None => String::new(),
                                }
                            })
                            .collect();
                        json!(titled.join(" "))
                    }
                    other => other.clone(),
                })
            }),
            FunctionSpec::asynchronous(FunctionKind::Effect, "lookupPostcode", LookupPostcode),
            FunctionSpec::sync(FunctionKind::Effect, "seedItems", |call| {
                let effects = call.effects.as_ref().expect("effect scope");
                effects.set_data(
                    "items",
                    json!([
                        {"id": "a", "name": "A"},
                        {"id": "b", "name": "B"},
                    ]),
                );
                Ok(Value::Null)
            }),
        ])
        .unwrap();
    Arc::new(registry)
}

// ----------------------------------------------------------------------------
// Scenario: simple text field validation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn invalid_email_fails_submission() {
    let def = journey("/contact")
        .step(
            step("/email")
                .block(
                    field("text-input", "email")
                        .prop("label", "Email address")
                        .validate(validation(
                            self_value().not_matches(condition("isValidEmail", vec![])),
                            "Enter a valid email address",
                        )),
                )
                .on_submission(
                    on_submission()
                        .on_valid(branch().next(next("/done")))
                        .on_invalid(branch().next(next("/email"))),
                ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/email").unwrap();
    let request = RequestAdapter::new().with_post("email", json!("x"));
    let evaluator = Evaluator::new(&form, request);

    let outcome = evaluator.run_submit().await.unwrap();
    assert_eq!(
        outcome.result,
        TransitionResult::Redirect {
            value: "/email".into()
        }
    );
    assert!(!outcome.report.is_valid());
    let failures = outcome.report.for_block("email");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].message, json!("Enter a valid email address"));

    // The evaluated block carries the failed validation for rendering.
    let view = evaluator.evaluate_step().await.unwrap();
    let block = view.field("email").unwrap();
    assert_eq!(
        block["properties"]["validate"][0]["passed"],
        json!(false)
    );
    assert_eq!(block["properties"]["value"], json!("x"));
}

#[tokio::test]
async fn valid_email_takes_the_valid_branch() {
    let def = journey("/contact")
        .step(
            step("/email")
                .block(field("text-input", "email").validate(validation(
                    self_value().not_matches(condition("isValidEmail", vec![])),
                    "Enter a valid email address",
                )))
                .on_submission(
                    on_submission()
                        .on_valid(branch().next(next("/done")))
                        .on_invalid(branch().next(next("/email"))),
                ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/email").unwrap();
    let request = RequestAdapter::new().with_post("email", json!("x@y.co"));
    let evaluator = Evaluator::new(&form, request);

    let outcome = evaluator.run_submit().await.unwrap();
    assert_eq!(
        outcome.result,
        TransitionResult::Redirect {
            value: "/done".into()
        }
    );
    assert!(outcome.report.is_valid());
}

// ----------------------------------------------------------------------------
// Scenario: action-before-render, and ACTION precedence over POST
// ----------------------------------------------------------------------------

#[tokio::test]
async fn action_effect_writes_answers_before_render() {
    let def = journey("/j")
        .step(
            step("/address")
                .block(field("text-input", "postcode"))
                .block(field("text-input", "addressLine1"))
                .on_action(on_action(
                    test(post("action"), condition("equals", vec![json!("lookup")])),
                    vec![effect("lookupPostcode", vec![post("postcode").build()])],
                )),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/address").unwrap();
    // POST carries a stale addressLine1; the action-authored value must win.
    let request = RequestAdapter::new()
        .with_post("action", json!("lookup"))
        .with_post("postcode", json!("SW1A 2AA"))
        .with_post("addressLine1", json!("999 Wrong St"));
    let evaluator = Evaluator::new(&form, request);

    evaluator.run_action_and_commit().await.unwrap();

    let view = evaluator.evaluate_step().await.unwrap();
    let line1 = view.field("addressLine1").unwrap();
    assert_eq!(line1["properties"]["value"], json!("10 Downing St"));

    let answers = evaluator.answers();
    let entry = &answers["addressLine1"];
    assert_eq!(entry.current, json!("10 Downing St"));
    assert_eq!(entry.mutations.len(), 1);
    assert_eq!(entry.mutations[0].source, MutationSource::Action);
}

#[tokio::test]
async fn action_gated_off_captures_nothing() {
    let def = journey("/j")
        .step(
            step("/address")
                .block(field("text-input", "postcode"))
                .on_action(on_action(
                    test(post("action"), condition("equals", vec![json!("lookup")])),
                    vec![effect("lookupPostcode", vec![post("postcode").build()])],
                )),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/address").unwrap();
    let request = RequestAdapter::new().with_post("action", json!("save"));
    let evaluator = Evaluator::new(&form, request);

    let result = evaluator.run_action().await.unwrap();
    assert_eq!(result, TransitionResult::None);
}

// ----------------------------------------------------------------------------
// Scenario: branching next
// ----------------------------------------------------------------------------

#[tokio::test]
async fn submit_routes_by_answer() {
    let def = journey("/j")
        .step(
            step("/summary")
                .block(field("radios", "employment_status"))
                .next(next("/employed-details").when(test(
                    answer("employment_status"),
                    condition("equals", vec![json!("employed")]),
                )))
                .next(next("/unemployed-details").when(test(
                    answer("employment_status"),
                    condition("equals", vec![json!("unemployed")]),
                )))
                .next(next("/check-answers"))
                .on_submission(on_submission().no_validate()),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/summary").unwrap();

    let request = RequestAdapter::new().with_post("employment_status", json!("employed"));
    let evaluator = Evaluator::new(&form, request);
    let outcome = evaluator.run_submit().await.unwrap();
    assert_eq!(
        outcome.result,
        TransitionResult::Redirect {
            value: "/employed-details".into()
        }
    );

    // An unmatched answer falls through to the unconditional next.
    let request = RequestAdapter::new().with_post("employment_status", json!("retired"));
    let evaluator = Evaluator::new(&form, request);
    let outcome = evaluator.run_submit().await.unwrap();
    assert_eq!(
        outcome.result,
        TransitionResult::Redirect {
            value: "/check-answers".into()
        }
    );
}

// ----------------------------------------------------------------------------
// Scenario: iterate MAP over loaded data
// ----------------------------------------------------------------------------

#[tokio::test]
async fn iterate_map_expands_items() {
    let template = json!({
        "value": item().path("id").build(),
        "text": item().path("name").build(),
    });
    let def = journey("/j")
        .step(
            step("/pick")
                .on_load(on_load(vec![effect("seedItems", vec![])]))
                .block(
                    field("radios", "choice").prop("items", iterate_map(data("items"), template)),
                ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/pick").unwrap();
    let evaluator = Evaluator::new(&form, RequestAdapter::new());

    let load = evaluator.run_load().await.unwrap();
    assert_eq!(load, TransitionResult::Executed);

    let view = evaluator.evaluate_step().await.unwrap();
    let block = view.field("choice").unwrap();
    assert_eq!(
        block["properties"]["items"],
        json!([
            {"value": "a", "text": "A"},
            {"value": "b", "text": "B"},
        ])
    );
}

#[tokio::test]
async fn iterate_filter_and_find() {
    let numbers = json!([1, 2, 3, 4]);
    let def = journey("/j")
        .step(
            step("/s").block(
                block("html")
                    .prop(
                        "matching",
                        iterate_filter(
                            numbers.clone(),
                            test(item(), condition("equals", vec![json!(2)])),
                        ),
                    )
                    .prop(
                        "first-match",
                        iterate_find(numbers, test(item(), condition("equals", vec![json!(2)]))),
                    ),
            ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/s").unwrap();
    let evaluator = Evaluator::new(&form, RequestAdapter::new());

    let view = evaluator.evaluate_step().await.unwrap();
    let block = &view.blocks()[0];
    assert_eq!(block["properties"]["matching"], json!([2]));
    assert_eq!(block["properties"]["first-match"], json!(2));
}

// ----------------------------------------------------------------------------
// Scenario: pipeline chaining through formatters
// ----------------------------------------------------------------------------

#[tokio::test]
async fn formatters_resolve_the_posted_answer() {
    let def = journey("/j")
        .step(
            step("/name").block(
                field("text-input", "name")
                    .formatter(transformer("trim", vec![]))
                    .formatter(transformer("toTitleCase", vec![])),
            ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/name").unwrap();
    let request = RequestAdapter::new().with_post("name", json!("  tom  "));
    let evaluator = Evaluator::new(&form, request);

    let view = evaluator.evaluate_step().await.unwrap();
    let block = view.field("name").unwrap();
    assert_eq!(block["properties"]["value"], json!("Tom"));

    // The resolved value lands in the answers map without a mutation entry.
    let answers = evaluator.answers();
    assert_eq!(answers["name"].current, json!("Tom"));
    assert!(answers["name"].mutations.is_empty());

    // Raw formatters are preserved verbatim for submission-time use.
    assert_eq!(
        block["properties"]["formatters"][0]["name"],
        json!("trim")
    );
}

// ----------------------------------------------------------------------------
// Scenario: XOR exclusivity
// ----------------------------------------------------------------------------

#[tokio::test]
async fn xor_is_true_iff_exactly_one() {
    let def = journey("/j")
        .step(
            step("/s").block(
                block("html")
                    .prop(
                        "two-true",
                        conditional(
                            one_of(vec![json!(true), json!(true), json!(false)]),
                            "one",
                            "not-one",
                        ),
                    )
                    .prop(
                        "one-true",
                        conditional(
                            one_of(vec![json!(false), json!(true), json!(false)]),
                            "one",
                            "not-one",
                        ),
                    )
                    .prop(
                        "empty",
                        conditional(one_of(vec![]), "one", "not-one"),
                    ),
            ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/s").unwrap();
    let evaluator = Evaluator::new(&form, RequestAdapter::new());

    let view = evaluator.evaluate_step().await.unwrap();
    let props = &view.blocks()[0]["properties"];
    assert_eq!(props["two-true"], json!("not-one"));
    assert_eq!(props["one-true"], json!("one"));
    assert_eq!(props["empty"], json!("not-one"));
}

// ----------------------------------------------------------------------------
// Property: format identity
// ----------------------------------------------------------------------------

#[tokio::test]
async fn format_substitutes_positionally() {
    let def = journey("/j")
        .step(
            step("/s").block(
                block("html")
                    .prop("plain", format("%1", vec![json!(42)]))
                    .prop("swapped", format("%2 %1", vec![json!("a"), json!("b")]))
                    .prop("missing", format("[%3]", vec![json!("a")])),
            ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/s").unwrap();
    let evaluator = Evaluator::new(&form, RequestAdapter::new());

    let view = evaluator.evaluate_step().await.unwrap();
    let props = &view.blocks()[0]["properties"];
    assert_eq!(props["plain"], json!("42"));
    assert_eq!(props["swapped"], json!("b a"));
    assert_eq!(props["missing"], json!("[]"));
}

// ----------------------------------------------------------------------------
// Property: short-circuit
// ----------------------------------------------------------------------------

#[tokio::test]
async fn and_short_circuits_left_to_right() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = FunctionRegistry::new();
    let counter = Arc::clone(&calls);
    registry
        .register(FunctionSpec::sync(
            FunctionKind::Condition,
            "countedFalse",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(false))
            },
        ))
        .unwrap();
    let counter = Arc::clone(&calls);
    registry
        .register(FunctionSpec::sync(
            FunctionKind::Condition,
            "countedTrue",
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(true))
            },
        ))
        .unwrap();

    let def = journey("/j")
        .step(
            step("/s").block(block("html").prop(
                "gate",
                conditional(
                    all_of(vec![
                        test(json!(1), condition("countedFalse", vec![])),
                        test(json!(1), condition("countedTrue", vec![])),
                    ]),
                    "open",
                    "closed",
                ),
            )),
        )
        .build();

    let form = FormCompiler::new(Arc::new(registry)).compile(&def, "/s").unwrap();
    let evaluator = Evaluator::new(&form, RequestAdapter::new());

    let view = evaluator.evaluate_step().await.unwrap();
    assert_eq!(view.blocks()[0]["properties"]["gate"], json!("closed"));
    // Only the first operand ran.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ----------------------------------------------------------------------------
// Property: dependent gating
// ----------------------------------------------------------------------------

#[tokio::test]
async fn falsy_dependent_empties_validations() {
    let def = journey("/j")
        .step(
            step("/s")
                .block(field("radios", "status"))
                .block(
                    field("text-input", "other")
                        .dependent(test(
                            answer("status"),
                            condition("equals", vec![json!("other")]),
                        ))
                        .validate(validation(
                            self_value().not_matches(condition("isValidEmail", vec![])),
                            "Required",
                        )),
                ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/s").unwrap();
    let request = RequestAdapter::new().with_post("status", json!("employed"));
    let evaluator = Evaluator::new(&form, request);

    let view = evaluator.evaluate_step().await.unwrap();
    let block = view.field("other").unwrap();
    assert_eq!(block["properties"]["dependent"], json!(false));
    assert_eq!(block["properties"]["validate"], json!([]));

    // The gated-off block contributes no submission failures either.
    let report = evaluator.run_validations(true).await.unwrap();
    assert!(report.is_valid());
}

// ----------------------------------------------------------------------------
// Property: safe-key guard
// ----------------------------------------------------------------------------

#[tokio::test]
async fn forbidden_dynamic_key_yields_null_and_security_error() {
    let probe = json!({
        "expressionType": "reference",
        "path": ["data", {"expressionType": "format", "template": "__proto__", "arguments": []}],
    });
    let def = journey("/j")
        .step(step("/s").block(block("html").prop("probe", probe)))
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/s").unwrap();
    let request = RequestAdapter::new().with_data("__proto__", json!({"polluted": true}));
    let evaluator = Evaluator::new(&form, request);

    let view = evaluator.evaluate_step().await.unwrap();
    assert_eq!(view.blocks()[0]["properties"]["probe"], json!(null));

    let errors = evaluator.security_errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("__proto__"));
}

// ----------------------------------------------------------------------------
// Access guards
// ----------------------------------------------------------------------------

#[tokio::test]
async fn failed_guard_redirects() {
    let def = journey("/j")
        .step(
            step("/secure")
                .block(block("html"))
                .on_access(
                    on_access()
                        .guards(test(
                            answer("role"),
                            condition("equals", vec![json!("admin")]),
                        ))
                        .next(redirect_to("/denied")),
                ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/secure").unwrap();

    let request = RequestAdapter::new().with_answer("role", json!("viewer"));
    let evaluator = Evaluator::new(&form, request);
    let result = evaluator.run_access().await.unwrap();
    assert_eq!(
        result,
        TransitionResult::Redirect {
            value: "/denied".into()
        }
    );
}

#[tokio::test]
async fn throw_error_outcome_carries_status() {
    let def = journey("/j")
        .step(
            step("/gone").block(block("html")).on_access(
                on_access().next(throw_error(410, "This journey has closed")),
            ),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/gone").unwrap();
    let evaluator = Evaluator::new(&form, RequestAdapter::new());

    let result = evaluator.run_access().await.unwrap();
    assert_eq!(
        result,
        TransitionResult::Error {
            status: 410,
            message: "This journey has closed".into()
        }
    );
}

// ----------------------------------------------------------------------------
// POST list reduction
// ----------------------------------------------------------------------------

#[tokio::test]
async fn single_value_field_reduces_posted_lists() {
    let def = journey("/j")
        .step(
            step("/s")
                .block(field("text-input", "colour"))
                .block(field("checkboxes", "days").multiple()),
        )
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/s").unwrap();
    let request = RequestAdapter::new()
        .with_post("colour", json!([null, "  ", "red", "blue"]))
        .with_post("days", json!(["mon", "tue"]));
    let evaluator = Evaluator::new(&form, request);

    let view = evaluator.evaluate_step().await.unwrap();
    assert_eq!(
        view.field("colour").unwrap()["properties"]["value"],
        json!("red")
    );
    assert_eq!(
        view.field("days").unwrap()["properties"]["value"],
        json!(["mon", "tue"])
    );
}

// ----------------------------------------------------------------------------
// Stored answers and defaults
// ----------------------------------------------------------------------------

#[tokio::test]
async fn stored_answer_shows_without_post_and_post_wins_over_it() {
    let def = journey("/j")
        .step(step("/s").block(field("text-input", "city").default_value(json!("London"))))
        .build();

    let form = FormCompiler::new(registry()).compile(&def, "/s").unwrap();

    // GET render: the stored answer wins over the default.
    let request = RequestAdapter::new().with_answer("city", json!("Leeds"));
    let evaluator = Evaluator::new(&form, request);
    let view = evaluator.evaluate_step().await.unwrap();
    assert_eq!(view.field("city").unwrap()["properties"]["value"], json!("Leeds"));

    // Re-submission: POST wins over the stored answer.
    let request = RequestAdapter::new()
        .with_answer("city", json!("Leeds"))
        .with_post("city", json!("York"));
    let evaluator = Evaluator::new(&form, request);
    let view = evaluator.evaluate_step().await.unwrap();
    assert_eq!(view.field("city").unwrap()["properties"]["value"], json!("York"));

    // Nothing anywhere: the literal default applies.
    let evaluator = Evaluator::new(&form, RequestAdapter::new());
    let view = evaluator.evaluate_step().await.unwrap();
    assert_eq!(
        view.field("city").unwrap()["properties"]["value"],
        json!("London")
    );
}
