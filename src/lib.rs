//! # formflow
//!
//! A compiler and evaluator for declarative, data-driven form journeys.
//!
//! Form authors describe a journey as a tree of structural definitions
//! (journey → steps → blocks/fields) whose properties may contain
//! expressions: references to answers/data/request input, conditionals,
//! pipelines, format strings, iterators, predicates, validations, and
//! calls into a registered function catalogue. The engine compiles that
//! tree into a graph of typed nodes with per-node handlers, then evaluates
//! a requested step per HTTP request, producing an evaluated view model
//! plus lifecycle transition results (load, access, action, submit).
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use formflow::definition::*;
//! use formflow::{Evaluator, FormCompiler, FunctionRegistry, RequestAdapter};
//! use std::sync::Arc;
//!
//! let functions = Arc::new(FunctionRegistry::new());
//! // ... register conditions / transformers / effects / generators ...
//!
//! let def = journey("/contact")
//!     .step(step("/email").block(
//!         field("text-input", "email").prop("label", "Email address"),
//!     ))
//!     .build();
//!
//! let form = FormCompiler::new(functions).compile(&def, "/email")?;
//!
//! // Per request:
//! let request = RequestAdapter::new().with_post("email", "x@y.z".into());
//! let evaluator = Evaluator::new(&form, request);
//! evaluator.run_load().await?;
//! evaluator.run_action_and_commit().await?;
//! let view = evaluator.evaluate_step().await?;
//! # Ok::<(), formflow::EngineError>(())
//! ```
//!
//! ## Modules
//!
//! - [`definition`] - fluent builders emitting the tagged-JSON input tree
//! - [`node`] - node ids, the typed AST, pseudo-nodes, registries
//! - [`compile`] - normalization, pseudo synthesis, wiring, thunks
//! - [`eval`] - per-request context, cache, scope, handlers, overlay
//! - [`registry`] - function and component registries
//! - [`request`] - the request adapter interface
//! - [`limits`] - per-request evaluation guardrails
//!
//! ## Error codes
//!
//! | Range | Phase | Example |
//! |-------|-------|---------|
//! | FF-001..005 | Compilation | invalid node, cycle, duplicate id |
//! | FF-010..014 | Evaluation | lookup miss, security violation |
//! | FF-013..016 | Registration | duplicate function, aggregate |

pub mod compile;
pub mod definition;
pub mod error;
pub mod eval;
pub mod limits;
pub mod node;
pub mod registry;
pub mod request;
pub mod walk;

pub use compile::{CompiledForm, DependencyGraph, EdgeKind, EdgeMeta, FormCompiler};
pub use error::{CompileError, EngineError, ErrorKind, HandlerError};
pub use eval::{
    CapturedEffect, EvaluatedBlock, EvaluatedStep, Evaluator, SubmitOutcome, TransitionResult,
    ValidationFailure, ValidationReport,
};
pub use limits::EngineLimits;
pub use node::{FunctionKind, NodeId};
pub use registry::{
    ComponentRegistry, ComponentSpec, FunctionCall, FunctionRegistry, FunctionSpec,
    NativeFunction, RegistryError,
};
pub use request::{AnswerEntry, AnswerMap, Mutation, MutationSource, RequestAdapter};
