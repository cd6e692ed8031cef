//! Function and component registries.
//!
//! The registries are the only executable surface a form definition can
//! reach: expressions may invoke registered functions by `(kind, name)` and
//! the template layer resolves block variants to renderers. Nothing in a
//! definition ever executes as code.

pub mod component;
pub mod function;

pub use component::{ComponentRegistry, ComponentSpec, RenderFn};
pub use function::{FunctionCall, FunctionRegistry, FunctionSpec, NativeFunction};

use thiserror::Error;

use crate::node::FunctionKind;

/// Registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("FF-013: duplicate registration of {kind} function '{name}'")]
    DuplicateFunction { kind: FunctionKind, name: String },

    #[error("FF-013: duplicate registration of component variant '{variant}'")]
    DuplicateComponent { variant: String },

    #[error("FF-015: invalid registration: {message}")]
    Invalid { message: String },

    /// Batch registration collects individual failures instead of stopping
    /// at the first.
    #[error("FF-016: {} registrations failed", .errors.len())]
    Aggregate { errors: Vec<RegistryError> },
}
