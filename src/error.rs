//! Error taxonomy for compilation and evaluation.
//!
//! Two families, matching the two phases of the engine:
//!
//! - [`CompileError`] - fatal, raised synchronously while a form definition
//!   is being compiled. The embedder must not register the form.
//! - [`HandlerError`] - the error arm of the handler protocol. These bubble
//!   through the invocation adapter; parents may absorb or pass them on.
//!
//! All errors carry `FF-xxx` codes in their Display output so failures are
//! easy to grep across logs.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::node::NodeId;

// ============================================================================
// COMPILE ERRORS
// ============================================================================

/// Fatal compilation failures. A definition that produces one of these must
/// not be served.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A tagged definition is missing a required child or carries one of the
    /// wrong shape. The path breadcrumb locates it in the definition tree.
    #[error("FF-001: invalid node at {path}: {message}")]
    InvalidNode { path: String, message: String },

    /// A definition carries a tag the factory does not recognise.
    #[error("FF-002: unknown node type '{found}' at {path}")]
    UnknownNodeType { path: String, found: String },

    /// A node id was registered twice.
    #[error("FF-003: duplicate node id {id}")]
    DuplicateId { id: NodeId },

    /// The dependency graph is not a DAG.
    #[error("FF-004: dependency cycle through node {id}")]
    Cycle { id: NodeId },

    /// The definition violates a structural rule that is not local to a
    /// single node (e.g. the target step does not exist).
    #[error("FF-005: schema error: {message}")]
    Schema { message: String },
}

impl CompileError {
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::InvalidNode {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        CompileError::Schema {
            message: message.into(),
        }
    }
}

// ============================================================================
// HANDLER ERRORS
// ============================================================================

/// Category of a runtime handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A name could not be resolved in a registry (unknown function, missing
    /// handler, missing component variant).
    Lookup,
    /// A handler could not produce a value from its inputs.
    EvaluationFailed,
    /// A dynamic property access used a forbidden key.
    Security,
    /// A node reached evaluation in a shape the handler cannot process.
    InvalidNode,
}

impl ErrorKind {
    fn code(self) -> &'static str {
        match self {
            ErrorKind::Lookup => "FF-010",
            ErrorKind::EvaluationFailed => "FF-011",
            ErrorKind::Security => "FF-012",
            ErrorKind::InvalidNode => "FF-014",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The error arm of `HandlerResult`.
///
/// Cloneable so cached failures can be replayed; the underlying cause is
/// shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub node_id: Option<NodeId>,
    pub message: String,
    pub cause: Option<Arc<anyhow::Error>>,
    pub context: Option<Value>,
}

impl PartialEq for HandlerError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.node_id == other.node_id
            && self.message == other.message
            && self.context == other.context
            && match (&self.cause, &other.cause) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

impl HandlerError {
    pub fn new(kind: ErrorKind, node_id: NodeId, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: Some(node_id),
            message: message.into(),
            cause: None,
            context: None,
        }
    }

    pub fn lookup(node_id: NodeId, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lookup, node_id, message)
    }

    pub fn evaluation(node_id: NodeId, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EvaluationFailed, node_id, message)
    }

    pub fn security(node_id: NodeId, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, node_id, message)
    }

    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(id) = self.node_id {
            write!(f, " (node {})", id)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for HandlerError {}

// ============================================================================
// TOP-LEVEL WRAPPER
// ============================================================================

/// Unified error for embedders that want a single failure type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Handler(#[from] HandlerError),

    #[error("{0}")]
    Registry(#[from] crate::registry::RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeIdGenerator;

    #[test]
    fn compile_errors_carry_codes() {
        let err = CompileError::invalid("journey.steps[0]", "missing blocks");
        assert!(err.to_string().contains("FF-001"));
        assert!(err.to_string().contains("journey.steps[0]"));

        let err = CompileError::schema("target step '/missing' not found");
        assert!(err.to_string().contains("FF-005"));
    }

    #[test]
    fn handler_error_renders_node_and_cause() {
        let ids = NodeIdGenerator::new();
        let id = ids.ast_id();

        let err = HandlerError::lookup(id, "no condition function 'isValidEmail'")
            .with_cause(anyhow::anyhow!("registry empty"));

        let text = err.to_string();
        assert!(text.contains("FF-010"));
        assert!(text.contains("compile_ast:0"));
        assert!(text.contains("registry empty"));
    }

    #[test]
    fn security_errors_are_distinct() {
        let ids = NodeIdGenerator::new();
        let err = HandlerError::security(ids.ast_id(), "forbidden key '__proto__'");
        assert_eq!(err.kind, ErrorKind::Security);
        assert!(err.to_string().contains("FF-012"));
    }
}
