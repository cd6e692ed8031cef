//! The thunk handler protocol.
//!
//! One handler per compiled node. Every handler has an async `evaluate`;
//! hybrid handlers also implement `evaluate_sync` and report, via
//! `compute_is_async`, whether the async path is actually needed given
//! their dependencies' flags. The flags are computed leaves→roots once per
//! compilation, so a parent always sees accurate child flags.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::eval::context::EvalContext;
use crate::eval::invoke::Invoker;
use crate::node::NodeId;

/// The uniform evaluation outcome: a value or a structured error.
pub type HandlerResult = Result<Value, HandlerError>;

/// Read-only view of async flags during the bottom-up pass.
pub trait AsyncFlags {
    fn is_async(&self, id: NodeId) -> bool;
}

impl<F: Fn(NodeId) -> bool> AsyncFlags for F {
    fn is_async(&self, id: NodeId) -> bool {
        self(id)
    }
}

/// Per-node evaluation thunk.
#[async_trait]
pub trait ThunkHandler: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Whether results may be memoized. Side-effecting handlers (effects,
    /// transitions) and first-match outcomes are not cacheable.
    fn cacheable(&self) -> bool {
        true
    }

    /// Compute this handler's async flag from its dependencies' flags.
    /// Defaults to async; hybrid handlers override.
    fn compute_is_async(&self, _flags: &dyn AsyncFlags) -> bool {
        true
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult;

    /// Fast path, invoked only when the computed flag is sync.
    fn evaluate_sync(&self, _ctx: &EvalContext<'_>, _inv: &Invoker) -> HandlerResult {
        Err(HandlerError::evaluation(
            self.node_id(),
            "handler has no sync path",
        ))
    }
}

/// Node id → handler.
pub type HandlerMap = FxHashMap<NodeId, Arc<dyn ThunkHandler>>;

/// Node id → computed async flag.
pub type AsyncFlagMap = FxHashMap<NodeId, bool>;
