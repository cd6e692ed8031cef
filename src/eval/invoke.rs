//! The invocation adapter: the one place that consults the cache and
//! dispatches to handlers.
//!
//! Handlers evaluate other nodes exclusively through [`Invoker::invoke`] /
//! [`Invoker::invoke_sync`]; they never read or write the cache themselves.
//! The adapter also enforces the invocation-depth guard.

use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tracing::trace;

use crate::error::HandlerError;
use crate::eval::context::EvalContext;
use crate::eval::handler::HandlerResult;
use crate::node::NodeId;

#[derive(Default)]
pub struct Invoker {
    depth: AtomicUsize,
}

impl Invoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate a node, taking the sync fast path when the compiled flag
    /// allows it. Results are memoized per `(node, scope fingerprint)`.
    pub fn invoke<'a>(
        &'a self,
        id: NodeId,
        ctx: &'a EvalContext<'_>,
    ) -> BoxFuture<'a, HandlerResult> {
        Box::pin(async move {
            let _guard = self.enter(id, ctx)?;

            let Some(handler) = ctx.handler(id) else {
                return Err(HandlerError::lookup(id, "no handler registered"));
            };

            let cacheable = handler.cacheable();
            let fingerprint = ctx.scope().fingerprint();
            if cacheable {
                if let Some(hit) = ctx.cache().get(id, fingerprint) {
                    trace!(node = %id, "cache hit");
                    return hit;
                }
            }

            let result = if ctx.is_async(id) {
                handler.evaluate(ctx, self).await
            } else {
                handler.evaluate_sync(ctx, self)
            };

            if cacheable {
                ctx.cache().insert(id, fingerprint, result.clone());
            }
            result
        })
    }

    /// Evaluate a node on the sync path. Only legal when the node's
    /// computed flag is sync; the topological async pass guarantees callers
    /// never get here otherwise.
    pub fn invoke_sync(&self, id: NodeId, ctx: &EvalContext<'_>) -> HandlerResult {
        let _guard = self.enter(id, ctx)?;

        let Some(handler) = ctx.handler(id) else {
            return Err(HandlerError::lookup(id, "no handler registered"));
        };

        if ctx.is_async(id) {
            return Err(HandlerError::evaluation(
                id,
                "async handler invoked on the sync path",
            ));
        }

        let cacheable = handler.cacheable();
        let fingerprint = ctx.scope().fingerprint();
        if cacheable {
            if let Some(hit) = ctx.cache().get(id, fingerprint) {
                return hit;
            }
        }

        let result = handler.evaluate_sync(ctx, self);
        if cacheable {
            ctx.cache().insert(id, fingerprint, result.clone());
        }
        result
    }

    fn enter(&self, id: NodeId, ctx: &EvalContext<'_>) -> Result<DepthGuard<'_>, HandlerError> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > ctx.limits().max_invoke_depth {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::evaluation(
                id,
                format!("invocation depth exceeded {}", ctx.limits().max_invoke_depth),
            ));
        }
        Ok(DepthGuard { depth: &self.depth })
    }
}

struct DepthGuard<'a> {
    depth: &'a AtomicUsize,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
    }
}
