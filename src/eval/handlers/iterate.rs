//! Iterate handler: per-item template expansion through the runtime
//! overlay.
//!
//! For every item of the input collection a fresh subtree is compiled from
//! the raw iterator template, flushed into the runtime layer, and invoked
//! under an `@item`/`@index` scope frame. MAP collects yield values,
//! FILTER keeps items whose predicate holds, FIND returns the first match.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::HandlerError;
use crate::eval::context::EvalContext;
use crate::eval::handler::{HandlerResult, ThunkHandler};
use crate::eval::handlers::eval_prop;
use crate::eval::invoke::Invoker;
use crate::eval::overlay::{RuntimeOverlay, TemplateShape};
use crate::eval::scope::ScopeFrame;
use crate::node::{IteratorKind, NodeId, PropValue};
use crate::walk::is_truthy;

pub struct IterateHandler {
    pub id: NodeId,
    pub input: PropValue,
    pub iterator: IteratorKind,
}

fn eval_shape<'a>(
    shape: &'a TemplateShape,
    ctx: &'a EvalContext<'_>,
    inv: &'a Invoker,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        match shape {
            TemplateShape::Node(id) => inv.invoke(*id, ctx).await,
            TemplateShape::Literal(value) => Ok(value.clone()),
            TemplateShape::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(eval_shape(item, ctx, inv).await?);
                }
                Ok(Value::Array(out))
            }
            TemplateShape::Object(fields) => {
                let mut out = Map::new();
                for (key, child) in fields {
                    out.insert(key.clone(), eval_shape(child, ctx, inv).await?);
                }
                Ok(Value::Object(out))
            }
        }
    })
}

impl IterateHandler {
    /// Compile one per-item subtree and merge it into the runtime layer,
    /// invalidating the new ids' cache entries.
    fn materialize(&self, ctx: &EvalContext<'_>) -> Result<TemplateShape, HandlerError> {
        let mut overlay = RuntimeOverlay::open(ctx);
        let shape = overlay
            .compile_template(self.iterator.template())
            .map_err(|err| {
                HandlerError::evaluation(self.id, "iterator template failed to compile")
                    .with_cause(err.into())
            })?;

        let budget = ctx.limits().max_overlay_nodes;
        if ctx.runtime().node_count() + overlay.pending_node_ids().len() > budget {
            return Err(HandlerError::evaluation(
                self.id,
                format!("overlay node budget of {budget} exceeded"),
            ));
        }

        let pending = overlay.flush();
        ctx.invalidate_cascade(pending);
        Ok(shape)
    }
}

#[async_trait]
impl ThunkHandler for IterateHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        let input = eval_prop(&self.input, ctx, inv).await?;
        let items = match input {
            Value::Null => Vec::new(),
            Value::Array(items) => items,
            _ => {
                return Err(HandlerError::evaluation(
                    self.id,
                    "iterate input is not a list",
                ))
            }
        };
        if items.len() > ctx.limits().max_iterate_items {
            return Err(HandlerError::evaluation(
                self.id,
                format!(
                    "iterate input exceeds {} items",
                    ctx.limits().max_iterate_items
                ),
            ));
        }
        debug!(node = %self.id, items = items.len(), "iterate expansion");

        let mut collected = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let shape = self.materialize(ctx)?;
            let _scope = ctx
                .scope()
                .push_guard(ScopeFrame::iterate(item.clone(), index));
            let value = eval_shape(&shape, ctx, inv).await?;

            match self.iterator {
                IteratorKind::Map { .. } => collected.push(value),
                IteratorKind::Filter { .. } => {
                    if is_truthy(&value) {
                        collected.push(item);
                    }
                }
                IteratorKind::Find { .. } => {
                    if is_truthy(&value) {
                        return Ok(item);
                    }
                }
            }
        }

        match self.iterator {
            IteratorKind::Find { .. } => Ok(Value::Null),
            _ => Ok(Value::Array(collected)),
        }
    }
}
