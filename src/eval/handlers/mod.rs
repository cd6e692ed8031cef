//! The handler catalogue: one module per handler family.

pub mod expression;
pub mod function;
pub mod iterate;
pub mod predicate;
pub mod pseudo;
pub mod reference;
pub mod structural;
pub mod transition;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::HandlerError;
use crate::eval::context::EvalContext;
use crate::eval::handler::{AsyncFlags, HandlerResult};
use crate::eval::invoke::Invoker;
use crate::node::PropValue;

/// Evaluate a property value: literals pass through, nodes are invoked,
/// lists map element-wise into an array.
pub(crate) fn eval_prop<'a>(
    prop: &'a PropValue,
    ctx: &'a EvalContext<'_>,
    inv: &'a Invoker,
) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        match prop {
            PropValue::Literal(value) => Ok(value.clone()),
            PropValue::Node(id) => inv.invoke(*id, ctx).await,
            PropValue::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(eval_prop(item, ctx, inv).await?);
                }
                Ok(Value::Array(out))
            }
        }
    })
}

/// Sync mirror of [`eval_prop`]; legal only when every reachable node is
/// sync.
pub(crate) fn eval_prop_sync(
    prop: &PropValue,
    ctx: &EvalContext<'_>,
    inv: &Invoker,
) -> HandlerResult {
    match prop {
        PropValue::Literal(value) => Ok(value.clone()),
        PropValue::Node(id) => inv.invoke_sync(*id, ctx),
        PropValue::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_prop_sync(item, ctx, inv)?);
            }
            Ok(Value::Array(out))
        }
    }
}

/// Evaluate sibling properties concurrently, preserving order.
pub(crate) async fn eval_props_parallel(
    props: &[PropValue],
    ctx: &EvalContext<'_>,
    inv: &Invoker,
) -> Result<Vec<Value>, HandlerError> {
    let futures: Vec<_> = props.iter().map(|p| eval_prop(p, ctx, inv)).collect();
    let results = futures::future::join_all(futures).await;
    results.into_iter().collect()
}

/// Whether any node referenced by a property value carries the async flag.
pub(crate) fn prop_is_async(prop: &PropValue, flags: &dyn AsyncFlags) -> bool {
    prop.node_ids().iter().any(|id| flags.is_async(*id))
}

pub(crate) fn props_are_async(props: &[PropValue], flags: &dyn AsyncFlags) -> bool {
    props.iter().any(|p| prop_is_async(p, flags))
}
