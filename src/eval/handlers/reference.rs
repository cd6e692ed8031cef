//! Reference handler: path-based reads from data sources and scope.
//!
//! Path shape is `[namespace, key, ...rest]`. The key may itself be a node
//! (dynamic); it is evaluated first, must produce a string, and is split on
//! `.` to reconstitute the effective path. Resolution prefers the matching
//! pseudo-node and falls back to direct adapter/context reads. Lookup
//! misses and dynamic-key type mismatches are expected data states and
//! yield null rather than errors; forbidden keys yield null and record a
//! SECURITY error.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::HandlerError;
use crate::eval::context::EvalContext;
use crate::eval::handler::{AsyncFlags, HandlerResult, ThunkHandler};
use crate::eval::invoke::Invoker;
use crate::node::{Namespace, NodeId, PathSegment, SourceKey};
use crate::walk::{is_safe_key, split_dotted, walk_path, WalkSegment};

pub struct ReferenceHandler {
    pub id: NodeId,
    pub path: Vec<PathSegment>,
    pub base: Option<NodeId>,
    /// Pseudo producer bound at compile time when `(namespace, key)` is
    /// static. Dynamic keys resolve their pseudo at request time.
    pub static_pseudo: Option<NodeId>,
}

/// Outcome of resolving dynamic segments: either concrete walk segments or
/// "undefined" (a dynamic segment produced an unusable value).
enum Segments {
    Ready(Vec<WalkSegment>),
    Undefined,
}

impl ReferenceHandler {
    fn walk(&self, ctx: &EvalContext<'_>, value: &Value, segments: &[WalkSegment]) -> Value {
        match walk_path(value, segments) {
            Ok(Some(found)) => found.clone(),
            Ok(None) => Value::Null,
            Err(key) => {
                ctx.record_security_error(HandlerError::security(
                    self.id,
                    format!("forbidden property name '{key}'"),
                ));
                Value::Null
            }
        }
    }

    /// Turn a dynamic segment's value into walk segments.
    fn dynamic_segments(value: &Value) -> Segments {
        match value {
            Value::String(s) => Segments::Ready(split_dotted(s)),
            Value::Number(n) => match n.as_u64() {
                Some(idx) => Segments::Ready(vec![WalkSegment::Index(idx as usize)]),
                None => Segments::Undefined,
            },
            _ => Segments::Undefined,
        }
    }

    fn static_segment(segment: &PathSegment) -> Option<WalkSegment> {
        match segment {
            PathSegment::Key(k) => Some(WalkSegment::Key(k.clone())),
            PathSegment::Index(i) => Some(WalkSegment::Index(*i)),
            PathSegment::Node(_) => None,
        }
    }

    async fn resolve_segments(
        &self,
        tail: &[PathSegment],
        ctx: &EvalContext<'_>,
        inv: &Invoker,
    ) -> Result<Segments, HandlerError> {
        let mut out = Vec::with_capacity(tail.len());
        for segment in tail {
            match Self::static_segment(segment) {
                Some(walk) => out.push(walk),
                None => {
                    let PathSegment::Node(id) = segment else {
                        unreachable!("static segments handled above")
                    };
                    let value = inv.invoke(*id, ctx).await?;
                    match Self::dynamic_segments(&value) {
                        Segments::Ready(parts) => out.extend(parts),
                        Segments::Undefined => return Ok(Segments::Undefined),
                    }
                }
            }
        }
        Ok(Segments::Ready(out))
    }

    fn resolve_segments_sync(
        &self,
        tail: &[PathSegment],
        ctx: &EvalContext<'_>,
        inv: &Invoker,
    ) -> Result<Segments, HandlerError> {
        let mut out = Vec::with_capacity(tail.len());
        for segment in tail {
            match Self::static_segment(segment) {
                Some(walk) => out.push(walk),
                None => {
                    let PathSegment::Node(id) = segment else {
                        unreachable!("static segments handled above")
                    };
                    let value = inv.invoke_sync(*id, ctx)?;
                    match Self::dynamic_segments(&value) {
                        Segments::Ready(parts) => out.extend(parts),
                        Segments::Undefined => return Ok(Segments::Undefined),
                    }
                }
            }
        }
        Ok(Segments::Ready(out))
    }

    /// The effective `(key, extra-segments)` for position 1 of the path.
    async fn resolve_key(
        &self,
        ctx: &EvalContext<'_>,
        inv: &Invoker,
    ) -> Result<Option<(String, Vec<WalkSegment>)>, HandlerError> {
        let key_value = match &self.path[1] {
            PathSegment::Key(k) => return Ok(Some((k.clone(), Vec::new()))),
            PathSegment::Index(i) => return Ok(Some((i.to_string(), Vec::new()))),
            PathSegment::Node(id) => inv.invoke(*id, ctx).await?,
        };
        self.split_key(ctx, key_value)
    }

    fn resolve_key_sync(
        &self,
        ctx: &EvalContext<'_>,
        inv: &Invoker,
    ) -> Result<Option<(String, Vec<WalkSegment>)>, HandlerError> {
        let key_value = match &self.path[1] {
            PathSegment::Key(k) => return Ok(Some((k.clone(), Vec::new()))),
            PathSegment::Index(i) => return Ok(Some((i.to_string(), Vec::new()))),
            PathSegment::Node(id) => inv.invoke_sync(*id, ctx)?,
        };
        self.split_key(ctx, key_value)
    }

    fn split_key(
        &self,
        ctx: &EvalContext<'_>,
        key_value: Value,
    ) -> Result<Option<(String, Vec<WalkSegment>)>, HandlerError> {
        let Value::String(raw) = key_value else {
            // Dynamic key of the wrong type: expected data state, not error.
            return Ok(None);
        };
        if raw.len() > ctx.limits().max_dynamic_key_len {
            return Err(HandlerError::evaluation(
                self.id,
                format!("dynamic key exceeds {} bytes", ctx.limits().max_dynamic_key_len),
            ));
        }

        let mut parts = split_dotted(&raw);
        if parts.is_empty() {
            return Ok(None);
        }
        let key = match parts.remove(0) {
            WalkSegment::Key(k) => k,
            WalkSegment::Index(i) => i.to_string(),
        };
        Ok(Some((key, parts)))
    }

    fn source_base(
        &self,
        ns: Namespace,
        key: &str,
        ctx: &EvalContext<'_>,
    ) -> Option<NodeId> {
        ctx.pseudo_for(&SourceKey::new(ns, key))
    }

    /// Fallback read when no pseudo-node serves `(ns, key)`.
    fn direct_read(&self, ns: Namespace, key: &str, ctx: &EvalContext<'_>) -> Value {
        match ns {
            Namespace::Post => ctx.post_raw(key),
            Namespace::Query => ctx.query_raw(key),
            Namespace::Params => ctx.params_raw(key),
            Namespace::Data => ctx.data_get(key),
            Namespace::Answers => ctx.answer_current(key),
        }
        .unwrap_or(Value::Null)
    }

    async fn resolve(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        // Base references walk the whole path into the base's result.
        if let Some(base) = self.base {
            let base_value = inv.invoke(base, ctx).await?;
            return match self.resolve_segments(&self.path, ctx, inv).await? {
                Segments::Ready(segments) => Ok(self.walk(ctx, &base_value, &segments)),
                Segments::Undefined => Ok(Value::Null),
            };
        }

        let PathSegment::Key(first) = &self.path[0] else {
            return Ok(Value::Null);
        };

        // Scope references: @item, @index, @value, ...
        if first.starts_with('@') {
            let scoped = ctx.scope().lookup(first).unwrap_or(Value::Null);
            return match self.resolve_segments(&self.path[1..], ctx, inv).await? {
                Segments::Ready(segments) => Ok(self.walk(ctx, &scoped, &segments)),
                Segments::Undefined => Ok(Value::Null),
            };
        }

        let Some(ns) = Namespace::from_token(first) else {
            return Ok(Value::Null);
        };
        if self.path.len() < 2 {
            return Ok(Value::Null);
        }
        let Some((key, extra)) = self.resolve_key(ctx, inv).await? else {
            return Ok(Value::Null);
        };
        if !is_safe_key(&key) {
            ctx.record_security_error(HandlerError::security(
                self.id,
                format!("forbidden property name '{key}'"),
            ));
            return Ok(Value::Null);
        }

        let base_value = match self.source_base(ns, &key, ctx) {
            Some(pseudo) => inv.invoke(pseudo, ctx).await?,
            None => self.direct_read(ns, &key, ctx),
        };

        let mut segments = extra;
        match self.resolve_segments(&self.path[2..], ctx, inv).await? {
            Segments::Ready(rest) => segments.extend(rest),
            Segments::Undefined => return Ok(Value::Null),
        }
        Ok(self.walk(ctx, &base_value, &segments))
    }

    fn resolve_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        if let Some(base) = self.base {
            let base_value = inv.invoke_sync(base, ctx)?;
            return match self.resolve_segments_sync(&self.path, ctx, inv)? {
                Segments::Ready(segments) => Ok(self.walk(ctx, &base_value, &segments)),
                Segments::Undefined => Ok(Value::Null),
            };
        }

        let PathSegment::Key(first) = &self.path[0] else {
            return Ok(Value::Null);
        };

        if first.starts_with('@') {
            let scoped = ctx.scope().lookup(first).unwrap_or(Value::Null);
            return match self.resolve_segments_sync(&self.path[1..], ctx, inv)? {
                Segments::Ready(segments) => Ok(self.walk(ctx, &scoped, &segments)),
                Segments::Undefined => Ok(Value::Null),
            };
        }

        let Some(ns) = Namespace::from_token(first) else {
            return Ok(Value::Null);
        };
        if self.path.len() < 2 {
            return Ok(Value::Null);
        }
        let Some((key, extra)) = self.resolve_key_sync(ctx, inv)? else {
            return Ok(Value::Null);
        };
        if !is_safe_key(&key) {
            ctx.record_security_error(HandlerError::security(
                self.id,
                format!("forbidden property name '{key}'"),
            ));
            return Ok(Value::Null);
        }

        let base_value = match self.source_base(ns, &key, ctx) {
            Some(pseudo) => inv.invoke_sync(pseudo, ctx)?,
            None => self.direct_read(ns, &key, ctx),
        };

        let mut segments = extra;
        match self.resolve_segments_sync(&self.path[2..], ctx, inv)? {
            Segments::Ready(rest) => segments.extend(rest),
            Segments::Undefined => return Ok(Value::Null),
        }
        Ok(self.walk(ctx, &base_value, &segments))
    }
}

#[async_trait]
impl ThunkHandler for ReferenceHandler {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn compute_is_async(&self, flags: &dyn AsyncFlags) -> bool {
        let mut deps: Vec<NodeId> = self
            .path
            .iter()
            .filter_map(|segment| match segment {
                PathSegment::Node(id) => Some(*id),
                _ => None,
            })
            .collect();
        deps.extend(self.base);
        deps.extend(self.static_pseudo);

        // A dynamic answers key may resolve to an async local answer, so it
        // cannot prove itself sync.
        let answers_ns =
            matches!(self.path.first(), Some(PathSegment::Key(k)) if k == "answers");
        let dynamic_key = matches!(self.path.get(1), Some(PathSegment::Node(_)));

        deps.iter().any(|id| flags.is_async(*id)) || (answers_ns && dynamic_key)
    }

    async fn evaluate(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        self.resolve(ctx, inv).await
    }

    fn evaluate_sync(&self, ctx: &EvalContext<'_>, inv: &Invoker) -> HandlerResult {
        self.resolve_sync(ctx, inv)
    }
}
