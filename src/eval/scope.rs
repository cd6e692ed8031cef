//! Scope stack for pipeline, iterate, and transition evaluation.
//!
//! Frames are small ordered maps layered top-down; `@value`, `@item`,
//! `@index`, `@type`, and `@transitionType` are the conventional keys. The
//! fingerprint over the visible stack keys the per-node result cache, so
//! frames use ordered maps to keep it stable.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde_json::Value;
use smallvec::SmallVec;
use xxhash_rust::xxh3::Xxh3;

/// One scope frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeFrame(BTreeMap<String, Value>);

impl ScopeFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Frame pushed around each pipeline step.
    pub fn pipeline(value: Value) -> Self {
        Self::new()
            .set("@value", value)
            .set("@type", Value::String("pipeline".into()))
    }

    /// Frame pushed around each iterate item.
    pub fn iterate(item: Value, index: usize) -> Self {
        Self::new()
            .set("@item", item)
            .set("@index", Value::from(index))
            .set("@type", Value::String("iterate".into()))
    }

    /// Frame pushed around a lifecycle transition.
    pub fn transition(kind: &str) -> Self {
        Self::new().set("@transitionType", Value::String(kind.into()))
    }
}

/// The per-request scope stack. Lookups walk top-down; the first frame
/// carrying the key wins.
#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: Mutex<SmallVec<[ScopeFrame; 4]>>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: ScopeFrame) {
        self.frames.lock().push(frame);
    }

    pub fn pop(&self) {
        self.frames.lock().pop();
    }

    /// Push a frame and pop it again when the guard drops, so scope is
    /// released on every exit path.
    pub fn push_guard(&self, frame: ScopeFrame) -> ScopeGuard<'_> {
        self.push(frame);
        ScopeGuard { stack: self }
    }

    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Resolve a scope key against the visible frames.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let frames = self.frames.lock();
        frames.iter().rev().find_map(|frame| frame.get(key).cloned())
    }

    /// Hash of the visible stack, used as the cache key qualifier. The same
    /// frames in the same order always produce the same fingerprint.
    pub fn fingerprint(&self) -> u64 {
        let frames = self.frames.lock();
        if frames.is_empty() {
            return 0;
        }
        let mut hasher = Xxh3::new();
        for frame in frames.iter() {
            for (key, value) in &frame.0 {
                hasher.update(key.as_bytes());
                hasher.update(b"=");
                hasher.update(value.to_string().as_bytes());
                hasher.update(b";");
            }
            hasher.update(b"|");
        }
        hasher.digest()
    }
}

/// Pops one frame on drop.
pub struct ScopeGuard<'a> {
    stack: &'a ScopeStack,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_walks_top_down() {
        let stack = ScopeStack::new();
        stack.push(ScopeFrame::pipeline(json!("outer")));
        stack.push(ScopeFrame::pipeline(json!("inner")));

        assert_eq!(stack.lookup("@value"), Some(json!("inner")));
        stack.pop();
        assert_eq!(stack.lookup("@value"), Some(json!("outer")));
    }

    #[test]
    fn guard_pops_on_drop() {
        let stack = ScopeStack::new();
        {
            let _guard = stack.push_guard(ScopeFrame::iterate(json!({"id": "a"}), 0));
            assert_eq!(stack.depth(), 1);
            assert_eq!(stack.lookup("@index"), Some(json!(0)));
        }
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.lookup("@item"), None);
    }

    #[test]
    fn fingerprint_is_stable_and_scope_sensitive() {
        let stack = ScopeStack::new();
        assert_eq!(stack.fingerprint(), 0);

        stack.push(ScopeFrame::iterate(json!("a"), 0));
        let first = stack.fingerprint();
        assert_ne!(first, 0);
        assert_eq!(first, stack.fingerprint());

        stack.pop();
        stack.push(ScopeFrame::iterate(json!("a"), 1));
        assert_ne!(stack.fingerprint(), first);

        stack.pop();
        stack.push(ScopeFrame::iterate(json!("a"), 0));
        assert_eq!(stack.fingerprint(), first);
    }
}
