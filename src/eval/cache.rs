//! Per-request memoization of handler results.
//!
//! Keys are `(node id, scope fingerprint)`: the same node under a different
//! iterate/pipeline scope is a different cache entry. Handlers never touch
//! this cache; the invocation adapter owns all reads and writes.

use dashmap::DashMap;

use crate::error::HandlerError;
use crate::node::NodeId;

/// A cached handler outcome. Errors are cached too - replaying a failed
/// evaluation yields the same failure.
pub type CachedResult = Result<serde_json::Value, HandlerError>;

#[derive(Default)]
pub struct ThunkCacheManager {
    entries: DashMap<(NodeId, u64), CachedResult>,
}

impl ThunkCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: NodeId, fingerprint: u64) -> Option<CachedResult> {
        self.entries
            .get(&(node, fingerprint))
            .map(|entry| entry.value().clone())
    }

    pub fn insert(&self, node: NodeId, fingerprint: u64, result: CachedResult) {
        self.entries.insert((node, fingerprint), result);
    }

    /// Drop every entry for a node, across all scopes.
    pub fn invalidate(&self, node: NodeId) {
        self.entries.retain(|(id, _), _| *id != node);
    }

    pub fn invalidate_many<I: IntoIterator<Item = NodeId>>(&self, nodes: I) {
        let doomed: rustc_hash::FxHashSet<NodeId> = nodes.into_iter().collect();
        if doomed.is_empty() {
            return;
        }
        self.entries.retain(|(id, _), _| !doomed.contains(id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeIdGenerator;
    use serde_json::json;

    #[test]
    fn results_are_keyed_by_node_and_scope() {
        let ids = NodeIdGenerator::new();
        let node = ids.ast_id();
        let cache = ThunkCacheManager::new();

        cache.insert(node, 0, Ok(json!("bare")));
        cache.insert(node, 42, Ok(json!("scoped")));

        assert_eq!(cache.get(node, 0), Some(Ok(json!("bare"))));
        assert_eq!(cache.get(node, 42), Some(Ok(json!("scoped"))));
        assert_eq!(cache.get(node, 7), None);
    }

    #[test]
    fn invalidate_drops_all_scopes_of_a_node() {
        let ids = NodeIdGenerator::new();
        let a = ids.ast_id();
        let b = ids.ast_id();
        let cache = ThunkCacheManager::new();

        cache.insert(a, 0, Ok(json!(1)));
        cache.insert(a, 9, Ok(json!(2)));
        cache.insert(b, 0, Ok(json!(3)));

        cache.invalidate(a);
        assert_eq!(cache.get(a, 0), None);
        assert_eq!(cache.get(a, 9), None);
        assert_eq!(cache.get(b, 0), Some(Ok(json!(3))));
    }
}
