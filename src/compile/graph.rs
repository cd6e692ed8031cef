//! Typed dependency graph over compiled nodes.
//!
//! Edge direction is producer → consumer: an edge `u → v` declares that `u`
//! must be evaluated before `v`. Structural edges run parent → child and are
//! navigational only; the DAG invariant (and the topological order used by
//! the async-flag pass) is checked over the evaluation-order kinds
//! (data/control/effect flow), since a child's data-flow edge back to its
//! parent would otherwise always form a two-cycle with the structural edge.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::CompileError;
use crate::node::NodeId;

/// Edge kinds, in the spirit of the four dependency classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Parent → child along structural positions.
    Structural,
    /// Value dependency: producer → consumer.
    DataFlow,
    /// Conditional gating (predicates, guards, `when` clauses).
    ControlFlow,
    /// Sequencing of side effects.
    EffectFlow,
}

impl EdgeKind {
    /// Whether this kind participates in evaluation ordering.
    pub fn orders_evaluation(self) -> bool {
        !matches!(self, EdgeKind::Structural)
    }
}

/// Small metadata bag carried on every edge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeMeta {
    /// Property of the consumer this edge feeds (`"predicate"`, `"steps"`).
    pub property: Option<String>,
    /// Position within a list property.
    pub index: Option<usize>,
    /// Reference namespace for pseudo-producer edges (`"answers"`, `"post"`).
    pub reference: Option<String>,
}

impl EdgeMeta {
    pub fn property(name: &str) -> Self {
        Self {
            property: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn indexed(name: &str, index: usize) -> Self {
        Self {
            property: Some(name.to_string()),
            index: Some(index),
            ..Self::default()
        }
    }

    pub fn reference(namespace: &str) -> Self {
        Self {
            reference: Some(namespace.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct EdgeInfo {
    kind: EdgeKind,
    #[allow(dead_code)] // Read by diagnostics and graph dumps
    meta: EdgeMeta,
}

/// The dependency graph: typed directed edges over node ids.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, EdgeInfo>,
    indices: FxHashMap<NodeId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a vertex exists for `id` (idempotent).
    pub fn add_node(&mut self, id: NodeId) {
        if !self.indices.contains_key(&id) {
            let idx = self.graph.add_node(id);
            self.indices.insert(id, idx);
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.indices.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Add a typed edge `from → to`; vertices are created as needed.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind, meta: EdgeMeta) {
        self.add_node(from);
        self.add_node(to);
        let from_idx = self.indices[&from];
        let to_idx = self.indices[&to];
        self.graph.add_edge(from_idx, to_idx, EdgeInfo { kind, meta });
    }

    /// Producers of `id` for one edge kind.
    pub fn dependencies_of(&self, id: NodeId, kind: EdgeKind) -> SmallVec<[NodeId; 4]> {
        self.neighbours(id, Direction::Incoming, Some(kind))
    }

    /// Consumers of `id` for one edge kind.
    pub fn dependents_of(&self, id: NodeId, kind: EdgeKind) -> SmallVec<[NodeId; 4]> {
        self.neighbours(id, Direction::Outgoing, Some(kind))
    }

    /// Producers of `id` across all evaluation-order kinds.
    pub fn value_dependencies(&self, id: NodeId) -> SmallVec<[NodeId; 4]> {
        let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
        let Some(&idx) = self.indices.get(&id) else {
            return out;
        };
        for edge in self.graph.edges_directed(idx, Direction::Incoming) {
            if edge.weight().kind.orders_evaluation() {
                let other = self.graph[edge.source()];
                if !out.contains(&other) {
                    out.push(other);
                }
            }
        }
        out
    }

    /// Consumers of `id` across all evaluation-order kinds.
    pub fn value_dependents(&self, id: NodeId) -> SmallVec<[NodeId; 4]> {
        let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
        let Some(&idx) = self.indices.get(&id) else {
            return out;
        };
        for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
            if edge.weight().kind.orders_evaluation() {
                let other = self.graph[edge.target()];
                if !out.contains(&other) {
                    out.push(other);
                }
            }
        }
        out
    }

    fn neighbours(
        &self,
        id: NodeId,
        direction: Direction,
        kind: Option<EdgeKind>,
    ) -> SmallVec<[NodeId; 4]> {
        let mut out: SmallVec<[NodeId; 4]> = SmallVec::new();
        let Some(&idx) = self.indices.get(&id) else {
            return out;
        };
        for edge in self.graph.edges_directed(idx, direction) {
            if kind.map(|k| edge.weight().kind == k).unwrap_or(true) {
                let other_idx = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                let other = self.graph[other_idx];
                if !out.contains(&other) {
                    out.push(other);
                }
            }
        }
        out
    }

    /// All node ids known to the graph.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_weights().copied().collect()
    }

    /// Copy every vertex and edge into `target` (overlay flush).
    pub fn merge_into(self, target: &mut DependencyGraph) {
        for idx in self.graph.node_indices() {
            target.add_node(self.graph[idx]);
        }
        for edge in self.graph.edge_references() {
            let info = edge.weight();
            target.add_edge(
                self.graph[edge.source()],
                self.graph[edge.target()],
                info.kind,
                info.meta.clone(),
            );
        }
    }

    /// Topological order over evaluation-order edges (producers first).
    /// Rejects cycles, naming a node on one.
    ///
    /// Kahn's algorithm with an id-ordered frontier, so the order is
    /// deterministic across runs.
    pub fn topo_order(&self) -> Result<Vec<NodeId>, CompileError> {
        let mut in_degree: FxHashMap<NodeIndex, usize> = FxHashMap::default();
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, 0);
        }
        for edge in self.graph.edge_references() {
            if edge.weight().kind.orders_evaluation() {
                *in_degree.entry(edge.target()).or_insert(0) += 1;
            }
        }

        let mut frontier: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(idx, _)| *idx)
            .collect();
        frontier.sort_by_key(|idx| self.graph[*idx]);

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(idx) = frontier.pop() {
            order.push(self.graph[idx]);
            let mut released: Vec<NodeIndex> = Vec::new();
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                if !edge.weight().kind.orders_evaluation() {
                    continue;
                }
                let entry = in_degree.get_mut(&edge.target()).expect("known vertex");
                *entry -= 1;
                if *entry == 0 {
                    released.push(edge.target());
                }
            }
            released.sort_by_key(|idx| self.graph[*idx]);
            for idx in released {
                frontier.push(idx);
            }
        }

        if order.len() != self.graph.node_count() {
            let stuck = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(idx, _)| self.graph[*idx])
                .min()
                .expect("cycle has members");
            return Err(CompileError::Cycle { id: stuck });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeIdGenerator;

    #[test]
    fn edges_record_typed_neighbours() {
        let ids = NodeIdGenerator::new();
        let a = ids.ast_id();
        let b = ids.ast_id();
        let c = ids.ast_id();

        let mut graph = DependencyGraph::new();
        graph.add_edge(a, c, EdgeKind::DataFlow, EdgeMeta::indexed("operands", 0));
        graph.add_edge(b, c, EdgeKind::ControlFlow, EdgeMeta::property("when"));

        assert_eq!(graph.dependencies_of(c, EdgeKind::DataFlow).as_slice(), &[a]);
        assert_eq!(
            graph.dependencies_of(c, EdgeKind::ControlFlow).as_slice(),
            &[b]
        );
        assert_eq!(graph.dependents_of(a, EdgeKind::DataFlow).as_slice(), &[c]);
        assert_eq!(graph.value_dependencies(c).len(), 2);
    }

    #[test]
    fn topo_order_puts_producers_first() {
        let ids = NodeIdGenerator::new();
        let a = ids.ast_id();
        let b = ids.ast_id();
        let c = ids.ast_id();

        let mut graph = DependencyGraph::new();
        graph.add_edge(a, b, EdgeKind::DataFlow, EdgeMeta::default());
        graph.add_edge(b, c, EdgeKind::DataFlow, EdgeMeta::default());

        let order = graph.topo_order().unwrap();
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn structural_edges_do_not_make_cycles() {
        let ids = NodeIdGenerator::new();
        let parent = ids.ast_id();
        let child = ids.ast_id();

        let mut graph = DependencyGraph::new();
        // parent → child structurally, child → parent as data flow: legal.
        graph.add_edge(parent, child, EdgeKind::Structural, EdgeMeta::default());
        graph.add_edge(child, parent, EdgeKind::DataFlow, EdgeMeta::default());

        assert!(graph.topo_order().is_ok());
    }

    #[test]
    fn data_flow_cycles_are_rejected() {
        let ids = NodeIdGenerator::new();
        let a = ids.ast_id();
        let b = ids.ast_id();

        let mut graph = DependencyGraph::new();
        graph.add_edge(a, b, EdgeKind::DataFlow, EdgeMeta::default());
        graph.add_edge(b, a, EdgeKind::DataFlow, EdgeMeta::default());

        let err = graph.topo_order().unwrap_err();
        assert!(matches!(err, CompileError::Cycle { .. }));
    }
}
