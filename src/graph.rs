//! The node/edge/subgraph data model.
//!
//! Nodes are dense indices; each node owns two power-of-two spans into a
//! shared edge vector, managed by the span pool. Edges are never
//! deduplicated; downstream passes must tolerate multiple edges between
//! the same pair of nodes.

use bitflags::bitflags;

use crate::arena::{PoolItem, Span, SpanPool};
use crate::error::Result;

pub const INDEX_NONE: u32 = !0u32;

/// Identifies a node in the graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies a subgraph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SubgraphId(pub u32);

impl SubgraphId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An ordered dependency between two nodes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Edge {
    pub src: NodeId,
    pub dst: NodeId,
}

impl PoolItem for Edge {
    fn from_free_link(next: u32) -> Edge {
        Edge {
            src: NodeId(next),
            dst: NodeId(0),
        }
    }

    fn free_link(&self) -> u32 {
        self.src.0
    }
}

bitflags! {
    pub struct SubgraphFlags: u32 {
        /// Members must not be interleaved with non-members by the
        /// scheduler.
        const ATOMIC = 1 << 0;
        /// Members must execute in declaration order.
        const SEQUENTIAL = 1 << 1;
    }
}

/// A contiguous scoped run of nodes.
#[derive(Copy, Clone, Debug)]
pub struct Subgraph {
    pub parent_subgraph: u32,
    pub flags: SubgraphFlags,
    pub begin_node: NodeId,
    pub end_node: NodeId,
}

impl Subgraph {
    pub fn is_atomic(&self) -> bool {
        self.flags.contains(SubgraphFlags::ATOMIC)
    }

    pub fn is_sequential(&self) -> bool {
        self.flags.contains(SubgraphFlags::SEQUENTIAL)
    }
}

/// A unit of work: a command, a transition, or a built-in marker.
///
/// `cmd_id >= 0` indexes the command list. After access analysis,
/// `cmd_id < 0` encodes a transition as the bitwise negation of the
/// transition index.
#[derive(Copy, Clone, Debug)]
pub struct Node {
    pub cmd_id: i32,
    pub in_edges: Span,
    pub out_edges: Span,
    pub subgraph: u32,
    pub barrier_scope: u32,
}

impl Node {
    fn new(cmd_id: i32) -> Node {
        Node {
            cmd_id,
            in_edges: Span::EMPTY,
            out_edges: Span::EMPTY,
            subgraph: INDEX_NONE,
            barrier_scope: 0,
        }
    }

    pub fn is_transition(&self) -> bool {
        self.cmd_id < 0
    }

    pub fn transition_index(&self) -> u32 {
        debug_assert!(self.is_transition());
        !self.cmd_id as u32
    }

    pub fn cmd_index(&self) -> u32 {
        debug_assert!(!self.is_transition());
        self.cmd_id as u32
    }
}

/// Encodes a transition index into the node `cmd_id` field.
pub fn transition_cmd_id(transition_index: u32) -> i32 {
    !(transition_index as i32)
}

pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    subgraphs: Vec<Subgraph>,
    edge_list_pool: SpanPool<Edge>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph {
            nodes: Vec::new(),
            edges: Vec::new(),
            subgraphs: Vec::new(),
            edge_list_pool: SpanPool::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn subgraphs(&self) -> &[Subgraph] {
        &self.subgraphs
    }

    pub fn subgraph(&self, id: SubgraphId) -> &Subgraph {
        &self.subgraphs[id.index()]
    }

    pub fn subgraph_mut(&mut self, id: SubgraphId) -> &mut Subgraph {
        &mut self.subgraphs[id.index()]
    }

    pub fn in_edges(&self, id: NodeId) -> &[Edge] {
        self.nodes[id.index()].in_edges.get(&self.edges)
    }

    pub fn out_edges(&self, id: NodeId) -> &[Edge] {
        self.nodes[id.index()].out_edges.get(&self.edges)
    }

    pub fn add_node(&mut self, cmd_id: i32) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(cmd_id));
        id
    }

    /// Creates a node with duplicated in/out edge lists. Used when a
    /// transition is inserted, to split the original node's edges between
    /// the transition and the original.
    pub fn clone_node(&mut self, src: NodeId, cmd_id: i32) -> Result<NodeId> {
        let id = NodeId(self.nodes.len() as u32);
        let src_node = self.nodes[src.index()];
        let in_edges = self
            .edge_list_pool
            .clone_span(&mut self.edges, src_node.in_edges)?;
        let out_edges = self
            .edge_list_pool
            .clone_span(&mut self.edges, src_node.out_edges)?;
        self.nodes.push(Node {
            cmd_id,
            in_edges,
            out_edges,
            subgraph: src_node.subgraph,
            barrier_scope: src_node.barrier_scope,
        });
        Ok(id)
    }

    pub fn add_edge(&mut self, src: NodeId, dst: NodeId) -> Result<()> {
        let edge = Edge { src, dst };
        let mut span = self.nodes[src.index()].out_edges;
        self.edge_list_pool.push(&mut self.edges, &mut span, edge)?;
        self.nodes[src.index()].out_edges = span;

        let mut span = self.nodes[dst.index()].in_edges;
        self.edge_list_pool.push(&mut self.edges, &mut span, edge)?;
        self.nodes[dst.index()].in_edges = span;
        Ok(())
    }

    pub fn add_subgraph(
        &mut self,
        parent: u32,
        flags: SubgraphFlags,
        begin_node: NodeId,
    ) -> SubgraphId {
        let id = SubgraphId(self.subgraphs.len() as u32);
        self.subgraphs.push(Subgraph {
            parent_subgraph: parent,
            flags,
            begin_node,
            end_node: begin_node,
        });
        id
    }

    /// Walks the parent chain of `child`, `O(depth)`.
    pub fn is_parent_subgraph(&self, parent: u32, child: u32) -> bool {
        if parent == INDEX_NONE {
            return false;
        }
        let mut current = child;
        while current != INDEX_NONE {
            if current == parent {
                return true;
            }
            current = self.subgraphs[current as usize].parent_subgraph;
        }
        false
    }

    pub fn reset(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.subgraphs.clear();
        self.edge_list_pool = SpanPool::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_edge_updates_both_endpoints() {
        let mut g = Graph::new();
        let a = g.add_node(0);
        let b = g.add_node(1);
        g.add_edge(a, b).unwrap();
        g.add_edge(a, b).unwrap(); // duplicates are allowed
        assert_eq!(g.out_edges(a).len(), 2);
        assert_eq!(g.in_edges(b).len(), 2);
        assert_eq!(g.out_edges(a)[0], Edge { src: a, dst: b });
    }

    #[test]
    fn clone_node_duplicates_edge_lists() {
        let mut g = Graph::new();
        let a = g.add_node(0);
        let b = g.add_node(1);
        let c = g.add_node(2);
        g.add_edge(a, b).unwrap();
        g.add_edge(b, c).unwrap();

        let clone = g.clone_node(b, transition_cmd_id(0)).unwrap();
        assert!(g.node(clone).is_transition());
        assert_eq!(g.node(clone).transition_index(), 0);
        assert_eq!(g.in_edges(clone), g.in_edges(b));
        assert_eq!(g.out_edges(clone), g.out_edges(b));

        // Growing the original's lists does not touch the clone.
        let d = g.add_node(3);
        g.add_edge(b, d).unwrap();
        assert_eq!(g.out_edges(b).len(), 2);
        assert_eq!(g.out_edges(clone).len(), 1);
    }

    #[test]
    fn subgraph_parent_chain() {
        let mut g = Graph::new();
        let n = g.add_node(0);
        let outer = g.add_subgraph(INDEX_NONE, SubgraphFlags::ATOMIC, n);
        let inner = g.add_subgraph(outer.0, SubgraphFlags::empty(), n);
        assert!(g.is_parent_subgraph(outer.0, inner.0));
        assert!(!g.is_parent_subgraph(inner.0, outer.0));
        assert!(g.is_parent_subgraph(outer.0, outer.0));
        assert!(!g.is_parent_subgraph(INDEX_NONE, inner.0));
    }

    #[test]
    fn transition_encoding_roundtrip() {
        for idx in &[0u32, 1, 2, 1000] {
            let cmd_id = transition_cmd_id(*idx);
            assert!(cmd_id < 0);
            let node = Node {
                cmd_id,
                in_edges: Span::EMPTY,
                out_edges: Span::EMPTY,
                subgraph: INDEX_NONE,
                barrier_scope: 0,
            };
            assert!(node.is_transition());
            assert_eq!(node.transition_index(), *idx);
        }
    }
}
