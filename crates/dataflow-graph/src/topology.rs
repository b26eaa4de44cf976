use std::error::Error;
use std::fmt;

use ahash::AHashMap;
use smallvec::SmallVec;

use dataflow_core::{NodeHandle, PortId};

use crate::connection::{ConnectionDatabase, TraversalFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortStrategy {
    /// Kahn's-algorithm BFS over the whole graph as one island. Chosen by
    /// `MaximallyParallel` and `SingleThreaded`.
    GlobalBreadthFirst,
    /// Per-connected-component DFS producing one island per component.
    /// Chosen by `Islands`.
    LocalDepthFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    Cycles,
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycles => write!(f, "a cycle was detected while sorting the graph"),
        }
    }
}

impl Error for TopologyError {}

/// One entry of a peer in a slot's parent or child table: the peer's
/// position in `ordered_traversal`, the ports the edge used, and its flags.
#[derive(Debug, Clone, Copy)]
pub struct TraversalConnection {
    pub peer_index: usize,
    pub own_port: PortId,
    pub peer_port: PortId,
    pub flags: TraversalFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub node: NodeHandle,
    pub parent_offset: usize,
    pub parent_count: usize,
    pub child_offset: usize,
    pub child_count: usize,
}

/// The DAG-sorted view of the graph consumed by the render scheduler:
/// `ordered_traversal` is a topological sort of the subgraph selected by
/// `traversal_mask`, with `parent_table`/`child_table` additionally carrying
/// edges matched by `alternate_mask` so callers can enumerate a secondary
/// hierarchy without a second sort.
#[derive(Default)]
pub struct TopologyCache {
    pub ordered_traversal: Vec<Slot>,
    pub parent_table: Vec<TraversalConnection>,
    pub child_table: Vec<TraversalConnection>,
    pub leaves: Vec<usize>,
    pub roots: Vec<usize>,
    pub islands: Vec<(usize, usize)>,
    pub version: u64,
    pub errors: Vec<TopologyError>,
}

impl TopologyCache {
    pub fn is_stale(&self, last_computed_version: u64) -> bool {
        self.version != last_computed_version
    }

    pub fn index_of(&self, node: NodeHandle) -> Option<usize> {
        self.ordered_traversal.iter().position(|s| s.node == node)
    }

    /// Recompute the cache from scratch. `nodes` is the full live-vertex set;
    /// order doesn't matter, the sort determines the final order.
    pub fn compute(
        &mut self,
        nodes: &[NodeHandle],
        connections: &ConnectionDatabase,
        strategy: SortStrategy,
        traversal_mask: TraversalFlags,
        alternate_mask: TraversalFlags,
    ) {
        self.version = self.version.wrapping_add(1);
        self.errors.clear();
        self.ordered_traversal.clear();
        self.parent_table.clear();
        self.child_table.clear();
        self.leaves.clear();
        self.roots.clear();
        self.islands.clear();

        let node_index: AHashMap<NodeHandle, usize> =
            nodes.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let n = nodes.len();

        let mut parents: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); n];
        let mut children: Vec<SmallVec<[usize; 4]>> = vec![SmallVec::new(); n];

        for (i, &node) in nodes.iter().enumerate() {
            for conn in connections.inputs_of(node) {
                if !conn.flags.intersects(traversal_mask) {
                    continue;
                }
                if let Some(&p) = node_index.get(&conn.src_node) {
                    parents[i].push(p);
                }
            }
            for conn in connections.outputs_of(node) {
                if !conn.flags.intersects(traversal_mask) {
                    continue;
                }
                if let Some(&c) = node_index.get(&conn.dst_node) {
                    children[i].push(c);
                }
            }
        }

        let order = match strategy {
            SortStrategy::GlobalBreadthFirst => sort_global_breadth_first(&parents, &children),
            SortStrategy::LocalDepthFirst => sort_local_depth_first(&parents, &children),
        };

        let (order, islands) = match order {
            Ok(result) => result,
            Err(e) => {
                self.errors.push(e);
                return;
            }
        };

        self.islands = islands;

        // position[i] = slot index of original vertex i in `order`.
        let mut position = vec![0usize; n];
        for (slot_idx, &vertex) in order.iter().enumerate() {
            position[vertex] = slot_idx;
        }

        for &vertex in &order {
            let node = nodes[vertex];
            let parent_offset = self.parent_table.len();
            for conn in connections.inputs_of(node) {
                if !conn.flags.intersects(traversal_mask | alternate_mask) {
                    continue;
                }
                if let Some(&peer) = node_index.get(&conn.src_node) {
                    self.parent_table.push(TraversalConnection {
                        peer_index: position[peer],
                        own_port: conn.dst_port,
                        peer_port: conn.src_port,
                        flags: conn.flags,
                    });
                }
            }
            let parent_count = self.parent_table.len() - parent_offset;

            let child_offset = self.child_table.len();
            for conn in connections.outputs_of(node) {
                if !conn.flags.intersects(traversal_mask | alternate_mask) {
                    continue;
                }
                if let Some(&peer) = node_index.get(&conn.dst_node) {
                    self.child_table.push(TraversalConnection {
                        peer_index: position[peer],
                        own_port: conn.src_port,
                        peer_port: conn.dst_port,
                        flags: conn.flags,
                    });
                }
            }
            let child_count = self.child_table.len() - child_offset;

            if parent_count == 0 {
                self.leaves.push(self.ordered_traversal.len());
            }
            if child_count == 0 {
                self.roots.push(self.ordered_traversal.len());
            }

            self.ordered_traversal.push(Slot {
                node,
                parent_offset,
                parent_count,
                child_offset,
                child_count,
            });
        }
    }
}

/// Kahn's algorithm: in-degree counting plus BFS queue. One island covering
/// the whole graph.
fn sort_global_breadth_first(
    parents: &[SmallVec<[usize; 4]>],
    children: &[SmallVec<[usize; 4]>],
) -> Result<(Vec<usize>, Vec<(usize, usize)>), TopologyError> {
    let n = parents.len();
    let mut in_degree: Vec<usize> = parents.iter().map(|p| p.len()).collect();
    let mut queue: std::collections::VecDeque<usize> =
        (0..n).filter(|&v| in_degree[v] == 0).collect();

    let mut order = Vec::with_capacity(n);
    while let Some(v) = queue.pop_front() {
        order.push(v);
        for &c in &children[v] {
            in_degree[c] -= 1;
            if in_degree[c] == 0 {
                queue.push_back(c);
            }
        }
    }

    if order.len() != n {
        return Err(TopologyError::Cycles);
    }

    let islands = if n > 0 { vec![(0, n)] } else { Vec::new() };
    Ok((order, islands))
}

/// Per-leaf DFS: a vertex emits itself only once every masked parent has
/// emitted, then opportunistically descends into its children. Each leaf
/// that hasn't already been swept into a previous island starts a new one.
fn sort_local_depth_first(
    parents: &[SmallVec<[usize; 4]>],
    children: &[SmallVec<[usize; 4]>],
) -> Result<(Vec<usize>, Vec<(usize, usize)>), TopologyError> {
    let n = parents.len();
    let mut emitted = vec![false; n];
    let mut resolving = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut islands = Vec::new();

    fn visit(
        v: usize,
        parents: &[SmallVec<[usize; 4]>],
        children: &[SmallVec<[usize; 4]>],
        emitted: &mut [bool],
        resolving: &mut [bool],
        order: &mut Vec<usize>,
    ) -> Result<(), TopologyError> {
        if emitted[v] {
            return Ok(());
        }
        if resolving[v] {
            return Err(TopologyError::Cycles);
        }
        resolving[v] = true;
        for &p in &parents[v] {
            visit(p, parents, children, emitted, resolving, order)?;
        }
        resolving[v] = false;
        emitted[v] = true;
        order.push(v);
        for &c in &children[v] {
            visit(c, parents, children, emitted, resolving, order)?;
        }
        Ok(())
    }

    for v in 0..n {
        if !emitted[v] && parents[v].is_empty() {
            let start = order.len();
            visit(v, parents, children, &mut emitted, &mut resolving, &mut order)?;
            islands.push((start, order.len() - start));
        }
    }

    if order.len() != n {
        return Err(TopologyError::Cycles);
    }

    Ok((order, islands))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_core::Handle;

    fn node(idx: u32) -> NodeHandle {
        NodeHandle {
            raw: Handle { index: idx, version: 0, container_id: 0 },
            debug_name: "test",
        }
    }

    #[test]
    fn linear_chain_orders_parent_before_child() {
        let mut db = ConnectionDatabase::with_capacity(8);
        let a = node(0);
        let b = node(1);
        let c = node(2);
        db.connect(a, PortId(0), b, PortId(0), None, TraversalFlags::DATA).unwrap();
        db.connect(b, PortId(0), c, PortId(0), None, TraversalFlags::DATA).unwrap();

        let mut cache = TopologyCache::default();
        cache.compute(&[a, b, c], &db, SortStrategy::GlobalBreadthFirst, TraversalFlags::DATA, TraversalFlags::empty());

        assert!(cache.errors.is_empty());
        assert_eq!(cache.ordered_traversal.len(), 3);
        let ia = cache.index_of(a).unwrap();
        let ib = cache.index_of(b).unwrap();
        let ic = cache.index_of(c).unwrap();
        assert!(ia < ib);
        assert!(ib < ic);
    }

    #[test]
    fn cycle_is_detected_and_clears_ordering() {
        let mut db = ConnectionDatabase::with_capacity(8);
        let a = node(0);
        let b = node(1);
        db.connect(a, PortId(0), b, PortId(0), None, TraversalFlags::DATA).unwrap();
        db.connect(b, PortId(0), a, PortId(0), None, TraversalFlags::DATA).unwrap();

        let mut cache = TopologyCache::default();
        cache.compute(&[a, b], &db, SortStrategy::GlobalBreadthFirst, TraversalFlags::DATA, TraversalFlags::empty());

        assert_eq!(cache.errors, vec![TopologyError::Cycles]);
        assert!(cache.ordered_traversal.is_empty());
    }

    #[test]
    fn local_depth_first_produces_one_island_per_component() {
        let mut db = ConnectionDatabase::with_capacity(8);
        let a = node(0);
        let b = node(1);
        let c = node(2);
        let d = node(3);
        db.connect(a, PortId(0), b, PortId(0), None, TraversalFlags::DATA).unwrap();
        db.connect(c, PortId(0), d, PortId(0), None, TraversalFlags::DATA).unwrap();

        let mut cache = TopologyCache::default();
        cache.compute(&[a, b, c, d], &db, SortStrategy::LocalDepthFirst, TraversalFlags::DATA, TraversalFlags::empty());

        assert!(cache.errors.is_empty());
        assert_eq!(cache.islands.len(), 2);
    }
}
