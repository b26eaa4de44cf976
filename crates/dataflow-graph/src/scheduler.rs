use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use dataflow_core::KernelContext;

use crate::render::{KernelNode, RenderWorld};
use crate::topology::TopologyCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionModel {
    /// One job per kernel node; gated on each masked parent's fence.
    /// Compiled from `GlobalBreadthFirst`.
    MaximallyParallel,
    /// One job walking the whole `ordered_traversal` in order. Also compiled
    /// from `GlobalBreadthFirst`, so it shares a topology computation with
    /// `MaximallyParallel`.
    SingleThreaded,
    /// One job per `LocalDepthFirst` island, each executing its range in order.
    Islands,
    /// Inline on the calling thread, in whatever order is already resident
    /// (never forces a re-sort).
    Synchronous,
}

impl Default for ExecutionModel {
    fn default() -> Self {
        ExecutionModel::SingleThreaded
    }
}

/// A generation-free completion flag with a condvar, shared across threads
/// via `Arc`. The opaque handle `update()` hands back to mark tick completion.
pub struct Fence {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Fence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn signal(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cond.wait(done).unwrap();
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.done.lock().unwrap()
    }
}

fn execute_kernel_node(kn: &mut KernelNode) {
    let KernelNode { kernel, inputs, outputs, .. } = kn;
    if let Some(kernel) = kernel.as_mut() {
        let mut ctx = KernelContext {
            inputs: inputs.as_slice(),
            outputs: outputs.as_slice(),
        };
        kernel.execute(&mut ctx);
    }
}

/// Executes one tick's kernel jobs against a topology cache, respecting the
/// chosen [`ExecutionModel`]. `MaximallyParallel`/`Islands` spawn scoped
/// threads for the duration of the call; this keeps the whole parallel
/// section inside `update()`'s call stack rather than needing a persistent
/// background pool, matching "`update()` is atomic".
pub struct RenderScheduler {
    pub model: ExecutionModel,
}

impl RenderScheduler {
    pub fn new(model: ExecutionModel) -> Self {
        Self { model }
    }

    /// Runs every live kernel node once. Returns the tick's root fence,
    /// already signaled by the time this call returns: there is no
    /// asynchronous tail, only a handle callers can still poll/join later
    /// for symmetry with `NodeSet::update()`'s own fence return.
    pub fn run(&self, world: &mut RenderWorld, topology: &TopologyCache) -> Arc<Fence> {
        match self.model {
            ExecutionModel::SingleThreaded | ExecutionModel::Synchronous => {
                self.run_linear(world, topology)
            }
            ExecutionModel::MaximallyParallel => self.run_maximally_parallel(world, topology),
            ExecutionModel::Islands => self.run_islands(world, topology),
        }
    }

    fn run_linear(&self, world: &mut RenderWorld, topology: &TopologyCache) -> Arc<Fence> {
        for slot in &topology.ordered_traversal {
            if let Some(kn) = world.get_mut(slot.node) {
                execute_kernel_node(kn);
            }
        }
        let fence = Fence::new();
        fence.signal();
        fence
    }

    fn run_maximally_parallel(&self, world: &mut RenderWorld, topology: &TopologyCache) -> Arc<Fence> {
        let n = topology.ordered_traversal.len();
        let root = Fence::new();
        if n == 0 {
            root.signal();
            return root;
        }

        let fences: Vec<Arc<Fence>> = (0..n).map(|_| Fence::new()).collect();
        let mut slots: Vec<Option<&mut KernelNode>> =
            world.nodes_mut().iter_mut().map(|s| s.as_mut()).collect();

        thread::scope(|scope| {
            for (i, slot) in topology.ordered_traversal.iter().enumerate() {
                let raw_idx = slot.node.raw.index as usize;
                let kernel_node = if raw_idx < slots.len() { slots[raw_idx].take() } else { None };
                let parent_fences: Vec<Arc<Fence>> = topology.parent_table
                    [slot.parent_offset..slot.parent_offset + slot.parent_count]
                    .iter()
                    .map(|p| fences[p.peer_index].clone())
                    .collect();
                let own_fence = fences[i].clone();

                scope.spawn(move || {
                    for parent in &parent_fences {
                        parent.wait();
                    }
                    if let Some(kn) = kernel_node {
                        execute_kernel_node(kn);
                    }
                    own_fence.signal();
                });
            }
        });

        // Overall completion = every sink (zero masked out-edges) vertex done.
        for &sink_idx in &topology.roots {
            fences[sink_idx].wait();
        }
        root.signal();
        root
    }

    fn run_islands(&self, world: &mut RenderWorld, topology: &TopologyCache) -> Arc<Fence> {
        let root = Fence::new();
        if topology.islands.is_empty() {
            root.signal();
            return root;
        }

        let mut slots: Vec<Option<&mut KernelNode>> =
            world.nodes_mut().iter_mut().map(|s| s.as_mut()).collect();

        thread::scope(|scope| {
            for &(start, count) in &topology.islands {
                let island_slots: Vec<Option<&mut KernelNode>> = (start..start + count)
                    .map(|i| {
                        let raw_idx = topology.ordered_traversal[i].node.raw.index as usize;
                        if raw_idx < slots.len() { slots[raw_idx].take() } else { None }
                    })
                    .collect();

                scope.spawn(move || {
                    for kn in island_slots.into_iter().flatten() {
                        execute_kernel_node(kn);
                    }
                });
            }
        });

        root.signal();
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionDatabase;
    use crate::diff::GraphDiff;
    use crate::topology::SortStrategy;
    use dataflow_core::{BufferOwnership, Handle, NodeHandle, NodeLayout, PortBinding, PortDesc, PortId, PortUsage};
    use std::any::TypeId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(idx: u32) -> NodeHandle {
        NodeHandle {
            raw: Handle { index: idx, version: 0, container_id: 0 },
            debug_name: "test",
        }
    }

    struct CountingKernel(Arc<AtomicUsize>);

    impl dataflow_core::Kernel for CountingKernel {
        fn execute(&mut self, _ctx: &mut KernelContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn layout() -> NodeLayout {
        NodeLayout {
            inputs: vec![PortDesc {
                id: PortId(0),
                usage: PortUsage::Data,
                value_type: TypeId::of::<i32>(),
                value_type_name: "i32",
                is_array: false,
                buffers: Vec::new(),
            }],
            outputs: vec![PortDesc {
                id: PortId(0),
                usage: PortUsage::Data,
                value_type: TypeId::of::<i32>(),
                value_type_name: "i32",
                is_array: false,
                buffers: Vec::new(),
            }],
        }
    }

    #[test]
    fn linear_model_executes_every_kernel() {
        let mut world = RenderWorld::new();
        let mut diff = GraphDiff::new();
        let a = node(0);
        let b = node(1);
        diff.push_create(a);
        diff.push_create(b);

        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let mut built = 0;
        world.apply_diff(diff, |_| {
            built += 1;
            let c = if built == 1 { counter.clone() } else { counter2.clone() };
            Some((layout(), Some(Box::new(CountingKernel(c)) as Box<dyn dataflow_core::Kernel>)))
        });

        let mut db = ConnectionDatabase::with_capacity(4);
        db.connect(a, PortId(0), b, PortId(0), None, crate::connection::TraversalFlags::DATA).unwrap();

        let mut topo = TopologyCache::default();
        topo.compute(
            &[a, b],
            &db,
            SortStrategy::GlobalBreadthFirst,
            crate::connection::TraversalFlags::DATA,
            crate::connection::TraversalFlags::empty(),
        );

        let scheduler = RenderScheduler::new(ExecutionModel::SingleThreaded);
        let fence = scheduler.run(&mut world, &topo);
        assert!(fence.is_complete());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn maximally_parallel_respects_dependency_order() {
        let mut world = RenderWorld::new();
        let mut diff = GraphDiff::new();
        let a = node(0);
        let b = node(1);
        diff.push_create(a);
        diff.push_create(b);
        world.apply_diff(diff, |_| Some((layout(), None)));

        if let Some(kn) = world.get_mut(a) {
            kn.outputs[0] = PortBinding::bound(Box::new(1i32), BufferOwnership::OwnedByPort);
        }

        let mut db = ConnectionDatabase::with_capacity(4);
        db.connect(a, PortId(0), b, PortId(0), None, crate::connection::TraversalFlags::DATA).unwrap();

        let mut topo = TopologyCache::default();
        topo.compute(
            &[a, b],
            &db,
            SortStrategy::GlobalBreadthFirst,
            crate::connection::TraversalFlags::DATA,
            crate::connection::TraversalFlags::empty(),
        );

        let scheduler = RenderScheduler::new(ExecutionModel::MaximallyParallel);
        let fence = scheduler.run(&mut world, &topo);
        assert!(fence.is_complete());
    }
}
