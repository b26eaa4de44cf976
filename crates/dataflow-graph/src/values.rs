use std::any::Any;
use std::sync::Arc;

use ahash::AHashMap;

use dataflow_core::{BufferOwnership, Handle, NodeHandle, PortBinding, PortId};

use crate::error::EngineError;
use crate::render::RenderWorld;
use crate::scheduler::Fence;
use crate::slab::VersionedSlab;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphValueHandle(pub(crate) Handle);

enum GraphValueState {
    JustCreated,
    PostRender(Arc<Fence>),
}

struct GraphValueEntry {
    node: NodeHandle,
    output_port: PortId,
    state: GraphValueState,
}

/// External read-back taps onto output data ports. Every resident
/// value is rebound to the tick's completion fence each time a render runs;
/// a value created mid-tick starts `JustCreated` and only becomes resolvable
/// after its first render.
pub struct GraphValueStore {
    slab: VersionedSlab<GraphValueEntry>,
    consumer_fences: Vec<Arc<Fence>>,
}

impl GraphValueStore {
    pub fn with_capacity(container_id: u16, capacity: usize) -> Self {
        Self {
            slab: VersionedSlab::with_capacity(container_id, capacity),
            consumer_fences: Vec::new(),
        }
    }

    pub fn create(&mut self, node: NodeHandle, output_port: PortId) -> GraphValueHandle {
        let raw = self.slab.insert(GraphValueEntry {
            node,
            output_port,
            state: GraphValueState::JustCreated,
        });
        GraphValueHandle(raw)
    }

    pub fn release(&mut self, handle: GraphValueHandle) -> Result<(), EngineError> {
        self.slab.remove(handle.0).map(|_| ()).ok_or(EngineError::InvalidHandle)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    /// Called once per tick, after scheduling, to bind every resident value
    /// to that render's completion fence.
    pub fn mark_rendered(&mut self, fence: Arc<Fence>) {
        for (_, entry) in self.slab.iter_mut() {
            entry.state = GraphValueState::PostRender(fence.clone());
        }
    }

    /// Blocks on the value's fence (if it has rendered at least once), then
    /// reads its bound output port as `T`.
    pub fn get_value_blocking<T: Any + Clone>(
        &self,
        world: &RenderWorld,
        handle: GraphValueHandle,
    ) -> Result<T, EngineError> {
        let entry = self.slab.get(handle.0).ok_or(EngineError::InvalidHandle)?;
        let fence = match &entry.state {
            GraphValueState::JustCreated => return Err(EngineError::NotFound),
            GraphValueState::PostRender(fence) => fence.clone(),
        };
        fence.wait();

        let kernel_node = world.get(entry.node).ok_or(EngineError::InvalidHandle)?;
        let port_idx = kernel_node
            .layout
            .outputs
            .iter()
            .position(|p| p.id == entry.output_port)
            .ok_or(EngineError::NotFound)?;
        let binding = &kernel_node.outputs[port_idx];
        let value_ref = binding.read::<T>().ok_or(EngineError::TypeMismatch)?;
        Ok(value_ref.clone())
    }

    /// Snapshots every post-render value's port cell into a thread-safe
    /// [`Resolver`], plus the fence a background reader must have completed
    /// against before those cells are trustworthy.
    pub fn get_resolver(&self, world: &RenderWorld) -> (Resolver, Arc<Fence>) {
        let mut values = AHashMap::new();
        let mut dep: Option<Arc<Fence>> = None;

        for (raw, entry) in self.slab.iter() {
            if let GraphValueState::PostRender(fence) = &entry.state {
                if let Some(kn) = world.get(entry.node) {
                    if let Some(idx) = kn.layout.outputs.iter().position(|p| p.id == entry.output_port) {
                        values.insert(GraphValueHandle(raw), kn.outputs[idx].clone());
                    }
                }
                dep = Some(fence.clone());
            }
        }

        let dep = dep.unwrap_or_else(|| {
            let f = Fence::new();
            f.signal();
            f
        });
        (Resolver { values: Arc::new(values) }, dep)
    }

    /// Records a background consumer's completion fence so the next render
    /// can join it before reusing/freeing the buffers the consumer read.
    pub fn inject_dependency_from_consumer(&mut self, fence: Arc<Fence>) {
        self.consumer_fences.push(fence);
    }

    /// Joins and clears every injected consumer fence. Called at the start
    /// of the next `update()`, before the render world is touched.
    pub fn join_consumer_fences(&mut self) {
        for fence in self.consumer_fences.drain(..) {
            fence.wait();
        }
    }
}

/// A thread-safe snapshot of every post-render graph value's port cell,
/// safe to read from background jobs. Buffers read through it are read-only.
#[derive(Clone)]
pub struct Resolver {
    values: Arc<AHashMap<GraphValueHandle, PortBinding>>,
}

impl Resolver {
    pub fn read<T: Any + Clone>(&self, handle: GraphValueHandle) -> Option<T> {
        self.values.get(&handle)?.read::<T>().map(|r| r.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchHandle(pub(crate) Handle);

pub struct InputBatchRecord {
    pub node: NodeHandle,
    pub port: PortId,
    pub value: Box<dyn Any + Send + Sync>,
}

struct BatchEntry {
    records: Option<Vec<InputBatchRecord>>,
    input_fence: Option<Arc<Fence>>,
    completion_fence: Option<Arc<Fence>>,
}

/// Externally submitted per-port memory overrides valid for one tick.
/// A batch targets "the next render": there is no multi-tick-ahead
/// scheduling in this synchronous `update()` model, so "submitting for a
/// future render that has not yet scheduled" has no separate code path to
/// guard: the next render is always the only one a submit can target.
pub struct InputBatchStore {
    slab: VersionedSlab<BatchEntry>,
}

impl InputBatchStore {
    pub fn with_capacity(container_id: u16, capacity: usize) -> Self {
        Self {
            slab: VersionedSlab::with_capacity(container_id, capacity),
        }
    }

    pub fn submit(&mut self, records: Vec<InputBatchRecord>, input_fence: Option<Arc<Fence>>) -> BatchHandle {
        let raw = self.slab.insert(BatchEntry {
            records: Some(records),
            input_fence,
            completion_fence: None,
        });
        BatchHandle(raw)
    }

    pub fn get_dependencies(&self, handle: BatchHandle) -> Result<Arc<Fence>, EngineError> {
        let entry = self.slab.get(handle.0).ok_or(EngineError::InvalidHandle)?;
        entry.completion_fence.clone().ok_or(EngineError::NotFound)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    /// Disposes batches that rendered last tick and were never re-queried,
    /// then drains every still-pending batch into the render world as
    /// `OwnedByBatch` bindings. Called once per tick, before scheduling.
    pub fn apply_due_batches(&mut self, world: &mut RenderWorld) {
        let stale: Vec<Handle> = self
            .slab
            .iter()
            .filter(|(_, e)| e.records.is_none() && e.completion_fence.is_some())
            .map(|(h, _)| h)
            .collect();
        for raw in stale {
            self.slab.remove(raw);
        }

        let pending: Vec<Handle> = self
            .slab
            .iter()
            .filter(|(_, e)| e.records.is_some())
            .map(|(h, _)| h)
            .collect();

        for raw in pending {
            if let Some(entry) = self.slab.get(raw) {
                if let Some(f) = &entry.input_fence {
                    f.wait();
                }
            }
            let records = match self.slab.get_mut(raw) {
                Some(entry) => entry.records.take().unwrap_or_default(),
                None => continue,
            };
            for record in records {
                if let Some(kn) = world.get_mut(record.node) {
                    kn.batch_overrides
                        .insert(record.port, PortBinding::bound(record.value, BufferOwnership::OwnedByBatch));
                }
            }
        }
    }

    /// Stamps the tick's completion fence onto every batch applied this tick.
    pub fn finish_tick(&mut self, fence: Arc<Fence>) {
        for (_, entry) in self.slab.iter_mut() {
            if entry.records.is_none() && entry.completion_fence.is_none() {
                entry.completion_fence = Some(fence.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_core::{NodeLayout, PortDesc, PortUsage};
    use std::any::TypeId;

    fn node(idx: u32) -> NodeHandle {
        NodeHandle {
            raw: Handle { index: idx, version: 0, container_id: 0 },
            debug_name: "test",
        }
    }

    fn layout_with_output() -> NodeLayout {
        NodeLayout {
            inputs: Vec::new(),
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
    fn just_created_value_is_not_yet_resolvable() {
        let mut store = GraphValueStore::with_capacity(0, 4);
        let world = RenderWorld::new();
        let n = node(0);
        let handle = store.create(n, PortId(0));
        let result = store.get_value_blocking::<i32>(&world, handle);
        assert_eq!(result, Err(EngineError::NotFound));
    }

    #[test]
    fn value_resolves_after_mark_rendered() {
        use crate::diff::GraphDiff;

        let mut world = RenderWorld::new();
        let mut diff = GraphDiff::new();
        let n = node(0);
        diff.push_create(n);
        world.apply_diff(diff, |_| Some((layout_with_output(), None)));

        if let Some(kn) = world.get_mut(n) {
            kn.outputs[0] = PortBinding::bound(Box::new(7i32), BufferOwnership::OwnedByPort);
        }

        let mut store = GraphValueStore::with_capacity(0, 4);
        let handle = store.create(n, PortId(0));
        let fence = Fence::new();
        fence.signal();
        store.mark_rendered(fence);

        assert_eq!(store.get_value_blocking::<i32>(&world, handle), Ok(7));
    }

    #[test]
    fn batch_is_disposed_one_apply_after_completion() {
        let mut world = RenderWorld::new();
        let mut batches = InputBatchStore::with_capacity(0, 4);
        let n = node(0);

        let handle = batches.submit(
            vec![InputBatchRecord { node: n, port: PortId(0), value: Box::new(9i32) }],
            None,
        );
        batches.apply_due_batches(&mut world);
        assert!(batches.get_dependencies(handle).is_err());

        let fence = Fence::new();
        fence.signal();
        batches.finish_tick(fence);
        assert!(batches.get_dependencies(handle).is_ok());

        batches.apply_due_batches(&mut world);
        assert!(batches.get_dependencies(handle).is_err());
        assert_eq!(batches.len(), 0);
    }
}
