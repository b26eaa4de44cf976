use std::any::{Any, TypeId};
use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dataflow_core::{AnyValue, NodeHandle, NodeKind, PortId, PortUsage};

use crate::connection::{ConnectionDatabase, ConnectionId, TraversalFlags};
use crate::diff::GraphDiff;
use crate::error::EngineError;
use crate::node_store::NodeStore;
use crate::render::RenderWorld;
use crate::scheduler::{ExecutionModel, Fence, RenderScheduler};
use crate::topology::{SortStrategy, TopologyCache};
use crate::values::{
    BatchHandle, GraphValueHandle, GraphValueStore, InputBatchRecord, InputBatchStore, Resolver,
};

/// Mirrors the teacher's `AudioGraphConfig`: initial arena capacities plus the
/// execution model new `NodeSet`s start in.
#[derive(Debug, Clone, Copy)]
pub struct NodeSetConfig {
    pub initial_node_capacity: usize,
    pub initial_connection_capacity: usize,
    pub default_execution_model: ExecutionModel,
}

impl Default for NodeSetConfig {
    fn default() -> Self {
        Self {
            initial_node_capacity: 256,
            initial_connection_capacity: 512,
            default_execution_model: ExecutionModel::default(),
        }
    }
}

fn sort_strategy_for(model: ExecutionModel) -> Option<SortStrategy> {
    match model {
        ExecutionModel::MaximallyParallel | ExecutionModel::SingleThreaded => {
            Some(SortStrategy::GlobalBreadthFirst)
        }
        ExecutionModel::Islands => Some(SortStrategy::LocalDepthFirst),
        ExecutionModel::Synchronous => None,
    }
}

/// The engine's single public handle. Owns the simulation node store, the
/// connection database, the pending diff, the topology cache, the render
/// world, and the graph-value/input-batch stores (every other type in this
/// crate is reached only through `NodeSet`'s methods).
///
/// Three `container_id`s (0/1/2) isolate node handles, graph-value handles,
/// and batch handles from one another even though all three are backed by
/// the same `VersionedSlab` primitive.
pub struct NodeSet {
    store: NodeStore,
    connections: ConnectionDatabase,
    diff: GraphDiff,
    topology: TopologyCache,
    world: RenderWorld,
    scheduler: RenderScheduler,
    graph_values: GraphValueStore,
    input_batches: InputBatchStore,
    model: ExecutionModel,
    last_fence: Arc<Fence>,
}

impl NodeSet {
    pub fn new(config: NodeSetConfig) -> Self {
        let last_fence = Fence::new();
        last_fence.signal();
        Self {
            store: NodeStore::with_capacity(0, config.initial_node_capacity),
            connections: ConnectionDatabase::with_capacity(config.initial_connection_capacity),
            diff: GraphDiff::new(),
            topology: TopologyCache::default(),
            world: RenderWorld::new(),
            scheduler: RenderScheduler::new(config.default_execution_model),
            graph_values: GraphValueStore::with_capacity(1, config.initial_node_capacity),
            input_batches: InputBatchStore::with_capacity(2, config.initial_node_capacity),
            model: config.default_execution_model,
            last_fence,
        }
    }

    pub fn topology(&self) -> &TopologyCache {
        &self.topology
    }

    /// Propagates the node kind's own `init` error type rather than folding
    /// it into `EngineError`, which describes engine-level operation
    /// failures, not arbitrary user-kind construction failures.
    pub fn create(&mut self, kind: Box<dyn NodeKind>) -> Result<NodeHandle, Box<dyn StdError>> {
        self.store.create(kind, &mut self.diff)
    }

    pub fn destroy(&mut self, handle: NodeHandle) -> Result<(), EngineError> {
        self.store.destroy(handle, &mut self.diff, &mut self.connections)
    }

    pub fn connect(
        &mut self,
        src: NodeHandle,
        src_port: PortId,
        dst: NodeHandle,
        dst_port: PortId,
        dst_array_index: Option<u16>,
        flags: TraversalFlags,
    ) -> Result<ConnectionId, EngineError> {
        let (src, src_port) = self.store.resolve_output(src, src_port);
        let (dst, dst_port) = self.store.resolve_input(dst, dst_port);

        let src_layout = self.store.layout_of(src).ok_or(EngineError::InvalidHandle)?;
        let dst_layout = self.store.layout_of(dst).ok_or(EngineError::InvalidHandle)?;
        let src_desc = src_layout.output(src_port).ok_or(EngineError::NotFound)?;
        let dst_desc = dst_layout.input(dst_port).ok_or(EngineError::NotFound)?;
        if src_desc.value_type != dst_desc.value_type {
            return Err(EngineError::TypeMismatch);
        }
        if dst_desc.is_array {
            if let Some(idx) = dst_array_index {
                let size = self.store.port_array_size(dst, dst_port).unwrap_or(0);
                if idx >= size {
                    return Err(EngineError::IndexOutOfRange);
                }
            }
        }

        self.connections
            .connect(src, src_port, dst, dst_port, dst_array_index, flags)
            .map_err(|_| EngineError::AlreadyConnected)
    }

    pub fn disconnect(&mut self, connection: ConnectionId) -> Result<(), EngineError> {
        self.connections
            .disconnect(connection)
            .map(|_| ())
            .ok_or(EngineError::NotConnected)
    }

    pub fn disconnect_ports(
        &mut self,
        src: NodeHandle,
        src_port: PortId,
        dst: NodeHandle,
        dst_port: PortId,
        dst_array_index: Option<u16>,
    ) -> Result<(), EngineError> {
        let (src, src_port) = self.store.resolve_output(src, src_port);
        let (dst, dst_port) = self.store.resolve_input(dst, dst_port);
        let id = self
            .connections
            .find(src, src_port, dst, dst_port, dst_array_index)
            .ok_or(EngineError::NotConnected)?;
        self.connections.disconnect(id);
        Ok(())
    }

    pub fn send_message(
        &mut self,
        target: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
        msg: AnyValue,
    ) -> Result<(), EngineError> {
        self.store.send_message(target, port, array_index, msg)
    }

    pub fn set_data(
        &mut self,
        target: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
        value: AnyValue,
    ) -> Result<(), EngineError> {
        self.store.set_data(&mut self.diff, &self.connections, target, port, array_index, value)
    }

    pub fn retain_data(
        &mut self,
        target: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
    ) -> Result<(), EngineError> {
        self.store.retain_data(&mut self.diff, &self.connections, target, port, array_index)
    }

    pub fn set_buffer_size(
        &mut self,
        node: NodeHandle,
        output_port: PortId,
        requested_len: usize,
    ) -> Result<(), EngineError> {
        self.store.set_buffer_size(&mut self.diff, node, output_port, requested_len)
    }

    pub fn set_port_array_size(&mut self, node: NodeHandle, port: PortId, size: u16) -> Result<(), EngineError> {
        self.store.set_port_array_size(&mut self.diff, node, port, size)
    }

    pub fn create_graph_value<T: Any>(
        &mut self,
        node: NodeHandle,
        output_port: PortId,
    ) -> Result<GraphValueHandle, EngineError> {
        let layout = self.store.layout_of(node).ok_or(EngineError::InvalidHandle)?;
        let desc = layout.output(output_port).ok_or(EngineError::NotFound)?;
        if !matches!(desc.usage, PortUsage::Data) {
            return Err(EngineError::CategoryMismatch);
        }
        if desc.value_type != TypeId::of::<T>() {
            return Err(EngineError::TypeMismatch);
        }
        Ok(self.graph_values.create(node, output_port))
    }

    pub fn release_graph_value(&mut self, handle: GraphValueHandle) -> Result<(), EngineError> {
        self.graph_values.release(handle)
    }

    pub fn get_value_blocking<T: Any + Clone>(&self, handle: GraphValueHandle) -> Result<T, EngineError> {
        self.graph_values.get_value_blocking(&self.world, handle)
    }

    pub fn get_resolver(&self) -> (Resolver, Arc<Fence>) {
        self.graph_values.get_resolver(&self.world)
    }

    pub fn inject_dependency_from_consumer(&mut self, fence: Arc<Fence>) {
        self.graph_values.inject_dependency_from_consumer(fence);
    }

    pub fn submit_input_batch(
        &mut self,
        records: Vec<InputBatchRecord>,
        input_fence: Option<Arc<Fence>>,
    ) -> BatchHandle {
        self.input_batches.submit(records, input_fence)
    }

    pub fn get_batch_dependencies(&self, handle: BatchHandle) -> Result<Arc<Fence>, EngineError> {
        self.input_batches.get_dependencies(handle)
    }

    pub fn set_execution_model(&mut self, model: ExecutionModel) {
        self.model = model;
        self.scheduler.model = model;
    }

    pub fn update(&mut self) -> Arc<Fence> {
        self.update_with_external_fence(None)
    }

    /// The `update(external_fence) -> fence` overload: joins a caller-side
    /// fence before the transition phase begins, in addition to the previous
    /// tick's own root fence.
    pub fn update_with_external_fence(&mut self, external_fence: Option<Arc<Fence>>) -> Arc<Fence> {
        self.last_fence.wait();
        if let Some(f) = external_fence {
            f.wait();
        }
        self.graph_values.join_consumer_fences();
        self.store.update_kinds();

        let diff = self.diff.take();

        if let Some(strategy) = sort_strategy_for(self.model) {
            let live = self.store.live_nodes();
            self.topology.compute(
                &live,
                &self.connections,
                strategy,
                TraversalFlags::DATA,
                TraversalFlags::MESSAGE,
            );
        }

        let NodeSet {
            store,
            connections,
            topology,
            world,
            scheduler,
            input_batches,
            ..
        } = self;

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            world.apply_diff(diff, |node| store.build_kernel(node));
            // Batch overrides must land before patching so `patch_ports` sees
            // this tick's `batch_overrides` rather than last tick's (cleared)
            // ones. The override needs to win over a live connection's cell
            // for the same input, which only `patch_ports` itself decides.
            input_batches.apply_due_batches(world);
            world.patch_ports(connections, topology);
            scheduler.run(world, topology)
        }));

        let fence = match outcome {
            Ok(fence) => fence,
            Err(_) => {
                log::error!("update: align/schedule panicked, desyncing render world");
                self.world.clear_all();
                let fence = Fence::new();
                fence.signal();
                fence
            }
        };

        self.world.clear_batch_overrides();
        self.graph_values.mark_rendered(fence.clone());
        self.input_batches.finish_tick(fence.clone());
        self.last_fence = fence.clone();
        fence
    }

    /// Forces completion of all outstanding work, then logs (but does not
    /// error on) any resources still live.
    pub fn dispose(&mut self) {
        self.last_fence.wait();
        let live_nodes = self.store.len();
        let live_connections = self.connections.len();
        let live_values = self.graph_values.len();
        if live_nodes > 0 || live_connections > 0 || live_values > 0 {
            log::error!(
                "dispose: leaked {} node(s), {} connection(s), {} graph value(s)",
                live_nodes,
                live_connections,
                live_values
            );
        }
    }
}
