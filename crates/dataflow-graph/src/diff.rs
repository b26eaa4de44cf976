use std::any::Any;

use dataflow_core::{AnyValue, NodeHandle, PortId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Create,
    Destroy,
    ResizeBuffer,
    ResizePortArray,
    DataUpdate,
}

/// A request, raised during [`dataflow_core::InitContext::request_buffer_size`],
/// to install a freshly sized default buffer into an output port's cell.
pub struct BufferResize {
    pub node: NodeHandle,
    pub output_port: PortId,
    pub value: Box<dyn Any + Send + Sync>,
}

#[derive(Debug, Clone, Copy)]
pub struct PortArrayResize {
    pub node: NodeHandle,
    pub port: PortId,
    pub size: u16,
}

pub enum DataUpdate {
    Set(AnyValue),
    Retain,
}

pub struct DataUpdateCommand {
    pub node: NodeHandle,
    pub port: PortId,
    pub array_index: Option<u16>,
    pub update: DataUpdate,
}

/// The ordered record of every simulation mutation since the last
/// `update()`, handed to the render world and then discarded. Five parallel
/// append-only lists plus a single ordered `(kind, index)` stream preserving
/// issue order across all of them, generalized from the teacher's
/// `ScheduleHeapData` (itself a diff-shaped bundle of node adds/removals
/// handed from graph to processor), widened to the five command kinds here.
#[derive(Default)]
pub struct GraphDiff {
    pub created: Vec<NodeHandle>,
    pub destroyed: Vec<NodeHandle>,
    pub buffer_resizes: Vec<BufferResize>,
    pub port_array_resizes: Vec<PortArrayResize>,
    pub data_updates: Vec<DataUpdateCommand>,
    pub command_stream: Vec<(CommandKind, usize)>,
}

impl GraphDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.command_stream.is_empty()
    }

    pub fn push_create(&mut self, node: NodeHandle) {
        let idx = self.created.len();
        self.created.push(node);
        self.command_stream.push((CommandKind::Create, idx));
    }

    pub fn push_destroy(&mut self, node: NodeHandle) {
        let idx = self.destroyed.len();
        self.destroyed.push(node);
        self.command_stream.push((CommandKind::Destroy, idx));
    }

    pub fn push_resize_buffer(&mut self, node: NodeHandle, output_port: PortId, value: Box<dyn Any + Send + Sync>) {
        let idx = self.buffer_resizes.len();
        self.buffer_resizes.push(BufferResize { node, output_port, value });
        self.command_stream.push((CommandKind::ResizeBuffer, idx));
    }

    pub fn push_resize_port_array(&mut self, node: NodeHandle, port: PortId, size: u16) {
        let idx = self.port_array_resizes.len();
        self.port_array_resizes.push(PortArrayResize { node, port, size });
        self.command_stream.push((CommandKind::ResizePortArray, idx));
    }

    pub fn push_data_update(&mut self, node: NodeHandle, port: PortId, array_index: Option<u16>, update: DataUpdate) {
        let idx = self.data_updates.len();
        self.data_updates.push(DataUpdateCommand { node, port, array_index, update });
        self.command_stream.push((CommandKind::DataUpdate, idx));
    }

    /// Hand off the current diff and leave an empty one in its place, the way
    /// `update()` replaces the simulation's pending diff each tick.
    pub fn take(&mut self) -> GraphDiff {
        std::mem::take(self)
    }

    pub fn checkpoint(&self) -> DiffCheckpoint {
        DiffCheckpoint {
            created: self.created.len(),
            destroyed: self.destroyed.len(),
            buffer_resizes: self.buffer_resizes.len(),
            port_array_resizes: self.port_array_resizes.len(),
            data_updates: self.data_updates.len(),
            command_stream: self.command_stream.len(),
        }
    }

    /// Discards everything pushed since `point`, used to roll back a failed
    /// `create`'s `Create` command and any buffer-resize/data-update side
    /// effects its `init` queued before returning `Err`.
    pub fn rollback_to(&mut self, point: DiffCheckpoint) {
        self.created.truncate(point.created);
        self.destroyed.truncate(point.destroyed);
        self.buffer_resizes.truncate(point.buffer_resizes);
        self.port_array_resizes.truncate(point.port_array_resizes);
        self.data_updates.truncate(point.data_updates);
        self.command_stream.truncate(point.command_stream);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiffCheckpoint {
    created: usize,
    destroyed: usize,
    buffer_resizes: usize,
    port_array_resizes: usize,
    data_updates: usize,
    command_stream: usize,
}
