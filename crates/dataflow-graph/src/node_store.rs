use std::any::{Any, TypeId};
use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};

use ahash::AHashMap;

use dataflow_core::{
    AnyValue, DestroyContext, ForwardError, Handle, InitContext, MessageContext, MessageError,
    NodeHandle, NodeKind, NodeLayout, PortId, PortUsage,
};

use crate::connection::ConnectionDatabase;
use crate::diff::{DataUpdate, GraphDiff};
use crate::error::EngineError;
use crate::slab::VersionedSlab;

/// A single flattened or raw forward declaration. `origin` is the port on the
/// declaring node; `target`/`target_port` is where it ultimately redirects.
#[derive(Debug, Clone, Copy)]
struct ForwardRecord {
    origin: PortId,
    target: NodeHandle,
    target_port: PortId,
}

/// Stands in for a node kind whose ownership has been temporarily taken out
/// of its slot so it can be called back into `self` (e.g. a recursive
/// `send_message`) without aliasing the store. Never observed by user code.
struct TombstoneKind;

impl NodeKind for TombstoneKind {
    fn debug_name(&self) -> &'static str {
        "tombstone"
    }

    fn layout(&self) -> NodeLayout {
        NodeLayout::default()
    }
}

struct NodeEntry {
    kind: Box<dyn NodeKind>,
    forwarded_inputs: Vec<ForwardRecord>,
    forwarded_outputs: Vec<ForwardRecord>,
    port_array_sizes: AHashMap<PortId, u16>,
}

/// Owns every live node kind and its forwarding/port-array state. Connections
/// and the diff live alongside it in [`crate::context::NodeSet`]; this type
/// only ever touches them through borrowed references passed into its methods.
pub struct NodeStore {
    slab: VersionedSlab<NodeEntry>,
}

impl NodeStore {
    pub fn with_capacity(container_id: u16, capacity: usize) -> Self {
        Self {
            slab: VersionedSlab::with_capacity(container_id, capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.slab.contains(handle.raw)
    }

    pub fn live_nodes(&self) -> Vec<NodeHandle> {
        self.slab
            .iter()
            .map(|(raw, entry)| NodeHandle {
                raw,
                debug_name: entry.kind.debug_name(),
            })
            .collect()
    }

    pub fn layout_of(&self, node: NodeHandle) -> Option<NodeLayout> {
        self.slab.get(node.raw).map(|e| e.kind.layout())
    }

    /// Allocate a slot, run the kind's `init`, and on success flatten any
    /// forwarding declarations it made. On `Err` the slot is rolled back
    /// and nothing is emitted into `diff`.
    pub fn create(
        &mut self,
        kind: Box<dyn NodeKind>,
        diff: &mut GraphDiff,
    ) -> Result<NodeHandle, Box<dyn StdError>> {
        let debug_name = kind.debug_name();
        let raw = self.slab.insert(NodeEntry {
            kind,
            forwarded_inputs: Vec::new(),
            forwarded_outputs: Vec::new(),
            port_array_sizes: AHashMap::new(),
        });
        let handle = NodeHandle { raw, debug_name };

        // Emitted before `init` runs so any buffer-resize/data-update command
        // `init` queues (via `InitContext::request_buffer_size`) lands after
        // this node's own `Create` in the command stream. The render world
        // needs the kernel-node slot to already exist when it processes them.
        let rollback_point = diff.checkpoint();
        diff.push_create(handle);

        let init_result = {
            let entry = self.slab.get_mut(raw).expect("just inserted");
            let NodeEntry {
                kind,
                forwarded_inputs,
                forwarded_outputs,
                ..
            } = entry;
            let mut ctx = SimInitContext {
                handle,
                forwarded_inputs,
                forwarded_outputs,
                diff,
            };
            kind.init(&mut ctx)
        };

        if let Err(e) = init_result {
            self.slab.remove(raw);
            diff.rollback_to(rollback_point);
            return Err(e);
        }

        self.flatten_forwardings(raw);
        Ok(handle)
    }

    /// Builds a node's render-side kernel from its current layout, for the
    /// render world's `Create` alignment step. Returns `None` if the node no
    /// longer exists (e.g. destroyed later in the same diff); a build error
    /// is logged and downgraded to "no kernel" rather than failing the whole
    /// diff application.
    pub fn build_kernel(&mut self, node: NodeHandle) -> Option<(NodeLayout, Option<Box<dyn dataflow_core::Kernel>>)> {
        let entry = self.slab.get_mut(node.raw)?;
        let layout = entry.kind.layout();
        match entry.kind.build_kernel(layout.inputs.len(), layout.outputs.len()) {
            Ok(kernel) => Some((layout, kernel)),
            Err(e) => {
                log::warn!("node {:?} failed to build kernel: {}", node, e);
                Some((layout, None))
            }
        }
    }

    /// One flattening pass: each freshly declared record is resolved one hop
    /// through its target's *already-flattened* forwarding list. Creation
    /// order is monotonic, so the target (if it forwards the same port
    /// itself) was necessarily created earlier and is already flat.
    fn flatten_forwardings(&mut self, raw: Handle) {
        let (mut flat_in, mut flat_out) = match self.slab.get(raw) {
            Some(entry) => (entry.forwarded_inputs.clone(), entry.forwarded_outputs.clone()),
            None => return,
        };

        for rec in flat_in.iter_mut() {
            if let Some(target) = self.slab.get(rec.target.raw) {
                if let Some(deeper) = target
                    .forwarded_inputs
                    .iter()
                    .find(|d| d.origin == rec.target_port)
                {
                    rec.target = deeper.target;
                    rec.target_port = deeper.target_port;
                }
            }
        }
        for rec in flat_out.iter_mut() {
            if let Some(target) = self.slab.get(rec.target.raw) {
                if let Some(deeper) = target
                    .forwarded_outputs
                    .iter()
                    .find(|d| d.origin == rec.target_port)
                {
                    rec.target = deeper.target;
                    rec.target_port = deeper.target_port;
                }
            }
        }

        if let Some(entry) = self.slab.get_mut(raw) {
            entry.forwarded_inputs = flat_in;
            entry.forwarded_outputs = flat_out;
        }
    }

    /// Redirect an externally addressed input port through this node's
    /// forwarding list. A single lookup; flattening guarantees one hop
    /// always reaches the terminal node/port.
    pub fn resolve_input(&self, node: NodeHandle, port: PortId) -> (NodeHandle, PortId) {
        match self.slab.get(node.raw) {
            Some(entry) => match entry.forwarded_inputs.iter().find(|r| r.origin == port) {
                Some(rec) => (rec.target, rec.target_port),
                None => (node, port),
            },
            None => (node, port),
        }
    }

    pub fn resolve_output(&self, node: NodeHandle, port: PortId) -> (NodeHandle, PortId) {
        match self.slab.get(node.raw) {
            Some(entry) => match entry.forwarded_outputs.iter().find(|r| r.origin == port) {
                Some(rec) => (rec.target, rec.target_port),
                None => (node, port),
            },
            None => (node, port),
        }
    }

    /// Runs the kind's `destroy`, disconnects every edge touching it, and
    /// emits a Destroy command. A panic inside `destroy` is caught and
    /// logged; it never prevents the node from being removed.
    pub fn destroy(
        &mut self,
        handle: NodeHandle,
        diff: &mut GraphDiff,
        connections: &mut ConnectionDatabase,
    ) -> Result<(), EngineError> {
        let mut entry = self.slab.remove(handle.raw).ok_or(EngineError::InvalidHandle)?;

        let mut ctx = SimDestroyContext { handle };
        let result = catch_unwind(AssertUnwindSafe(|| entry.kind.destroy(&mut ctx)));
        if result.is_err() {
            log::warn!("node {:?} panicked during destroy", handle);
        }

        connections.disconnect_all(handle);
        diff.push_destroy(handle);
        Ok(())
    }

    /// Resolves forwarding, validates the destination port, and invokes
    /// `handle_message`. Any `send_message` the handler issues in turn is
    /// delivered synchronously before this call returns (depth-first).
    pub fn send_message(
        &mut self,
        target: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
        msg: AnyValue,
    ) -> Result<(), EngineError> {
        let (node, port) = self.resolve_input(target, port);
        self.validate_port(node, port, array_index, PortUsage::Message, Some(msg.type_id()))?;

        let mut kind = {
            let entry = self.slab.get_mut(node.raw).ok_or(EngineError::InvalidHandle)?;
            std::mem::replace(&mut entry.kind, Box::new(TombstoneKind))
        };

        let mut ctx = SimMessageContext { handle: node, store: self };
        kind.handle_message(&mut ctx, port, array_index, msg);

        if let Some(entry) = self.slab.get_mut(node.raw) {
            entry.kind = kind;
        }
        Ok(())
    }

    /// Queues a data write into the diff, after verifying the port is an
    /// unconnected `Data` port. `connect` issued later in the same diff
    /// always wins (issue-order replay at apply time).
    pub fn set_data(
        &mut self,
        diff: &mut GraphDiff,
        connections: &ConnectionDatabase,
        target: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
        value: AnyValue,
    ) -> Result<(), EngineError> {
        let (node, port) = self.resolve_input(target, port);
        self.validate_port(node, port, array_index, PortUsage::Data, Some(value.type_id()))?;
        if self.is_input_connected(connections, node, port, array_index) {
            return Err(EngineError::AlreadyConnected);
        }
        diff.push_data_update(node, port, array_index, DataUpdate::Set(value));
        Ok(())
    }

    pub fn retain_data(
        &mut self,
        diff: &mut GraphDiff,
        connections: &ConnectionDatabase,
        target: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
    ) -> Result<(), EngineError> {
        let (node, port) = self.resolve_input(target, port);
        self.validate_port(node, port, array_index, PortUsage::Data, None)?;
        if self.is_input_connected(connections, node, port, array_index) {
            return Err(EngineError::AlreadyConnected);
        }
        diff.push_data_update(node, port, array_index, DataUpdate::Retain);
        Ok(())
    }

    pub fn set_port_array_size(
        &mut self,
        diff: &mut GraphDiff,
        node: NodeHandle,
        port: PortId,
        size: u16,
    ) -> Result<(), EngineError> {
        let entry = self.slab.get_mut(node.raw).ok_or(EngineError::InvalidHandle)?;
        let layout = entry.kind.layout();
        let desc = layout.input(port).ok_or(EngineError::NotFound)?;
        if !desc.is_array {
            return Err(EngineError::CategoryMismatch);
        }
        entry.port_array_sizes.insert(port, size);
        diff.push_resize_port_array(node, port, size);
        Ok(())
    }

    /// Asks the kind to build a freshly sized default buffer for an output
    /// port already carrying a `Buffer<T>` and queues its installation.
    pub fn set_buffer_size(
        &mut self,
        diff: &mut GraphDiff,
        node: NodeHandle,
        output_port: PortId,
        requested_len: usize,
    ) -> Result<(), EngineError> {
        let entry = self.slab.get_mut(node.raw).ok_or(EngineError::InvalidHandle)?;
        let layout = entry.kind.layout();
        let desc = layout.output(output_port).ok_or(EngineError::NotFound)?;
        if !desc.has_buffers() {
            return Err(EngineError::CategoryMismatch);
        }
        let value = entry
            .kind
            .resize_output_buffer(output_port, requested_len)
            .ok_or(EngineError::NotFound)?;
        diff.push_resize_buffer(node, output_port, value);
        Ok(())
    }

    pub fn port_array_size(&self, node: NodeHandle, port: PortId) -> Option<u16> {
        self.slab.get(node.raw)?.port_array_sizes.get(&port).copied()
    }

    /// Drives `update()` on every kind that opted in, in slab order.
    pub fn update_kinds(&mut self) {
        let handles: Vec<Handle> = self
            .slab
            .iter()
            .filter(|(_, e)| e.kind.wants_update())
            .map(|(h, _)| h)
            .collect();

        for raw in handles {
            let mut kind = match self.slab.get_mut(raw) {
                Some(entry) => std::mem::replace(&mut entry.kind, Box::new(TombstoneKind)),
                None => continue,
            };
            kind.update();
            if let Some(entry) = self.slab.get_mut(raw) {
                entry.kind = kind;
            }
        }
    }

    fn validate_port(
        &self,
        node: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
        expected_usage: PortUsage,
        value_type: Option<TypeId>,
    ) -> Result<(), EngineError> {
        let entry = self.slab.get(node.raw).ok_or(EngineError::InvalidHandle)?;
        let layout = entry.kind.layout();
        let desc = layout.input(port).ok_or(EngineError::NotFound)?;

        let usage_matches = match (&desc.usage, &expected_usage) {
            (PortUsage::Data, PortUsage::Data) => true,
            (PortUsage::Message, PortUsage::Message) => true,
            (PortUsage::DomainSpecific(a), PortUsage::DomainSpecific(b)) => a == b,
            _ => false,
        };
        if !usage_matches {
            return Err(EngineError::CategoryMismatch);
        }

        if let Some(vt) = value_type {
            if desc.value_type != vt {
                return Err(EngineError::TypeMismatch);
            }
        }

        if desc.is_array {
            if let Some(idx) = array_index {
                let size = entry.port_array_sizes.get(&port).copied().unwrap_or(0);
                if idx >= size {
                    return Err(EngineError::IndexOutOfRange);
                }
            }
        }

        Ok(())
    }

    fn is_input_connected(
        &self,
        connections: &ConnectionDatabase,
        node: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
    ) -> bool {
        connections
            .inputs_of(node)
            .any(|c| c.dst_port == port && c.dst_array_index == array_index)
    }
}

struct SimInitContext<'a> {
    handle: NodeHandle,
    forwarded_inputs: &'a mut Vec<ForwardRecord>,
    forwarded_outputs: &'a mut Vec<ForwardRecord>,
    diff: &'a mut GraphDiff,
}

fn push_forward(
    records: &mut Vec<ForwardRecord>,
    origin: PortId,
    target: NodeHandle,
    target_port: PortId,
) -> Result<(), ForwardError> {
    if let Some(last) = records.last() {
        if origin == last.origin {
            return Err(ForwardError::AlreadyForwarded);
        }
        if origin < last.origin {
            return Err(ForwardError::OutOfOrder);
        }
    }
    records.push(ForwardRecord { origin, target, target_port });
    Ok(())
}

impl<'a> InitContext for SimInitContext<'a> {
    fn node_handle(&self) -> NodeHandle {
        self.handle
    }

    fn forward_input(
        &mut self,
        origin: PortId,
        target: NodeHandle,
        target_port: PortId,
    ) -> Result<(), ForwardError> {
        push_forward(self.forwarded_inputs, origin, target, target_port)
    }

    fn forward_output(
        &mut self,
        origin: PortId,
        target: NodeHandle,
        target_port: PortId,
    ) -> Result<(), ForwardError> {
        push_forward(self.forwarded_outputs, origin, target, target_port)
    }

    fn request_buffer_size(&mut self, output_port: PortId, value: Box<dyn Any + Send + Sync>) {
        self.diff.push_resize_buffer(self.handle, output_port, value);
    }
}

struct SimDestroyContext {
    handle: NodeHandle,
}

impl DestroyContext for SimDestroyContext {
    fn node_handle(&self) -> NodeHandle {
        self.handle
    }
}

struct SimMessageContext<'a> {
    handle: NodeHandle,
    store: &'a mut NodeStore,
}

impl<'a> MessageContext for SimMessageContext<'a> {
    fn node_handle(&self) -> NodeHandle {
        self.handle
    }

    fn send_message(
        &mut self,
        target: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
        msg: AnyValue,
    ) -> Result<(), MessageError> {
        self.store
            .send_message(target, port, array_index, msg)
            .map_err(MessageError::from)
    }
}
