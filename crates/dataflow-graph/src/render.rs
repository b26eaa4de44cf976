use ahash::AHashMap;

use dataflow_core::{BufferOwnership, Kernel, NodeHandle, NodeLayout, PortBinding, PortId};

use crate::connection::{ConnectionDatabase, TraversalFlags};
use crate::diff::{CommandKind, DataUpdate, GraphDiff};
use crate::topology::TopologyCache;

/// A kernel's render-side storage: the built kernel itself (`None` if the
/// kind declared no render presence) plus its patched input/output port
/// cells, index-aligned with the kind's declared layout.
pub struct KernelNode {
    pub handle: NodeHandle,
    pub kernel: Option<Box<dyn Kernel>>,
    pub layout: NodeLayout,
    pub inputs: Vec<PortBinding>,
    pub outputs: Vec<PortBinding>,
    /// Per-index storage for `is_array` input ports, keyed by port id. Sized
    /// by the most recent `ResizePortArray`; a `DataUpdate` carrying an
    /// `array_index` writes into the matching slot here rather than into
    /// `inputs`, so distinct indices never clobber one another.
    pub array_inputs: AHashMap<PortId, Vec<PortBinding>>,
    /// Memory externally installed by an input batch for this tick only,
    /// keyed by input port; cleared after each `patch_ports`.
    pub batch_overrides: AHashMap<PortId, PortBinding>,
}

impl KernelNode {
    fn new(handle: NodeHandle, layout: NodeLayout, kernel: Option<Box<dyn Kernel>>) -> Self {
        let inputs = layout.inputs.iter().map(|_| PortBinding::unbound()).collect();
        let outputs = layout.outputs.iter().map(|_| PortBinding::unbound()).collect();
        Self {
            handle,
            kernel,
            layout,
            inputs,
            outputs,
            array_inputs: AHashMap::new(),
            batch_overrides: AHashMap::new(),
        }
    }
}

/// A sparse, index-aligned mirror of the simulation's node slab: `nodes[i]`
/// is `Some` iff the simulation handle with raw index `i` currently has a
/// render presence. Desynchronized deliberately on failure; the next
/// `apply_diff` fully rebuilds it from a fresh diff.
#[derive(Default)]
pub struct RenderWorld {
    nodes: Vec<Option<KernelNode>>,
    desynced: bool,
}

impl RenderWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    pub fn get(&self, node: NodeHandle) -> Option<&KernelNode> {
        self.nodes.get(node.raw.index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, node: NodeHandle) -> Option<&mut KernelNode> {
        self.nodes.get_mut(node.raw.index as usize)?.as_mut()
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Option<KernelNode>] {
        &mut self.nodes
    }

    fn slot_mut(&mut self, node: NodeHandle) -> &mut Option<KernelNode> {
        let idx = node.raw.index as usize;
        if idx >= self.nodes.len() {
            self.nodes.resize_with(idx + 1, || None);
        }
        &mut self.nodes[idx]
    }

    /// Replays a diff's command stream in issue order against the kernel-node
    /// table. `build_kernel` is supplied by the caller (the simulation node
    /// store knows each kind; the render world never touches `NodeKind`
    /// directly once built). Takes `diff` by value: a diff is discarded after
    /// being applied, and ownership lets resize/set-data payloads move
    /// directly into port cells instead of being cloned.
    pub fn apply_diff<F>(&mut self, diff: GraphDiff, mut build_kernel: F)
    where
        F: FnMut(NodeHandle) -> Option<(NodeLayout, Option<Box<dyn Kernel>>)>,
    {
        self.desynced = false;

        let GraphDiff {
            created,
            destroyed,
            buffer_resizes,
            port_array_resizes,
            data_updates,
            command_stream,
        } = diff;

        let mut buffer_resizes: Vec<Option<_>> = buffer_resizes.into_iter().map(Some).collect();
        let mut data_updates: Vec<Option<_>> = data_updates.into_iter().map(Some).collect();

        for (kind, idx) in command_stream {
            match kind {
                CommandKind::Create => {
                    let node = created[idx];
                    if let Some((layout, kernel)) = build_kernel(node) {
                        let slot = self.slot_mut(node);
                        *slot = Some(KernelNode::new(node, layout, kernel));
                    }
                }
                CommandKind::Destroy => {
                    let node = destroyed[idx];
                    let slot = self.slot_mut(node);
                    *slot = None;
                }
                CommandKind::ResizeBuffer => {
                    if let Some(resize) = buffer_resizes[idx].take() {
                        if let Some(kn) = self.slot_mut(resize.node) {
                            if let Some(port_idx) =
                                kn.layout.outputs.iter().position(|p| p.id == resize.output_port)
                            {
                                kn.outputs[port_idx] =
                                    PortBinding::bound(resize.value, BufferOwnership::OwnedByPort);
                            }
                        }
                    }
                }
                CommandKind::ResizePortArray => {
                    let resize = &port_array_resizes[idx];
                    if let Some(kn) = self.slot_mut(resize.node) {
                        if kn.layout.inputs.iter().any(|p| p.id == resize.port) {
                            let slots = kn.array_inputs.entry(resize.port).or_default();
                            slots.resize_with(resize.size as usize, PortBinding::unbound);
                        }
                    }
                }
                CommandKind::DataUpdate => {
                    if let Some(update) = data_updates[idx].take() {
                        if let Some(kn) = self.slot_mut(update.node) {
                            if let Some(port_idx) =
                                kn.layout.inputs.iter().position(|p| p.id == update.port)
                            {
                                match (update.array_index, update.update) {
                                    (Some(array_index), DataUpdate::Set(value)) => {
                                        let slots = kn.array_inputs.entry(update.port).or_default();
                                        let array_index = array_index as usize;
                                        if slots.len() <= array_index {
                                            slots.resize_with(array_index + 1, PortBinding::unbound);
                                        }
                                        slots[array_index] = PortBinding::bound(
                                            value.into_box(),
                                            BufferOwnership::OwnedByPort,
                                        );
                                    }
                                    (Some(_), DataUpdate::Retain) => {}
                                    (None, DataUpdate::Set(value)) => {
                                        kn.inputs[port_idx] = PortBinding::bound(
                                            value.into_box(),
                                            BufferOwnership::OwnedByPort,
                                        );
                                    }
                                    (None, DataUpdate::Retain) => {}
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// `ComputeValueChunkAndPatchPorts`: for every live kernel node's input
    /// port, point it at the first `Data`-flagged connection's source output
    /// cell, or leave it unbound (a zero default) if disconnected.
    pub fn patch_ports(&mut self, connections: &ConnectionDatabase, _topology: &TopologyCache) {
        let handles: Vec<NodeHandle> = self
            .nodes
            .iter()
            .filter_map(|n| n.as_ref().map(|kn| kn.handle))
            .collect();

        for node in handles {
            let source_cells: Vec<(PortId, Option<PortBinding>)> = {
                let layout = match self.get(node) {
                    Some(kn) => kn.layout.clone(),
                    None => continue,
                };
                layout
                    .inputs
                    .iter()
                    .map(|input_desc| {
                        let source = connections
                            .inputs_of(node)
                            .find(|c| c.dst_port == input_desc.id && c.flags.contains(TraversalFlags::DATA));
                        let cell = source.and_then(|c| {
                            self.get(c.src_node).and_then(|src_kn| {
                                src_kn
                                    .layout
                                    .outputs
                                    .iter()
                                    .position(|p| p.id == c.src_port)
                                    .and_then(|i| src_kn.outputs.get(i))
                                    .cloned()
                            })
                        });
                        (input_desc.id, cell)
                    })
                    .collect()
            };

            if let Some(kn) = self.slot_mut(node).as_mut() {
                for (i, input_desc) in kn.layout.inputs.iter().enumerate() {
                    if let Some(batch) = kn.batch_overrides.get(&input_desc.id) {
                        kn.inputs[i] = batch.clone();
                        continue;
                    }
                    if let Some((_, Some(cell))) =
                        source_cells.iter().find(|(id, _)| *id == input_desc.id)
                    {
                        kn.inputs[i] = cell.clone();
                    }
                }
            }
        }
    }

    pub fn clear_batch_overrides(&mut self) {
        for slot in self.nodes.iter_mut().flatten() {
            slot.batch_overrides.clear();
        }
    }

    /// Forces every kernel node out, as done when align/schedule fails and
    /// the worlds are deliberately desynchronized until the next full diff.
    pub fn clear_all(&mut self) {
        self.nodes.clear();
        self.desynced = true;
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataflow_core::{Handle, PortDesc, PortUsage};
    use std::any::TypeId;

    fn node(idx: u32) -> NodeHandle {
        NodeHandle {
            raw: Handle { index: idx, version: 0, container_id: 0 },
            debug_name: "test",
        }
    }

    fn layout_with_one_output() -> NodeLayout {
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
    fn create_then_destroy_clears_slot() {
        let mut world = RenderWorld::new();
        let mut diff = GraphDiff::new();
        let n = node(0);
        diff.push_create(n);

        world.apply_diff(diff, |_| Some((layout_with_one_output(), None)));
        assert!(world.get(n).is_some());

        let mut diff2 = GraphDiff::new();
        diff2.push_destroy(n);
        world.apply_diff(diff2, |_| None);
        assert!(world.get(n).is_none());
    }

    #[test]
    fn unbuilt_kind_leaves_slot_empty() {
        let mut world = RenderWorld::new();
        let mut diff = GraphDiff::new();
        let n = node(0);
        diff.push_create(n);

        world.apply_diff(diff, |_| None);
        assert!(world.get(n).is_none());
    }

    fn layout_with_one_array_input() -> NodeLayout {
        NodeLayout {
            inputs: vec![PortDesc {
                id: PortId(0),
                usage: PortUsage::Data,
                value_type: TypeId::of::<i32>(),
                value_type_name: "i32",
                is_array: true,
                buffers: Vec::new(),
            }],
            outputs: Vec::new(),
        }
    }

    #[test]
    fn array_indexed_updates_land_in_distinct_slots() {
        use dataflow_core::AnyValue;

        let mut world = RenderWorld::new();
        let mut diff = GraphDiff::new();
        let n = node(0);
        diff.push_create(n);
        diff.push_resize_port_array(n, PortId(0), 3);
        diff.push_data_update(n, PortId(0), Some(0), DataUpdate::Set(AnyValue::new(10i32)));
        diff.push_data_update(n, PortId(0), Some(2), DataUpdate::Set(AnyValue::new(30i32)));

        world.apply_diff(diff, |_| Some((layout_with_one_array_input(), None)));

        let kn = world.get(n).unwrap();
        let slots = kn.array_inputs.get(&PortId(0)).unwrap();
        assert_eq!(slots.len(), 3);
        assert_eq!(*slots[0].read::<i32>().unwrap(), 10);
        assert!(!slots[1].is_bound());
        assert_eq!(*slots[2].read::<i32>().unwrap(), 30);
    }
}
