use std::any::TypeId;

/// A port identifier local to a node. The sentinel [`PortId::INVALID`] marks "no
/// port", used by forwarding records and by the invalid-array-index case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u16);

impl PortId {
    pub const INVALID: Self = Self(u16::MAX);
}

impl From<u16> for PortId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// What a port is used for. Determines which public operation
/// (`send_message` vs. `set_data`/connect) is legal on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortUsage {
    /// Carries a buffered/scalar value produced once per kernel execution.
    Data,
    /// Carries discrete, simulation-synchronous messages.
    Message,
    /// A domain-specific hierarchy (e.g. a UI/DSL-only edge) that the core
    /// does not interpret beyond its `traversal_flags` bit.
    DomainSpecific(u32),
}

/// Locates one buffer within an output data port's value type, for buffers that
/// are logically owned by that port (e.g. a `Buffer<T>` field nested in a struct).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub byte_offset: usize,
    pub element_type: TypeId,
    pub element_type_name: &'static str,
}

/// The static description of one input or output port, derived by the external
/// node-authoring facade from a node kind's declared port struct. The core never
/// constructs these reflectively; it only ever reads them.
#[derive(Debug, Clone)]
pub struct PortDesc {
    pub id: PortId,
    pub usage: PortUsage,
    pub value_type: TypeId,
    pub value_type_name: &'static str,
    pub is_array: bool,
    /// Non-empty only for output data ports whose value type contains buffers.
    pub buffers: Vec<BufferDesc>,
}

impl PortDesc {
    pub fn has_buffers(&self) -> bool {
        !self.buffers.is_empty()
    }
}

/// The full port layout of a node kind, supplied once at kind registration.
#[derive(Debug, Clone, Default)]
pub struct NodeLayout {
    pub inputs: Vec<PortDesc>,
    pub outputs: Vec<PortDesc>,
}

impl NodeLayout {
    pub fn input(&self, port: PortId) -> Option<&PortDesc> {
        self.inputs.iter().find(|p| p.id == port)
    }

    pub fn output(&self, port: PortId) -> Option<&PortDesc> {
        self.outputs.iter().find(|p| p.id == port)
    }
}
