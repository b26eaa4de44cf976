use std::fmt::Debug;

/// A versioned handle: `(index, version, container_id)`.
///
/// `container_id` distinguishes which [`crate::node::NodeKind`] host ("set") minted
/// the handle, so a handle from one set can never be mistaken for a handle in
/// another set even if their indices collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u32,
    pub version: u32,
    pub container_id: u16,
}

impl Handle {
    pub const DANGLING: Self = Self {
        index: u32::MAX,
        version: u32::MAX,
        container_id: u16::MAX,
    };

    pub const fn is_dangling(&self) -> bool {
        self.index == u32::MAX && self.version == u32::MAX
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::DANGLING
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}#{}", self.index, self.version, self.container_id)
    }
}

/// Identifies a node instance within a particular [`crate::node::NodeKind`] host.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub raw: Handle,
    pub debug_name: &'static str,
}

impl NodeHandle {
    pub const DANGLING: Self = Self {
        raw: Handle::DANGLING,
        debug_name: "dangling",
    };
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::DANGLING
    }
}

impl Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", self.debug_name, self.raw)
    }
}
