pub mod buffer;
pub mod handle;
pub mod node;
pub mod port;
pub mod value;

pub use buffer::{BufferOwnership, KernelContext, PortBinding, PortRef, PortRefMut};
pub use handle::{Handle, NodeHandle};
pub use node::{
    DestroyContext, ForwardError, InitContext, Kernel, MessageContext, MessageError, NodeKind,
};
pub use port::{BufferDesc, NodeLayout, PortDesc, PortId, PortUsage};
pub use value::AnyValue;
