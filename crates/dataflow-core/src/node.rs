use std::any::Any;
use std::error::Error;
use std::fmt;

use downcast_rs::{impl_downcast, Downcast};

use crate::buffer::KernelContext;
use crate::handle::NodeHandle;
use crate::port::{NodeLayout, PortId};
use crate::value::AnyValue;

/// An error raised by a forwarding declaration made during [`NodeKind::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    /// Ports must be forwarded in strictly increasing port-index order.
    OutOfOrder,
    /// The same port was forwarded twice.
    AlreadyForwarded,
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfOrder => write!(f, "ports must be forwarded in increasing port-index order"),
            Self::AlreadyForwarded => write!(f, "port was already forwarded"),
        }
    }
}

impl Error for ForwardError {}

/// The context exposed to [`NodeKind::init`]. Implemented by the simulation node
/// store; a node kind never sees the store itself, only this narrow interface.
pub trait InitContext {
    /// The handle of the node currently being initialized.
    fn node_handle(&self) -> NodeHandle;

    /// Transparently redirect external connections/messages aimed at `origin`
    /// (an input port on this node) to `target_port` on `target` instead.
    fn forward_input(
        &mut self,
        origin: PortId,
        target: NodeHandle,
        target_port: PortId,
    ) -> Result<(), ForwardError>;

    /// The output-port dual of [`InitContext::forward_input`].
    fn forward_output(
        &mut self,
        origin: PortId,
        target: NodeHandle,
        target_port: PortId,
    ) -> Result<(), ForwardError>;

    /// Install a freshly sized default buffer for the given output port. The
    /// node kind constructs the value itself (it alone knows the concrete
    /// element type and desired length); the core only ever moves the opaque
    /// result into the port's cell.
    fn request_buffer_size(&mut self, output_port: PortId, value: Box<dyn Any + Send + Sync>);
}

/// The context exposed to [`NodeKind::destroy`].
pub trait DestroyContext {
    fn node_handle(&self) -> NodeHandle;
}

/// An error raised by [`MessageContext::send_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    InvalidHandle,
    NotFound,
    TypeMismatch,
    CategoryMismatch,
    IndexOutOfRange,
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for MessageError {}

/// The context exposed to [`NodeKind::handle_message`]. Messages may chain:
/// a handler may itself call `send_message`, and such sends are delivered
/// synchronously before the outer `send_message` call returns.
pub trait MessageContext {
    fn node_handle(&self) -> NodeHandle;

    fn send_message(
        &mut self,
        target: NodeHandle,
        port: PortId,
        array_index: Option<u16>,
        msg: AnyValue,
    ) -> Result<(), MessageError>;
}

/// The per-tick executable core of a node kind: a pure function of its patched
/// inputs, kernel-private state, and patched outputs. Kernels never see the
/// simulation; they have no means to send messages or mutate topology.
pub trait Kernel: Send {
    fn execute(&mut self, ctx: &mut KernelContext);
}

/// The node-kind vtable: the opaque, externally-supplied description of a node's
/// behavior and storage layout that the core dispatches through. All instances of
/// a kind share one `NodeKind` trait object (looked up by a stable kind index), the
/// same way a C vtable is shared by every instance of a type.
pub trait NodeKind: Downcast {
    fn debug_name(&self) -> &'static str;

    /// The node's declared port layout, consulted by `connect`/`send_message`/
    /// `set_data` to validate operations without reflection.
    fn layout(&self) -> NodeLayout;

    /// Whether this kind's private data is pooled/managed rather than arena
    /// allocated. Purely a storage-strategy hint; the core does not interpret it.
    fn is_managed(&self) -> bool {
        false
    }

    /// Called once, synchronously, when the node is created. May declare
    /// forwardings and buffer-size requests via `ctx`. An `Err` return rolls the
    /// creation back atomically.
    fn init(&mut self, ctx: &mut dyn InitContext) -> Result<(), Box<dyn Error>> {
        let _ = ctx;
        Ok(())
    }

    /// Called once, synchronously, when the node is destroyed. Panics/errors are
    /// logged but never prevent the destroy from completing.
    fn destroy(&mut self, ctx: &mut dyn DestroyContext) {
        let _ = ctx;
    }

    fn handle_message(
        &mut self,
        ctx: &mut dyn MessageContext,
        port: PortId,
        array_index: Option<u16>,
        msg: AnyValue,
    ) {
        let _ = (ctx, port, array_index, msg);
    }

    /// Called once per simulation tick if this kind opted in (see
    /// [`NodeKind::wants_update`]).
    fn update(&mut self) {}

    fn wants_update(&self) -> bool {
        false
    }

    /// Build this node's render-side kernel, given its current port counts.
    /// Returning `None` means the node has no render presence (it only
    /// participates in the simulation graph, e.g. a pure message router).
    fn build_kernel(
        &mut self,
        num_inputs: usize,
        num_outputs: usize,
    ) -> Result<Option<Box<dyn Kernel>>, Box<dyn Error>> {
        let _ = (num_inputs, num_outputs);
        Ok(None)
    }

    /// Construct a freshly sized default buffer for `output_port`, in response
    /// to an external `set_buffer_size` request made after creation (as
    /// opposed to the buffer-size requests a kind may raise itself during
    /// `init`). `None` means this kind does not support resizing that port.
    fn resize_output_buffer(
        &mut self,
        output_port: PortId,
        requested_len: usize,
    ) -> Option<Box<dyn Any + Send + Sync>> {
        let _ = (output_port, requested_len);
        None
    }
}

impl_downcast!(NodeKind);
