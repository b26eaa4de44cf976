use dataflow_core::MessageError;
use thiserror::Error;

/// The error taxonomy shared by every fallible public [`crate::context::NodeSet`]
/// operation. `Leak` is never returned; it is only ever logged at `dispose`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("handle is invalid, stale, or belongs to another set")]
    InvalidHandle,

    #[error("port or connection does not exist")]
    NotFound,

    #[error("value type does not match the port's declared type")]
    TypeMismatch,

    #[error("operation is not valid for this port's usage")]
    CategoryMismatch,

    #[error("port-array index is past the array's current size")]
    IndexOutOfRange,

    #[error("connection already exists")]
    AlreadyConnected,

    #[error("no such connection exists")]
    NotConnected,

    #[error("topology refresh found a cycle")]
    CycleDetected,

    #[error("zero-sized value types cannot back a port")]
    ZeroSizedType,

    #[error("resources were still live at dispose")]
    Leak,
}

/// Lets a node's `handle_message` propagate a `send_message` failure back
/// through [`dataflow_core::MessageContext`] without the core depending on
/// this crate's richer error enum.
impl From<EngineError> for MessageError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidHandle => MessageError::InvalidHandle,
            EngineError::NotFound => MessageError::NotFound,
            EngineError::TypeMismatch => MessageError::TypeMismatch,
            EngineError::CategoryMismatch => MessageError::CategoryMismatch,
            EngineError::IndexOutOfRange => MessageError::IndexOutOfRange,
            _ => MessageError::NotFound,
        }
    }
}
