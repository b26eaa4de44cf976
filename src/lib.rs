//! A dual-world dataflow graph execution engine: a mutable simulation graph
//! reconciled each tick into a read-only, parallel-scheduled render world.
//!
//! [`NodeSet`] is the single entry point; everything else is reached through
//! its methods.

pub use dataflow_core::*;
pub use dataflow_graph::connection::{ConnectionId, TraversalFlags};
pub use dataflow_graph::scheduler::{ExecutionModel, Fence};
pub use dataflow_graph::values::{BatchHandle, GraphValueHandle, InputBatchRecord, Resolver};
pub use dataflow_graph::{EngineError, NodeSet, NodeSetConfig};
