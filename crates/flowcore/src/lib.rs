//! Core abstractions for the flow engine
//!
//! This crate provides the data model, error types, the `Node` trait and the
//! event bus that all other components depend on.

mod error;
pub mod events;
mod execution;
mod node;
mod store;
mod workflow;

pub use error::{FlowError, NodeError, WorkflowError};
pub use events::*;
pub use execution::{
    ExecutionId, ExecutionInstance, ExecutionMode, ExecutionStatus, LogEntry, LogLevel,
    NodeExecutionRecord, NodeStatus,
};
pub use node::{
    Node, NodeContext, NodeDispatcher, NodeMetadata, NodeOutput, PortDefinition, CONTEXT_KEY,
};
pub use store::WorkflowStore;
pub use workflow::{
    Connection, ErrorHandling, NodeId, NodeSpec, Position, RetryPolicy, Workflow, WorkflowId,
    WorkflowSettings,
};

/// Key-value payload exchanged between nodes
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
