//! Workflow execution runtime
//!
//! This crate provides the actual execution engine that runs workflows,
//! manages the node registry, and plans DAG-based parallel execution.

mod control;
mod executor;
mod registry;
mod runtime;
pub mod scheduler;
mod store;

pub use control::{ControlMessage, ControlReply};
pub use executor::{SharedInstance, WorkflowExecutor};
pub use registry::NodeRegistry;
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use scheduler::{
    insert_manager_nodes, DependencyGraph, ExecutionPlan, ManagerNode, PlanEntry, PlanNode,
};
pub use store::{JsonDirectoryStore, MemoryWorkflowStore};
