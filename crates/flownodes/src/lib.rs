//! Standard node library
//!
//! Collection of built-in nodes for common operations

mod code;
mod debug;
mod file;
mod flow;
mod http;
mod schedule;
mod time;
mod transform;

pub use code::{node_output, CodeNode, CONTEXT_BINDING};
pub use debug::DebugNode;
pub use file::{FileReadNode, FileWriteNode};
pub use flow::{FlowItem, FlowNode, DEFAULT_MANAGER_INTERVAL};
pub use http::HttpRequestNode;
pub use schedule::{ScheduledTask, SchedulerNode, TaskQueue, TaskRequest, TaskStatus};
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode};

use flowruntime::NodeRegistry;
use flowsandbox::SandboxRunner;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &NodeRegistry, sandbox: Arc<SandboxRunner>) {
    registry.register(Arc::new(CodeNode::new(sandbox)));
    registry.register(Arc::new(FlowNode));
    registry.register(Arc::new(SchedulerNode::new()));
    registry.register(Arc::new(DebugNode));
    registry.register(Arc::new(HttpRequestNode::new()));
    registry.register(Arc::new(JsonParseNode));
    registry.register(Arc::new(JsonStringifyNode));
    registry.register(Arc::new(FileReadNode));
    registry.register(Arc::new(FileWriteNode));
    registry.register(Arc::new(DelayNode));
}
