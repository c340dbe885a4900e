use async_trait::async_trait;
use dashmap::DashMap;
use flowcore::{
    Node, NodeContext, NodeDispatcher, NodeError, NodeMetadata, NodeOutput, Workflow,
    WorkflowError,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Registry of available node types.
///
/// Registration and lookup are safe from any thread; running instances share
/// one registry through `Arc`.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<dyn Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its type tag. Returns the executor it replaced, if any.
    pub fn register(&self, node: Arc<dyn Node>) -> Option<Arc<dyn Node>> {
        let node_type = node.node_type().to_string();
        tracing::info!("Registering node type: {}", node_type);
        self.nodes.insert(node_type, node)
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(node_type).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.nodes.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.nodes.get(node_type).map(|node| node.metadata())
    }

    /// Check that every node of `workflow` has a registered executor that accepts its config
    pub fn ensure_known(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        for spec in &workflow.nodes {
            let node = self
                .get(&spec.node_type)
                .ok_or_else(|| WorkflowError::UnknownNodeType(spec.node_type.clone()))?;
            node.validate_config(&spec.config).map_err(|e| {
                WorkflowError::Invalid(format!("node '{}': {}", spec.id, e))
            })?;
        }
        Ok(())
    }

    /// Run the executor registered for `node_type`. A panicking executor is
    /// reported as a failed node instead of unwinding into the caller.
    pub async fn execute(&self, node_type: &str, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let node = self
            .get(node_type)
            .ok_or_else(|| NodeError::UnknownNodeType(node_type.to_string()))?;

        match AssertUnwindSafe(node.execute(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(node_type, "Node executor panicked: {}", message);
                Err(NodeError::ExecutionFailed(format!("executor panicked: {}", message)))
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl NodeDispatcher for NodeRegistry {
    async fn dispatch(&self, node_type: &str, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.execute(node_type, ctx).await
    }

    fn contains(&self, node_type: &str) -> bool {
        NodeRegistry::contains(self, node_type)
    }
}
