use crate::events::NodeLogger;
use crate::{ExecutionId, NodeError, NodeId, Payload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Input key under which the instance's shared context is handed to every node
pub const CONTEXT_KEY: &str = "_context";

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "http.request", "code")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Description and port schema shown by front ends
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }

    /// Optional: Validate configuration at workflow load time
    fn validate_config(&self, _config: &Payload) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Dispatches a node invocation by type tag. Lets meta-nodes run other nodes.
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    async fn dispatch(&self, node_type: &str, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    fn contains(&self, node_type: &str) -> bool;
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,

    pub node_id: NodeId,

    /// Input values resolved from upstream nodes, plus `_context`
    pub inputs: Payload,

    /// Static configuration for this node
    pub config: Payload,

    /// Node-scoped log stream
    pub logger: NodeLogger,

    /// Cancellation token for graceful shutdown
    pub cancellation: CancellationToken,

    /// Registry access for nodes that orchestrate other nodes
    pub dispatcher: Option<Arc<dyn NodeDispatcher>>,
}

impl NodeContext {
    /// Context detached from any execution, logging through `tracing`
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        Self {
            execution_id: ExecutionId::nil(),
            logger: NodeLogger::detached(node_id.clone()),
            node_id,
            inputs: Payload::new(),
            config: Payload::new(),
            cancellation: CancellationToken::new(),
            dispatcher: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Payload) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_config(mut self, config: Payload) -> Self {
        self.config = config;
        self
    }

    pub fn with_logger(mut self, logger: NodeLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NodeDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_execution_id(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = execution_id;
        self
    }

    /// Context for a nested invocation: same execution, scoped logger, child token
    pub fn child(&self, node_id: impl Into<NodeId>) -> NodeContext {
        let node_id = node_id.into();
        NodeContext {
            execution_id: self.execution_id,
            logger: self.logger.scoped(&node_id),
            node_id,
            inputs: Payload::new(),
            config: Payload::new(),
            cancellation: self.cancellation.child_token(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    /// Look a key up in inputs first, then in config
    pub fn input_or_config(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).or_else(|| self.config.get(name))
    }

    pub fn config_bool(&self, name: &str) -> bool {
        self.config.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Shared trigger context of the running instance
    pub fn shared_context(&self) -> Option<&Payload> {
        self.inputs.get(CONTEXT_KEY).and_then(Value::as_object)
    }

    /// Inputs without the reserved context entry
    pub fn data_inputs(&self) -> Payload {
        self.inputs
            .iter()
            .filter(|(k, _)| k.as_str() != CONTEXT_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: Payload,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_payload(outputs: Payload) -> Self {
        Self { outputs }
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn get(&self, port: &str) -> Option<&Value> {
        self.outputs.get(port)
    }
}

/// Metadata about a node type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}
