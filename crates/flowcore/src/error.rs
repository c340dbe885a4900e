use crate::{ExecutionId, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Node '{node_id}' failed: {source}")]
    NodeExecution {
        node_id: NodeId,
        source: NodeError,
    },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Execution {0} was cancelled")]
    CancellationRequested(ExecutionId),

    /// Run-loop failure that cannot be attributed to a single node
    #[error("Instance error: {0}")]
    Instance(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Wrap an executor failure with the id of the node that produced it
    pub fn node(node_id: impl Into<NodeId>, source: NodeError) -> Self {
        FlowError::NodeExecution {
            node_id: node_id.into(),
            source,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Script error: {message}")]
    Script {
        message: String,
        traceback: Option<String>,
    },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Sandbox timed out after {ms}ms")]
    SandboxTimeout { ms: u64 },

    #[error("Sandbox process error: {message}")]
    SandboxProcess {
        message: String,
        stdout: String,
        stderr: String,
    },

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    /// Raw diagnostic output attached to the error, if any
    pub fn diagnostic(&self) -> Option<String> {
        match self {
            NodeError::Script {
                traceback: Some(traceback),
                ..
            } => Some(traceback.clone()),
            NodeError::SandboxProcess { stdout, stderr, .. } => {
                if stdout.is_empty() && stderr.is_empty() {
                    None
                } else {
                    Some(format!("stdout:\n{}\nstderr:\n{}", stdout, stderr))
                }
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NodeError::Cancelled)
    }

    pub fn invalid_type(field: &str, expected: &str, actual: &serde_json::Value) -> Self {
        NodeError::InvalidInputType {
            field: field.to_string(),
            expected: expected.to_string(),
            actual: json_type_name(actual).to_string(),
        }
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cycle detected involving nodes: {}", .nodes.join(", "))]
    CycleDetected { nodes: Vec<NodeId> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    DanglingDependency { node: NodeId, dependency: NodeId },

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
}
