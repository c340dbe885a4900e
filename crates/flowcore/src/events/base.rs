use crate::{
    ExecutionId, ExecutionInstance, LogEntry, NodeExecutionRecord, NodeId, WorkflowId,
};
use serde::{Deserialize, Serialize};

/// State-change events pushed to observers. Each carries the entity's current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionUpdate {
        execution: ExecutionInstance,
    },
    NodeUpdate {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        node: NodeExecutionRecord,
    },
    Log {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        entry: LogEntry,
    },
}

impl ExecutionEvent {
    /// Wire tag of the event
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionUpdate { .. } => "execution_update",
            ExecutionEvent::NodeUpdate { .. } => "node_update",
            ExecutionEvent::Log { .. } => "log",
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::ExecutionUpdate { execution } => execution.id,
            ExecutionEvent::NodeUpdate { execution_id, .. }
            | ExecutionEvent::Log { execution_id, .. } => *execution_id,
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            ExecutionEvent::ExecutionUpdate { execution } => &execution.workflow_id,
            ExecutionEvent::NodeUpdate { workflow_id, .. }
            | ExecutionEvent::Log { workflow_id, .. } => workflow_id,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::ExecutionUpdate { .. } => None,
            ExecutionEvent::NodeUpdate { node, .. } => Some(&node.node_id),
            ExecutionEvent::Log { entry, .. } => entry.node_id.as_deref(),
        }
    }

    /// True for the final transition of an instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::ExecutionUpdate { execution } if execution.is_terminal())
    }

    /// Every topic this event is published under
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = vec![
            Topic::Workflow(self.workflow_id().to_string()),
            Topic::Execution(self.execution_id()),
        ];
        if let Some(node_id) = self.node_id() {
            topics.push(Topic::Node(node_id.to_string()));
        }
        topics
    }
}

/// What an observer can subscribe to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Topic {
    Workflow(WorkflowId),
    Node(NodeId),
    Execution(ExecutionId),
}
