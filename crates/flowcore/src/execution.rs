use crate::{NodeId, Payload, Workflow, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// How the coordinator walks the plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One node at a time in topological order
    #[default]
    Sequential,
    /// Dependency-level groups, each group joined before the next starts
    Parallel,
    /// Dataflow: a node starts as soon as its dependencies are done
    Mixed,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Mixed => "mixed",
        };
        f.write_str(name)
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            "mixed" => Ok(ExecutionMode::Mixed),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Waiting,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            node_id: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Per-node state inside one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: NodeId,
    pub node_type: String,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Input as resolved right before the first attempt
    pub input: Option<Payload>,
    pub output: Option<Payload>,
    pub error: Option<String>,
    /// Raw diagnostic (stderr, traceback) behind `error`
    pub diagnostic: Option<String>,
    pub attempts: u32,
    pub logs: Vec<LogEntry>,
}

impl NodeExecutionRecord {
    pub fn new(node_id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            status: NodeStatus::Waiting,
            started_at: None,
            completed_at: None,
            input: None,
            output: None,
            error: None,
            diagnostic: None,
            attempts: 0,
            logs: Vec::new(),
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// One run of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInstance {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Trigger context shared with every node
    pub context: Payload,
    pub node_executions: HashMap<NodeId, NodeExecutionRecord>,
    pub logs: Vec<LogEntry>,
    pub error: Option<String>,
}

impl ExecutionInstance {
    /// New pending instance with every node waiting
    pub fn new(workflow: &Workflow, context: Payload, mode: ExecutionMode) -> Self {
        let node_executions = workflow
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    NodeExecutionRecord::new(n.id.clone(), n.node_type.clone()),
                )
            })
            .collect();

        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id.clone(),
            mode,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            context,
            node_executions,
            logs: Vec::new(),
            error: None,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.node_executions.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeExecutionRecord> {
        self.node_executions.get_mut(node_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Instance and node logs merged in timestamp order
    pub fn all_logs(&self) -> Vec<LogEntry> {
        let mut logs: Vec<LogEntry> = self
            .logs
            .iter()
            .chain(self.node_executions.values().flat_map(|r| r.logs.iter()))
            .cloned()
            .collect();
        logs.sort_by_key(|entry| entry.timestamp);
        logs
    }

    /// Outputs of every node that completed successfully
    pub fn outputs(&self) -> HashMap<NodeId, Payload> {
        self.node_executions
            .values()
            .filter_map(|r| r.output.clone().map(|o| (r.node_id.clone(), o)))
            .collect()
    }

    pub fn count_nodes(&self, status: NodeStatus) -> usize {
        self.node_executions
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
