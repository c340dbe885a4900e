//! Control messages a transport forwards to the runtime, and the replies it sends back.

use crate::runtime::FlowRuntime;
use flowcore::{
    ExecutionId, ExecutionMode, LogEntry, ObserverId, Payload, Topic, WorkflowId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe { workflow_id: WorkflowId },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { workflow_id: WorkflowId },
    #[serde(rename_all = "camelCase")]
    Execute {
        workflow_id: WorkflowId,
        #[serde(default)]
        mode: Option<ExecutionMode>,
        #[serde(default)]
        context: Payload,
    },
    #[serde(rename_all = "camelCase")]
    Stop { execution_id: ExecutionId },
    #[serde(rename_all = "camelCase")]
    GetLogs { execution_id: ExecutionId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlReply {
    #[serde(rename_all = "camelCase")]
    Subscribed { workflow_id: WorkflowId },
    #[serde(rename_all = "camelCase")]
    Unsubscribed { workflow_id: WorkflowId },
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
    },
    #[serde(rename_all = "camelCase")]
    Stopped {
        execution_id: ExecutionId,
        stopped: bool,
    },
    #[serde(rename_all = "camelCase")]
    Logs {
        execution_id: ExecutionId,
        logs: Vec<LogEntry>,
    },
    Error { message: String },
}

impl ControlReply {
    fn error(message: impl ToString) -> Self {
        ControlReply::Error {
            message: message.to_string(),
        }
    }
}

impl FlowRuntime {
    /// Apply one control message on behalf of `observer_id`
    pub async fn handle_control(&self, observer_id: ObserverId, message: ControlMessage) -> ControlReply {
        tracing::debug!(%observer_id, ?message, "Control message");
        match message {
            ControlMessage::Subscribe { workflow_id } => {
                if self.subscribe(observer_id, Topic::Workflow(workflow_id.clone())) {
                    ControlReply::Subscribed { workflow_id }
                } else {
                    ControlReply::error(format!("Observer {} is not connected", observer_id))
                }
            }
            ControlMessage::Unsubscribe { workflow_id } => {
                self.unsubscribe(observer_id, &Topic::Workflow(workflow_id.clone()));
                ControlReply::Unsubscribed { workflow_id }
            }
            ControlMessage::Execute {
                workflow_id,
                mode,
                context,
            } => match self.start_execution(&workflow_id, context, mode).await {
                Ok(execution_id) => ControlReply::ExecutionStarted {
                    execution_id,
                    workflow_id,
                },
                Err(err) => ControlReply::error(err),
            },
            ControlMessage::Stop { execution_id } => match self.stop_execution(execution_id) {
                Ok(stopped) => ControlReply::Stopped {
                    execution_id,
                    stopped,
                },
                Err(err) => ControlReply::error(err),
            },
            ControlMessage::GetLogs { execution_id } => match self.get_logs(execution_id) {
                Ok(logs) => ControlReply::Logs { execution_id, logs },
                Err(err) => ControlReply::error(err),
            },
        }
    }
}
