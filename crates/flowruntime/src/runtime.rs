use crate::executor::{SharedInstance, WorkflowExecutor};
use crate::registry::NodeRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowcore::{
    EventBus, ExecutionEvent, ExecutionId, ExecutionInstance, ExecutionMode, ExecutionStatus,
    FlowError, LogEntry, ObserverId, Payload, Subscription, Topic, Workflow, WorkflowError,
    WorkflowId, WorkflowStore,
};
use flowsandbox::SandboxConfig;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background run of one instance
struct ExecutionHandle {
    instance: SharedInstance,
    cancel: CancellationToken,
    status: watch::Receiver<ExecutionStatus>,
    task: JoinHandle<()>,
}

impl ExecutionHandle {
    fn snapshot(&self) -> ExecutionInstance {
        self.instance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    workflows: RwLock<HashMap<WorkflowId, Arc<Workflow>>>,
    executions: DashMap<ExecutionId, ExecutionHandle>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = WorkflowExecutor::new(registry.clone(), event_bus.clone())
            .with_max_parallel(config.max_parallel_nodes)
            .with_node_timeout(config.node_timeout_ms.map(Duration::from_millis))
            .with_cancel_grace(Duration::from_millis(config.cancel_grace_ms));

        Self {
            registry,
            executor: Arc::new(executor),
            event_bus,
            workflows: RwLock::new(HashMap::new()),
            executions: DashMap::new(),
            config,
        }
    }

    /// Get access to the node registry for registering node types
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a workflow, replacing any with the same id. Runs already in
    /// flight keep the definition they started with.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<(), FlowError> {
        workflow.validate()?;
        tracing::info!(workflow_id = %workflow.id, nodes = workflow.nodes.len(), "Registering workflow");
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id.clone(), Arc::new(workflow));
        Ok(())
    }

    pub async fn workflow(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    pub async fn list_workflows(&self) -> Vec<Arc<Workflow>> {
        let mut workflows: Vec<_> = self.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    /// Register every workflow the store holds. Invalid definitions are logged
    /// and skipped. Returns how many were registered.
    pub async fn load_workflows(&self, store: &dyn WorkflowStore) -> Result<usize, FlowError> {
        let mut loaded = 0;
        for workflow in store.load_all().await? {
            let workflow_id = workflow.id.clone();
            match self.register_workflow(workflow).await {
                Ok(()) => loaded += 1,
                Err(err) => tracing::warn!(%workflow_id, error = %err, "Skipping invalid workflow"),
            }
        }
        tracing::info!(loaded, "Loaded workflows from store");
        Ok(loaded)
    }

    /// Validate, persist, then register
    pub async fn save_workflow(
        &self,
        store: &dyn WorkflowStore,
        workflow: Workflow,
    ) -> Result<(), FlowError> {
        workflow.validate()?;
        store.save(&workflow).await?;
        self.register_workflow(workflow).await
    }

    /// Create an instance with every node Waiting and run it in the background.
    /// Returns as soon as the run is spawned.
    pub async fn start_execution(
        &self,
        workflow_id: &str,
        context: Payload,
        mode: Option<ExecutionMode>,
    ) -> Result<ExecutionId, FlowError> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;

        let mode = mode.unwrap_or(self.config.default_mode);
        let instance = ExecutionInstance::new(&workflow, context, mode);
        let execution_id = instance.id;
        let instance: SharedInstance = Arc::new(StdRwLock::new(instance));
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Pending);

        let task = tokio::spawn({
            let executor = self.executor.clone();
            let instance = instance.clone();
            let cancel = cancel.clone();
            async move {
                let run = executor.execute(workflow, instance.clone(), cancel);
                let status = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(status) => status,
                    Err(_) => {
                        tracing::error!(%execution_id, "Run loop panicked");
                        executor.fail_instance(
                            &instance,
                            FlowError::Instance("run loop panicked".to_string()),
                        )
                    }
                };
                status_tx.send_replace(status);
            }
        });

        self.executions.insert(
            execution_id,
            ExecutionHandle {
                instance,
                cancel,
                status: status_rx,
                task,
            },
        );
        tracing::info!(%execution_id, %workflow_id, %mode, "Execution started");
        self.evict_finished();
        Ok(execution_id)
    }

    /// Drop a finished instance. `Ok(false)` while it is still running.
    pub fn forget_execution(&self, execution_id: ExecutionId) -> Result<bool, FlowError> {
        let finished = self
            .executions
            .get(&execution_id)
            .map(|handle| handle.status.borrow().is_terminal())
            .ok_or(FlowError::ExecutionNotFound(execution_id))?;
        if !finished {
            return Ok(false);
        }
        self.executions.remove(&execution_id);
        tracing::debug!(%execution_id, "Execution forgotten");
        Ok(true)
    }

    /// Keep at most `max_retained_executions` finished instances, oldest go first
    fn evict_finished(&self) {
        let Some(limit) = self.config.max_retained_executions else {
            return;
        };
        let mut finished: Vec<(DateTime<Utc>, ExecutionId)> = self
            .executions
            .iter()
            .filter(|handle| handle.status.borrow().is_terminal())
            .map(|handle| {
                let created_at = handle
                    .instance
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .created_at;
                (created_at, *handle.key())
            })
            .collect();
        if finished.len() <= limit {
            return;
        }
        finished.sort();
        let excess = finished.len() - limit;
        for (_, execution_id) in finished.into_iter().take(excess) {
            self.executions.remove(&execution_id);
        }
        tracing::debug!(evicted = excess, "Evicted finished executions");
    }

    /// Request cancellation. `Ok(false)` if the instance already finished.
    pub fn stop_execution(&self, execution_id: ExecutionId) -> Result<bool, FlowError> {
        let handle = self
            .executions
            .get(&execution_id)
            .ok_or(FlowError::ExecutionNotFound(execution_id))?;

        if handle.status.borrow().is_terminal() || handle.snapshot().is_terminal() {
            return Ok(false);
        }
        tracing::info!(%execution_id, "Stopping execution");
        handle.cancel.cancel();
        Ok(true)
    }

    /// Snapshot of the instance's current state
    pub fn get_execution(&self, execution_id: ExecutionId) -> Option<ExecutionInstance> {
        self.executions
            .get(&execution_id)
            .map(|handle| handle.snapshot())
    }

    /// Instance and node logs in timestamp order
    pub fn get_logs(&self, execution_id: ExecutionId) -> Result<Vec<LogEntry>, FlowError> {
        self.get_execution(execution_id)
            .map(|instance| instance.all_logs())
            .ok_or(FlowError::ExecutionNotFound(execution_id))
    }

    /// Snapshots of every known instance, optionally of one workflow, oldest first
    pub fn list_executions(&self, workflow_id: Option<&str>) -> Vec<ExecutionInstance> {
        let mut instances: Vec<ExecutionInstance> = self
            .executions
            .iter()
            .map(|handle| handle.snapshot())
            .filter(|instance| workflow_id.map_or(true, |id| instance.workflow_id == id))
            .collect();
        instances.sort_by_key(|instance| instance.created_at);
        instances
    }

    /// Ids of instances whose background task is still alive
    pub fn active_executions(&self) -> Vec<ExecutionId> {
        self.executions
            .iter()
            .filter(|handle| !handle.task.is_finished())
            .map(|handle| *handle.key())
            .collect()
    }

    /// Wait until the instance reaches a terminal state and return it
    pub async fn wait_for_completion(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionInstance, FlowError> {
        let mut status = self
            .executions
            .get(&execution_id)
            .map(|handle| handle.status.clone())
            .ok_or(FlowError::ExecutionNotFound(execution_id))?;

        status
            .wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| FlowError::Instance("execution task ended unexpectedly".to_string()))?;

        self.get_execution(execution_id)
            .ok_or(FlowError::ExecutionNotFound(execution_id))
    }

    /// Cancel every running instance and wait for all of them to finish
    pub async fn shutdown(&self) {
        let running: Vec<ExecutionId> = self.active_executions();
        for execution_id in &running {
            let _ = self.stop_execution(*execution_id);
        }
        for execution_id in running {
            let _ = self.wait_for_completion(execution_id).await;
        }
    }

    /// Register a new observer
    pub fn connect(&self) -> Subscription {
        self.event_bus.connect()
    }

    pub fn subscribe(&self, observer_id: ObserverId, topic: Topic) -> bool {
        self.event_bus.subscribe(observer_id, topic)
    }

    pub fn unsubscribe(&self, observer_id: ObserverId, topic: &Topic) -> bool {
        self.event_bus.unsubscribe(observer_id, topic)
    }

    /// Drop the observer together with all its subscriptions
    pub fn disconnect(&self, observer_id: ObserverId) -> usize {
        self.event_bus.disconnect(observer_id)
    }

    /// Subscribe to execution events
    pub fn subscribe_all(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe_all()
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    /// Capacity of the firehose broadcast channel
    pub event_buffer_size: usize,
    pub default_mode: ExecutionMode,
    /// Per-node deadline for workflows that do not set one
    pub node_timeout_ms: Option<u64>,
    pub cancel_grace_ms: u64,
    /// Finished instances kept for queries; None keeps all of them
    pub max_retained_executions: Option<usize>,
    pub sandbox: SandboxConfig,
}

impl RuntimeConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            default_mode: ExecutionMode::Sequential,
            node_timeout_ms: None,
            cancel_grace_ms: 5_000,
            max_retained_executions: Some(1_000),
            sandbox: SandboxConfig::default(),
        }
    }
}
