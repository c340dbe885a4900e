use crate::registry::NodeRegistry;
use crate::scheduler::{DependencyGraph, ExecutionPlan};
use chrono::Utc;
use flowcore::{
    ErrorHandling, EventBus, ExecutionEvent, ExecutionId, ExecutionInstance, ExecutionMode,
    ExecutionStatus, FlowError, LogEntry, LogLevel, LogSink, NodeContext, NodeError,
    NodeExecutionRecord, NodeId, NodeLogger, NodeOutput, NodeSpec, NodeStatus, Payload, Workflow,
    CONTEXT_KEY,
};
use futures::stream::{self, FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Instance state shared between the run loop and queries
pub type SharedInstance = Arc<RwLock<ExecutionInstance>>;

/// Drives one execution instance through its plan.
///
/// The executor holds no per-run state, so one executor serves any number of
/// concurrent instances.
pub struct WorkflowExecutor {
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    max_parallel: usize,
    node_timeout: Option<Duration>,
    cancel_grace: Duration,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<NodeRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            event_bus,
            max_parallel: 10,
            node_timeout: None,
            cancel_grace: Duration::from_secs(5),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Node deadline used when a workflow does not set its own
    pub fn with_node_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// How long an in-flight node gets to wind down after cancellation
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Run `instance` to a terminal state and return that state.
    ///
    /// Every transition is written to the instance and published on the event
    /// bus under the instance lock, so observers see them in production order
    /// and the instance's final update is always its last event.
    pub async fn execute(
        &self,
        workflow: Arc<Workflow>,
        instance: SharedInstance,
        cancel: CancellationToken,
    ) -> ExecutionStatus {
        let (execution_id, mode) = {
            let guard = instance.read().unwrap_or_else(PoisonError::into_inner);
            (guard.id, guard.mode)
        };

        let run = Run {
            sink: Arc::new(InstanceLogSink {
                instance: instance.clone(),
                event_bus: self.event_bus.clone(),
            }),
            node_timeout: workflow
                .settings
                .node_timeout_ms
                .map(Duration::from_millis)
                .or(self.node_timeout),
            max_parallel: match mode {
                ExecutionMode::Sequential => 1,
                _ => self.max_parallel.min(workflow.settings.max_parallel_nodes).max(1),
            },
            workflow,
            instance,
            registry: self.registry.clone(),
            event_bus: self.event_bus.clone(),
            stop: cancel.child_token(),
            reason: OnceLock::new(),
            execution_id,
            cancel_grace: self.cancel_grace,
        };

        run.update_instance(|instance| {
            instance.status = ExecutionStatus::Running;
            instance.started_at = Some(Utc::now());
        });
        tracing::info!(%execution_id, workflow_id = %run.workflow.id, %mode, "Starting workflow execution");

        let (status, error) = match run.drive(mode).await {
            Ok(Completion::Finished) => (ExecutionStatus::Success, None),
            Ok(Completion::Aborted(message)) => {
                run.skip_waiting("Skipped after an upstream failure");
                (ExecutionStatus::Failed, Some(message))
            }
            Ok(Completion::Stopped(StopReason::Cancelled)) => (
                ExecutionStatus::Cancelled,
                Some(FlowError::CancellationRequested(execution_id).to_string()),
            ),
            Ok(Completion::Stopped(StopReason::TimedOut(ms))) => (
                ExecutionStatus::Timeout,
                Some(format!("Execution timed out after {}ms", ms)),
            ),
            Err(err) => (ExecutionStatus::Failed, Some(err.to_string())),
        };

        match &error {
            Some(error) if status == ExecutionStatus::Failed => {
                tracing::error!(%execution_id, "Workflow execution failed: {}", error)
            }
            _ => tracing::info!(%execution_id, ?status, "Workflow execution finished"),
        }

        run.update_instance(|instance| {
            instance.status = status;
            instance.error = error;
            instance.completed_at = Some(Utc::now());
        });
        status
    }

    /// Fail an instance from outside the run loop, e.g. after the loop itself panicked
    pub fn fail_instance(&self, instance: &SharedInstance, error: FlowError) -> ExecutionStatus {
        let mut guard = instance.write().unwrap_or_else(PoisonError::into_inner);
        if guard.is_terminal() {
            return guard.status;
        }
        guard.status = ExecutionStatus::Failed;
        guard.error = Some(error.to_string());
        guard.completed_at = Some(Utc::now());
        self.event_bus.emit(ExecutionEvent::ExecutionUpdate {
            execution: guard.clone(),
        });
        ExecutionStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    TimedOut(u64),
}

enum Completion {
    Finished,
    /// A node failed under the stop policy
    Aborted(String),
    Stopped(StopReason),
}

struct NodeOutcome {
    node_id: NodeId,
    status: NodeStatus,
    error: Option<String>,
}

enum Readiness {
    Ready,
    Waiting,
    Blocked(NodeId),
}

/// Appends node-scoped entries to the instance and publishes them.
/// Entries arriving after the instance is terminal are dropped.
struct InstanceLogSink {
    instance: SharedInstance,
    event_bus: Arc<EventBus>,
}

impl LogSink for InstanceLogSink {
    fn record(&self, entry: LogEntry) {
        let mut instance = self.instance.write().unwrap_or_else(PoisonError::into_inner);
        if instance.is_terminal() {
            return;
        }
        match entry
            .node_id
            .as_deref()
            .and_then(|id| instance.node_executions.get_mut(id))
        {
            Some(record) => record.logs.push(entry.clone()),
            None => instance.logs.push(entry.clone()),
        }
        self.event_bus.emit(ExecutionEvent::Log {
            execution_id: instance.id,
            workflow_id: instance.workflow_id.clone(),
            entry,
        });
    }
}

struct Run {
    workflow: Arc<Workflow>,
    instance: SharedInstance,
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    sink: Arc<dyn LogSink>,
    /// Fires on caller cancellation or when the run deadline passes
    stop: CancellationToken,
    reason: OnceLock<StopReason>,
    execution_id: ExecutionId,
    node_timeout: Option<Duration>,
    cancel_grace: Duration,
    max_parallel: usize,
}

impl Run {
    async fn drive(&self, mode: ExecutionMode) -> Result<Completion, FlowError> {
        self.workflow.validate()?;
        self.registry.ensure_known(&self.workflow)?;
        let graph = DependencyGraph::from_workflow(&self.workflow)?;
        let plan = graph.plan(mode)?;

        self.log(
            LogLevel::Info,
            format!("Executing {} nodes in {} mode", plan.len(), mode),
        );

        let walk = self.walk(&plan, &graph);
        tokio::pin!(walk);

        let outcome = match self.workflow.settings.max_execution_time_ms {
            Some(ms) => {
                tokio::select! {
                    outcome = &mut walk => outcome,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        if !self.stop.is_cancelled() {
                            let _ = self.reason.set(StopReason::TimedOut(ms));
                            tracing::warn!(execution_id = %self.execution_id, ms, "Execution deadline passed");
                            self.stop.cancel();
                        }
                        walk.await
                    }
                }
            }
            None => walk.await,
        };

        Ok(match outcome? {
            Some(message) => Completion::Aborted(message),
            None if self.stop.is_cancelled() => Completion::Stopped(
                self.reason.get().copied().unwrap_or(StopReason::Cancelled),
            ),
            None => Completion::Finished,
        })
    }

    /// Returns the abort message if a node failed under the stop policy
    async fn walk(
        &self,
        plan: &ExecutionPlan,
        graph: &DependencyGraph,
    ) -> Result<Option<String>, FlowError> {
        match plan.mode {
            ExecutionMode::Sequential | ExecutionMode::Parallel => self.walk_groups(plan).await,
            ExecutionMode::Mixed => self.walk_dataflow(graph).await,
        }
    }

    /// Groups run one after another. Inside a group up to `max_parallel` nodes run
    /// at once and the group is joined before the next one starts.
    async fn walk_groups(&self, plan: &ExecutionPlan) -> Result<Option<String>, FlowError> {
        for group in &plan.groups {
            if self.stop.is_cancelled() {
                break;
            }

            let mut runnable = Vec::with_capacity(group.len());
            for entry in group {
                match self.readiness(&entry.node_id) {
                    Readiness::Blocked(upstream) => self.skip_blocked(&entry.node_id, &upstream),
                    _ => runnable.push(entry.node_id.clone()),
                }
            }

            let outcomes: Vec<Result<NodeOutcome, FlowError>> = stream::iter(runnable)
                .map(|node_id| self.run_node(node_id))
                .buffer_unordered(self.max_parallel)
                .collect()
                .await;

            let mut abort = None;
            for outcome in outcomes {
                let outcome = outcome?;
                if abort.is_none() {
                    abort = self.abort_message(&outcome);
                }
            }
            if abort.is_some() {
                return Ok(abort);
            }
        }
        Ok(None)
    }

    /// Dataflow: a node starts as soon as all its dependencies are terminal.
    /// Ready nodes start in priority order, then declaration order.
    async fn walk_dataflow(&self, graph: &DependencyGraph) -> Result<Option<String>, FlowError> {
        let mut pending: Vec<(usize, &NodeId, i32)> = graph
            .nodes()
            .iter()
            .enumerate()
            .map(|(pos, node)| (pos, &node.id, node.priority))
            .collect();
        pending.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        let mut pending: Vec<NodeId> = pending.into_iter().map(|(_, id, _)| id.clone()).collect();

        let mut running = FuturesUnordered::new();
        let mut abort = None;

        loop {
            if abort.is_none() && !self.stop.is_cancelled() {
                let mut progressed = true;
                while progressed {
                    progressed = false;
                    let mut still_pending = Vec::with_capacity(pending.len());
                    for node_id in pending.drain(..) {
                        match self.readiness(&node_id) {
                            Readiness::Blocked(upstream) => {
                                self.skip_blocked(&node_id, &upstream);
                                progressed = true;
                            }
                            Readiness::Ready if running.len() < self.max_parallel => {
                                running.push(self.run_node(node_id));
                            }
                            _ => still_pending.push(node_id),
                        }
                    }
                    pending = still_pending;
                }
            }

            match running.next().await {
                Some(outcome) => {
                    let outcome = outcome?;
                    if abort.is_none() {
                        abort = self.abort_message(&outcome);
                    }
                }
                None => break,
            }
        }

        Ok(abort)
    }

    fn abort_message(&self, outcome: &NodeOutcome) -> Option<String> {
        if outcome.status != NodeStatus::Failed
            || self.workflow.settings.on_error != ErrorHandling::StopWorkflow
        {
            return None;
        }
        Some(format!(
            "Node '{}' failed: {}",
            outcome.node_id,
            outcome.error.as_deref().unwrap_or("unknown error")
        ))
    }

    fn readiness(&self, node_id: &str) -> Readiness {
        let instance = self.read();
        if instance.node(node_id).map(|r| r.status) != Some(NodeStatus::Waiting) {
            return Readiness::Waiting;
        }
        let mut ready = true;
        for dep in self.workflow.dependencies_of(node_id) {
            match instance.node(&dep).map(|r| r.status) {
                Some(NodeStatus::Success) => {}
                Some(NodeStatus::Failed) | Some(NodeStatus::Skipped) => {
                    return Readiness::Blocked(dep)
                }
                _ => ready = false,
            }
        }
        if ready {
            Readiness::Ready
        } else {
            Readiness::Waiting
        }
    }

    async fn run_node(&self, node_id: NodeId) -> Result<NodeOutcome, FlowError> {
        // Nodes queued behind a cancelled run are never started
        if self.stop.is_cancelled() {
            return Ok(NodeOutcome {
                node_id,
                status: NodeStatus::Waiting,
                error: None,
            });
        }

        let spec = self.workflow.find_node(&node_id).ok_or_else(|| {
            FlowError::Instance(format!("plan references unknown node '{}'", node_id))
        })?;

        let inputs = self.resolve_inputs(&node_id);
        self.update_node(&node_id, |record| {
            record.status = NodeStatus::Running;
            record.started_at = Some(Utc::now());
            record.input = Some(inputs.clone());
        });
        tracing::debug!(
            execution_id = %self.execution_id,
            node_id = %node_id,
            node_type = %spec.node_type,
            "Node started"
        );

        let logger = NodeLogger::new(node_id.clone(), self.sink.clone());
        let started = Instant::now();
        let result = self.invoke_with_retry(spec, &inputs, &logger).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(output) => {
                self.update_node(&node_id, |record| {
                    record.status = NodeStatus::Success;
                    record.completed_at = Some(Utc::now());
                    record.output = Some(output.outputs);
                });
                tracing::info!(execution_id = %self.execution_id, "Node {} completed in {}ms", node_id, duration_ms);
                NodeOutcome {
                    node_id,
                    status: NodeStatus::Success,
                    error: None,
                }
            }
            Err(err) if err.is_cancelled() || self.stop.is_cancelled() => {
                self.update_node(&node_id, |record| {
                    record.status = NodeStatus::Skipped;
                    record.completed_at = Some(Utc::now());
                });
                tracing::info!(execution_id = %self.execution_id, node_id = %node_id, "Node cancelled");
                NodeOutcome {
                    node_id,
                    status: NodeStatus::Skipped,
                    error: None,
                }
            }
            Err(err) => {
                let message = err.to_string();
                self.update_node(&node_id, |record| {
                    record.status = NodeStatus::Failed;
                    record.completed_at = Some(Utc::now());
                    record.error = Some(message.clone());
                    record.diagnostic = err.diagnostic();
                });
                let failure = FlowError::node(node_id.clone(), err);
                logger.error(failure.to_string());
                tracing::error!(execution_id = %self.execution_id, "{}", failure);
                NodeOutcome {
                    node_id,
                    status: NodeStatus::Failed,
                    error: Some(message),
                }
            }
        };
        Ok(outcome)
    }

    async fn invoke_with_retry(
        &self,
        spec: &NodeSpec,
        inputs: &Payload,
        logger: &NodeLogger,
    ) -> Result<NodeOutput, NodeError> {
        let policy = spec.retry_policy.as_ref();
        let max_attempts = policy.map(|p| p.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.write(|instance| {
                if let Some(record) = instance.node_mut(&spec.id) {
                    record.attempts = attempt;
                }
            });

            let err = match self.invoke(spec, inputs.clone(), logger.clone()).await {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            if err.is_cancelled() || attempt >= max_attempts || self.stop.is_cancelled() {
                return Err(err);
            }

            let delay = policy.map(|p| p.delay_for(attempt)).unwrap_or_default();
            logger.warn(format!(
                "Attempt {}/{} failed: {}. Retrying in {}ms",
                attempt,
                max_attempts,
                err,
                delay.as_millis()
            ));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => return Err(NodeError::Cancelled),
            }
        }
    }

    /// One attempt under the node deadline. A node that ignores its
    /// cancellation token is abandoned after the grace period.
    async fn invoke(
        &self,
        spec: &NodeSpec,
        inputs: Payload,
        logger: NodeLogger,
    ) -> Result<NodeOutput, NodeError> {
        let token = self.stop.child_token();
        let ctx = NodeContext::new(spec.id.clone())
            .with_execution_id(self.execution_id)
            .with_inputs(inputs)
            .with_config(spec.config.clone())
            .with_logger(logger)
            .with_cancellation(token.clone())
            .with_dispatcher(self.registry.clone());

        let call = self.registry.execute(&spec.node_type, ctx);
        tokio::pin!(call);

        let deadline = self.node_timeout;
        let expired = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = &mut call => result,
            _ = expired => {
                token.cancel();
                let _ = tokio::time::timeout(self.cancel_grace, &mut call).await;
                let ms = deadline.map(|d| d.as_millis() as u64).unwrap_or_default();
                Err(NodeError::Timeout { ms })
            }
            _ = self.stop.cancelled() => {
                match tokio::time::timeout(self.cancel_grace, &mut call).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            execution_id = %self.execution_id,
                            node_id = %spec.id,
                            "Node did not stop within the grace period"
                        );
                        Err(NodeError::Cancelled)
                    }
                }
            }
        }
    }

    /// Upstream outputs per incoming connection, plus the shared context under `_context`
    fn resolve_inputs(&self, node_id: &str) -> Payload {
        let instance = self.read();
        let mut inputs = Payload::new();

        for conn in self.workflow.incoming(node_id) {
            let Some(output) = instance
                .node(&conn.from_node)
                .and_then(|record| record.output.as_ref())
            else {
                continue;
            };
            match (&conn.from_port, &conn.to_port) {
                (Some(from), to) => {
                    if let Some(value) = output.get(from) {
                        let key = to.clone().unwrap_or_else(|| from.clone());
                        inputs.insert(key, value.clone());
                    }
                }
                (None, Some(to)) => {
                    inputs.insert(to.clone(), Value::Object(output.clone()));
                }
                (None, None) => inputs.extend(output.clone()),
            }
        }

        inputs.insert(
            CONTEXT_KEY.to_string(),
            Value::Object(instance.context.clone()),
        );
        inputs
    }

    fn skip_blocked(&self, node_id: &str, upstream: &str) {
        self.update_node(node_id, |record| {
            record.status = NodeStatus::Skipped;
            record.completed_at = Some(Utc::now());
        });
        self.log_node(
            node_id,
            LogLevel::Warning,
            format!("Skipped: upstream node '{}' did not succeed", upstream),
        );
    }

    /// Mark every node that never started as Skipped
    fn skip_waiting(&self, reason: &str) {
        let waiting: Vec<NodeId> = {
            let instance = self.read();
            self.workflow
                .nodes
                .iter()
                .filter(|spec| {
                    instance.node(&spec.id).map(|r| r.status) == Some(NodeStatus::Waiting)
                })
                .map(|spec| spec.id.clone())
                .collect()
        };
        for node_id in waiting {
            self.update_node(&node_id, |record| {
                record.status = NodeStatus::Skipped;
                record.completed_at = Some(Utc::now());
            });
            self.log_node(&node_id, LogLevel::Info, reason);
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.record(LogEntry::new(level, message));
    }

    fn log_node(&self, node_id: &str, level: LogLevel, message: impl Into<String>) {
        self.sink.record(LogEntry::new(level, message).with_node(node_id));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ExecutionInstance> {
        self.instance.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write<R>(&self, f: impl FnOnce(&mut ExecutionInstance) -> R) -> R {
        let mut instance = self.instance.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut instance)
    }

    /// Apply a node transition and publish it
    fn update_node(&self, node_id: &str, f: impl FnOnce(&mut NodeExecutionRecord)) {
        self.write(|instance| {
            let execution_id = instance.id;
            let workflow_id = instance.workflow_id.clone();
            if let Some(record) = instance.node_mut(node_id) {
                f(record);
                self.event_bus.emit(ExecutionEvent::NodeUpdate {
                    execution_id,
                    workflow_id,
                    node: record.clone(),
                });
            }
        });
    }

    /// Apply an instance transition and publish it
    fn update_instance(&self, f: impl FnOnce(&mut ExecutionInstance)) {
        self.write(|instance| {
            f(instance);
            self.event_bus.emit(ExecutionEvent::ExecutionUpdate {
                execution: instance.clone(),
            });
        });
    }
}
