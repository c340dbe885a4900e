use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use flowcore::{Node, NodeContext, NodeError, NodeId, NodeMetadata, NodeOutput, PortDefinition};
use flowruntime::{DependencyGraph, PlanNode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

pub const DEFAULT_TASK_PRIORITY: i32 = 50;
pub const DEFAULT_TASK_MINUTES: u64 = 30;
/// About a century
pub const MAX_TASK_MINUTES: u64 = 100 * 365 * 24 * 60;
/// Tasks on one node at or above this count get a batch suggestion
pub const BATCH_THRESHOLD: usize = 5;
const TIMELINE_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub node_id: NodeId,
    pub task_name: String,
    pub estimated_minutes: u64,
    pub actual_minutes: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub dependencies: Vec<String>,
    pub priority: i32,
    pub status: TaskStatus,
}

/// Task submission as it arrives in `new_tasks`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub node_id: NodeId,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default, alias = "estimatedTime")]
    pub estimated_minutes: Option<u64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Completion {
    id: String,
    #[serde(default, alias = "actualTime")]
    actual_minutes: Option<u64>,
}

struct Queued {
    priority: i32,
    seq: u64,
    task: ScheduledTask,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then earlier insertion
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending, running and completed tasks of one scheduler node
#[derive(Default)]
pub struct TaskQueue {
    pending: BinaryHeap<Queued>,
    running: HashMap<String, ScheduledTask>,
    completed: Vec<ScheduledTask>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one task. See [`TaskQueue::push_all`].
    pub fn push(&mut self, request: TaskRequest) -> Result<String, NodeError> {
        let mut ids = self.push_all(vec![request])?;
        ids.pop()
            .ok_or_else(|| NodeError::ExecutionFailed("task was not queued".to_string()))
    }

    /// Queue a batch of tasks, all or nothing. Fails without touching the queue
    /// on a duplicate id, an estimate above [`MAX_TASK_MINUTES`] or a
    /// dependency cycle among pending tasks.
    pub fn push_all(&mut self, requests: Vec<TaskRequest>) -> Result<Vec<String>, NodeError> {
        let mut reserved = HashSet::new();
        for request in &requests {
            if let Some(minutes) = request.estimated_minutes.filter(|m| *m > MAX_TASK_MINUTES) {
                return Err(NodeError::Configuration(format!(
                    "Task estimate of {} minutes exceeds the maximum of {}",
                    minutes, MAX_TASK_MINUTES
                )));
            }
            if let Some(id) = &request.id {
                if self.contains(id) || !reserved.insert(id.clone()) {
                    return Err(NodeError::Configuration(format!("Duplicate task id: {}", id)));
                }
            }
        }

        let first_seq = self.next_seq;
        let ids = requests
            .into_iter()
            .map(|request| self.insert(request, &reserved))
            .collect();
        if let Err(err) = self.batches() {
            self.pending.retain(|queued| queued.seq <= first_seq);
            self.next_seq = first_seq;
            return Err(err);
        }
        Ok(ids)
    }

    fn insert(&mut self, request: TaskRequest, reserved: &HashSet<String>) -> String {
        self.next_seq += 1;
        let id = match request.id {
            Some(id) => id,
            None => {
                let mut n = self.next_seq;
                loop {
                    let candidate = format!("task_{}", n);
                    if !self.contains(&candidate) && !reserved.contains(&candidate) {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };
        let task = ScheduledTask {
            id: id.clone(),
            node_id: request.node_id,
            task_name: request
                .task_name
                .unwrap_or_else(|| "Unnamed Task".to_string()),
            estimated_minutes: request.estimated_minutes.unwrap_or(DEFAULT_TASK_MINUTES),
            actual_minutes: None,
            started_at: None,
            ended_at: None,
            dependencies: request.dependencies,
            priority: request.priority.unwrap_or(DEFAULT_TASK_PRIORITY),
            status: TaskStatus::Scheduled,
        };
        self.pending.push(Queued {
            priority: task.priority,
            seq: self.next_seq,
            task,
        });
        id
    }

    /// Whether a task with this id is pending, running or completed
    pub fn contains(&self, id: &str) -> bool {
        self.pending.iter().any(|queued| queued.task.id == id)
            || self.running.contains_key(id)
            || self.completed.iter().any(|task| task.id == id)
    }

    /// Move a pending task to running. False if it is not pending.
    pub fn start(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let mut found = None;
        self.pending.retain(|queued| {
            if found.is_none() && queued.task.id == id {
                found = Some(queued.task.clone());
                false
            } else {
                true
            }
        });
        let Some(mut task) = found else {
            return false;
        };
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        self.running.insert(task.id.clone(), task);
        true
    }

    /// Move a running task to completed. False if it is not running.
    pub fn complete(&mut self, id: &str, actual_minutes: Option<u64>, now: DateTime<Utc>) -> bool {
        let Some(mut task) = self.running.remove(id) else {
            return false;
        };
        let elapsed = task
            .started_at
            .map(|started| (now - started).num_minutes().max(0) as u64);
        task.status = TaskStatus::Completed;
        task.ended_at = Some(now);
        task.actual_minutes = actual_minutes.or(elapsed);
        self.completed.push(task);
        true
    }

    /// Pending tasks, highest priority first, ties in submission order
    pub fn pending(&self) -> Vec<ScheduledTask> {
        let mut queued: Vec<&Queued> = self.pending.iter().collect();
        queued.sort_by(|a, b| b.cmp(a));
        queued.into_iter().map(|q| q.task.clone()).collect()
    }

    pub fn running(&self) -> Vec<ScheduledTask> {
        let mut running: Vec<_> = self.running.values().cloned().collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        running
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Pending tasks grouped into dependency levels. Dependencies on tasks that
    /// are not pending (running, completed or unknown) do not hold a task back.
    pub fn batches(&self) -> Result<Vec<Vec<ScheduledTask>>, NodeError> {
        let pending = self.pending();
        let ids: HashSet<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        let nodes = pending
            .iter()
            .map(|task| {
                PlanNode::new(task.id.clone(), task.node_id.clone())
                    .with_dependencies(
                        task.dependencies
                            .iter()
                            .filter(|dep| ids.contains(dep.as_str()))
                            .cloned(),
                    )
                    .with_priority(task.priority)
            })
            .collect();
        let graph = DependencyGraph::new(nodes)
            .map_err(|e| NodeError::Configuration(e.to_string()))?;
        let groups = graph
            .parallel_groups()
            .map_err(|e| NodeError::Configuration(e.to_string()))?;

        let by_id: HashMap<&str, &ScheduledTask> =
            pending.iter().map(|t| (t.id.as_str(), t)).collect();
        Ok(groups
            .into_iter()
            .map(|group| {
                group
                    .iter()
                    .filter_map(|id| by_id.get(id.as_str()).map(|t| (*t).clone()))
                    .collect()
            })
            .collect())
    }

    /// Running tasks past their estimate
    pub fn delayed(&self, now: DateTime<Utc>) -> Vec<Value> {
        self.running()
            .into_iter()
            .filter_map(|task| {
                let started = task.started_at?;
                let expected_end = after_minutes(started, task.estimated_minutes)?;
                (now > expected_end).then(|| {
                    json!({
                        "taskId": task.id,
                        "taskName": task.task_name,
                        "nodeId": task.node_id,
                        "delayMinutes": (now - expected_end).num_minutes(),
                        "estimatedMinutes": task.estimated_minutes,
                        "startedAt": started,
                    })
                })
            })
            .collect()
    }

    /// Suggestions for nodes with many pending tasks
    pub fn batch_suggestions(&self) -> Vec<Value> {
        let mut by_node: Vec<(NodeId, Vec<ScheduledTask>)> = Vec::new();
        for task in self.pending() {
            match by_node.iter_mut().find(|(node, _)| *node == task.node_id) {
                Some((_, tasks)) => tasks.push(task),
                None => by_node.push((task.node_id.clone(), vec![task])),
            }
        }

        by_node
            .into_iter()
            .filter(|(_, tasks)| tasks.len() >= BATCH_THRESHOLD)
            .map(|(node_id, tasks)| {
                let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
                let independent = tasks
                    .iter()
                    .all(|t| t.dependencies.iter().all(|d| !ids.contains(d.as_str())));
                let total = total_minutes(&tasks);
                json!({
                    "name": format!("Batch operation for {}", node_id),
                    "nodeId": node_id,
                    "taskCount": tasks.len(),
                    "estimatedMinutes": total,
                    "avgMinutesPerTask": total as f64 / tasks.len() as f64,
                    "canParallelize": independent,
                })
            })
            .collect()
    }
}

/// `start` plus `minutes`, or None past the representable range
fn after_minutes(start: DateTime<Utc>, minutes: u64) -> Option<DateTime<Utc>> {
    let delta = Duration::try_minutes(i64::try_from(minutes).ok()?)?;
    start.checked_add_signed(delta)
}

fn total_minutes(tasks: &[ScheduledTask]) -> u64 {
    tasks
        .iter()
        .fold(0u64, |total, task| total.saturating_add(task.estimated_minutes))
}

fn timeline(batches: &[Vec<ScheduledTask>], now: DateTime<Utc>) -> Vec<Value> {
    let mut cursor = now;
    batches
        .iter()
        .flatten()
        .take(TIMELINE_LEN)
        .map(|task| {
            let start = cursor;
            let end = after_minutes(start, task.estimated_minutes).unwrap_or(DateTime::<Utc>::MAX_UTC);
            cursor = end;
            json!({
                "taskId": task.id,
                "nodeId": task.node_id,
                "taskName": task.task_name,
                "start": start,
                "end": end,
                "durationMinutes": task.estimated_minutes,
            })
        })
        .collect()
}

/// Keeps a priority queue of tasks per scheduler node and reports a schedule.
///
/// Inputs or config: `new_tasks` (list of [`TaskRequest`]), `start` (task ids),
/// `complete` (ids or `{id, actualMinutes}`). State survives across runs of the
/// same node id for the lifetime of this executor.
#[derive(Default)]
pub struct SchedulerNode {
    queues: DashMap<NodeId, TaskQueue>,
}

impl SchedulerNode {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Node for SchedulerNode {
    fn node_type(&self) -> &str {
        "scheduler"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let new_tasks: Vec<TaskRequest> = setting(&ctx, "new_tasks")?;
        let starts: Vec<String> = setting(&ctx, "start")?;
        let completions: Vec<Completion> = setting::<Vec<Value>>(&ctx, "complete")?
            .into_iter()
            .map(|value| match value {
                Value::String(id) => Ok(Completion {
                    id,
                    actual_minutes: None,
                }),
                other => serde_json::from_value(other)
                    .map_err(|e| NodeError::Configuration(format!("Invalid complete: {}", e))),
            })
            .collect::<Result<_, _>>()?;

        let now = Utc::now();
        let mut queue = self.queues.entry(ctx.node_id.clone()).or_default();

        for id in queue.push_all(new_tasks)? {
            ctx.logger.debug(format!("Scheduled task {}", id));
        }
        for id in &starts {
            if !queue.start(id, now) {
                ctx.logger.warn(format!("Cannot start task {}: not pending", id));
            }
        }
        for completion in completions {
            if !queue.complete(&completion.id, completion.actual_minutes, now) {
                ctx.logger
                    .warn(format!("Cannot complete task {}: not running", completion.id));
            }
        }

        let batches = queue.batches()?;
        let scheduled = queue.pending();
        let total_estimated = total_minutes(&scheduled);
        let delayed = queue.delayed(now);
        if !delayed.is_empty() {
            ctx.logger.warn(format!("{} task(s) running past their estimate", delayed.len()));
        }
        ctx.logger.info(format!(
            "{} pending, {} running, {} completed",
            scheduled.len(),
            queue.running().len(),
            queue.completed_count()
        ));

        Ok(NodeOutput::new()
            .with_output("scheduled_tasks", json!(scheduled))
            .with_output("batches", json!(batches))
            .with_output("timeline", timeline(&batches, now))
            .with_output("batch_operations", queue.batch_suggestions())
            .with_output("delayed_tasks", delayed)
            .with_output("total_estimated_minutes", total_estimated)
            .with_output("running_tasks", json!(queue.running()))
            .with_output("completed_count", queue.completed_count()))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Priority task queue with batching and delay detection".to_string(),
            category: "management".to_string(),
            inputs: vec![
                PortDefinition::optional("new_tasks", "Tasks to enqueue"),
                PortDefinition::optional("start", "Ids of tasks that started"),
                PortDefinition::optional("complete", "Ids of tasks that finished"),
            ],
            outputs: vec![
                PortDefinition::required("scheduled_tasks", "Pending tasks by priority"),
                PortDefinition::required("batches", "Dependency levels of pending tasks"),
                PortDefinition::required("timeline", "Estimated start and end of the next tasks"),
                PortDefinition::required("delayed_tasks", "Running tasks past their estimate"),
            ],
        }
    }
}

fn setting<T: serde::de::DeserializeOwned + Default>(
    ctx: &NodeContext,
    key: &str,
) -> Result<T, NodeError> {
    match ctx.input_or_config(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| NodeError::Configuration(format!("Invalid {}: {}", key, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, node: &str, priority: i32, deps: &[&str]) -> TaskRequest {
        TaskRequest {
            id: Some(id.to_string()),
            node_id: node.to_string(),
            task_name: None,
            estimated_minutes: Some(10),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: Some(priority),
        }
    }

    #[test]
    fn pending_is_priority_then_insertion() {
        let mut queue = TaskQueue::new();
        queue.push(request("low", "n", 10, &[])).unwrap();
        queue.push(request("a", "n", 80, &[])).unwrap();
        queue.push(request("b", "n", 80, &[])).unwrap();
        queue.push(request("mid", "n", 50, &[])).unwrap();

        let ids: Vec<String> = queue.pending().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b", "mid", "low"]);
    }

    #[test]
    fn batches_respect_dependencies_between_pending_tasks() {
        let mut queue = TaskQueue::new();
        queue.push(request("load", "db", 90, &["extract"])).unwrap();
        queue.push(request("extract", "api", 10, &[])).unwrap();
        queue.push(request("report", "mail", 50, &["gone"])).unwrap();

        let batches = queue.batches().unwrap();
        let ids: Vec<Vec<String>> = batches
            .iter()
            .map(|b| b.iter().map(|t| t.id.clone()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["report", "extract"], vec!["load"]]);
    }

    #[test]
    fn start_and_complete_move_tasks() {
        let mut queue = TaskQueue::new();
        queue.push(request("t1", "n", 50, &[])).unwrap();
        let now = Utc::now();

        assert!(!queue.complete("t1", None, now));
        assert!(queue.start("t1", now));
        assert!(!queue.start("t1", now));
        assert!(queue.pending().is_empty());
        assert_eq!(queue.running()[0].status, TaskStatus::Running);

        assert!(queue.complete("t1", Some(7), now + Duration::minutes(3)));
        assert_eq!(queue.completed_count(), 1);
        assert!(queue.running().is_empty());
    }

    #[test]
    fn running_past_estimate_is_delayed() {
        let mut queue = TaskQueue::new();
        queue.push(request("slow", "n", 50, &[])).unwrap();
        let started = Utc::now();
        queue.start("slow", started);

        assert!(queue.delayed(started + Duration::minutes(5)).is_empty());
        let delayed = queue.delayed(started + Duration::minutes(25));
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0]["taskId"], "slow");
        assert_eq!(delayed[0]["delayMinutes"], 15);
    }

    #[test]
    fn batch_suggestion_needs_five_tasks_on_one_node() {
        let mut queue = TaskQueue::new();
        for i in 0..4 {
            queue.push(request(&format!("t{}", i), "busy", 50, &[])).unwrap();
        }
        queue.push(request("other", "quiet", 50, &[])).unwrap();
        assert!(queue.batch_suggestions().is_empty());

        queue.push(request("t4", "busy", 50, &["t0"])).unwrap();
        let suggestions = queue.batch_suggestions();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0]["nodeId"], "busy");
        assert_eq!(suggestions[0]["taskCount"], 5);
        assert_eq!(suggestions[0]["canParallelize"], false);
    }

    #[test]
    fn rejected_batch_leaves_the_queue_untouched() {
        let mut queue = TaskQueue::new();
        queue.push(request("t", "n", 50, &[])).unwrap();

        let duplicate = queue.push_all(vec![request("u", "n", 50, &[]), request("t", "n", 50, &[])]);
        assert!(matches!(duplicate, Err(NodeError::Configuration(msg)) if msg.contains("Duplicate task id: t")));
        let within_batch = queue.push_all(vec![request("v", "n", 50, &[]), request("v", "n", 50, &[])]);
        assert!(within_batch.is_err());
        let cycle = queue.push_all(vec![request("a", "n", 50, &["b"]), request("b", "n", 50, &["a"])]);
        assert!(cycle.is_err());

        let ids: Vec<String> = queue.pending().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t"]);
        assert_eq!(queue.batches().unwrap().len(), 1);
    }

    #[test]
    fn ids_of_started_and_completed_tasks_stay_taken() {
        let mut queue = TaskQueue::new();
        let now = Utc::now();
        queue.push(request("t", "n", 50, &[])).unwrap();
        queue.start("t", now);
        assert!(queue.push(request("t", "n", 50, &[])).is_err());
        queue.complete("t", None, now);
        assert!(queue.push(request("t", "n", 50, &[])).is_err());
    }

    #[test]
    fn generated_ids_skip_taken_ones() {
        let mut queue = TaskQueue::new();
        queue.push(request("task_2", "n", 50, &[])).unwrap();
        let mut unnamed = request("x", "n", 50, &[]);
        unnamed.id = None;
        let id = queue.push(unnamed).unwrap();
        assert_ne!(id, "task_2");
        assert_eq!(queue.pending().len(), 2);
    }

    #[test]
    fn huge_estimates_are_rejected_and_never_overflow() {
        let mut queue = TaskQueue::new();
        let mut huge = request("huge", "n", 50, &[]);
        huge.estimated_minutes = Some(1_000_000_000_000_000_000);
        assert!(queue.push(huge).is_err());
        assert!(queue.pending().is_empty());

        let now = Utc::now();
        assert_eq!(after_minutes(now, u64::MAX), None);
        assert_eq!(after_minutes(now, MAX_TASK_MINUTES).map(|t| t > now), Some(true));

        let mut longest = request("long", "n", 50, &[]);
        longest.estimated_minutes = Some(MAX_TASK_MINUTES);
        queue.push(longest).unwrap();
        let entries = timeline(&queue.batches().unwrap(), now);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["durationMinutes"], json!(MAX_TASK_MINUTES));
        queue.start("long", now);
        assert!(queue.delayed(now).is_empty());
    }
}
