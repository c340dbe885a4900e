use async_trait::async_trait;
use flowcore::{
    ExecutionMode, Node, NodeContext, NodeDispatcher, NodeError, NodeId, NodeMetadata, NodeOutput,
    Payload, PortDefinition,
};
use flowruntime::{insert_manager_nodes, DependencyGraph, ManagerNode, PlanEntry, PlanNode};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_MANAGER_INTERVAL: usize = 10;

/// One entry of the node list a flow node orchestrates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowItem {
    #[serde(alias = "nodeId")]
    pub id: NodeId,
    #[serde(rename = "type", alias = "nodeType", default = "default_item_type")]
    pub node_type: String,
    #[serde(default)]
    pub dependencies: Vec<NodeId>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub estimated_ms: Option<u64>,
    #[serde(default)]
    pub config: Payload,
}

fn default_item_type() -> String {
    "worker".to_string()
}

impl FlowItem {
    fn plan_node(&self) -> PlanNode {
        let node = PlanNode::new(self.id.clone(), self.node_type.clone())
            .with_dependencies(self.dependencies.iter().cloned())
            .with_priority(self.priority);
        match self.estimated_ms {
            Some(ms) => node.with_estimate(ms),
            None => node,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ManagerSpec {
    Id(NodeId),
    Typed {
        #[serde(alias = "nodeId")]
        id: NodeId,
        #[serde(rename = "type")]
        node_type: String,
    },
}

impl From<ManagerSpec> for ManagerNode {
    fn from(spec: ManagerSpec) -> Self {
        match spec {
            ManagerSpec::Id(id) => ManagerNode::infer(id),
            ManagerSpec::Typed { id, node_type } => ManagerNode::new(id, node_type),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnError {
    Stop,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StepResult {
    node_id: NodeId,
    node_type: String,
    is_manager: bool,
    status: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    duration_ms: u64,
}

/// Orchestrates a nested node list through the registry.
///
/// Config (each key may also arrive as an input):
/// - `nodes`: list of [`FlowItem`]
/// - `managers`: ids (type inferred from the id) or `{id, type}` objects run
///   every `manager_interval` entries
/// - `mode`: `sequential` (default), `parallel` or `mixed`
/// - `on_error`: `continue` (default) or `stop`
///
/// Outputs `plan`, `results` and `summary`.
pub struct FlowNode;

#[async_trait]
impl Node for FlowNode {
    fn node_type(&self) -> &str {
        "flow"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let dispatcher = ctx.dispatcher.clone().ok_or_else(|| {
            NodeError::Configuration("flow node needs a registry to dispatch to".to_string())
        })?;

        let items: Vec<FlowItem> = parse_setting(&ctx, "nodes")?.unwrap_or_default();
        let managers: Vec<ManagerNode> = parse_setting::<Vec<ManagerSpec>>(&ctx, "managers")?
            .unwrap_or_default()
            .into_iter()
            .map(ManagerNode::from)
            .collect();
        if let Some(unknown) = managers.iter().find(|m| !dispatcher.contains(&m.node_type)) {
            return Err(NodeError::Configuration(format!(
                "Manager '{}' has unregistered node type '{}'",
                unknown.node_id, unknown.node_type
            )));
        }
        let interval = parse_setting(&ctx, "manager_interval")?.unwrap_or(DEFAULT_MANAGER_INTERVAL);
        let mode = match ctx.input_or_config("mode").and_then(Value::as_str) {
            Some(mode) => mode.parse::<ExecutionMode>().map_err(NodeError::Configuration)?,
            None => ExecutionMode::Sequential,
        };
        let on_error = match ctx.input_or_config("on_error").and_then(Value::as_str) {
            None | Some("continue") | Some("continue_on_error") => OnError::Continue,
            Some("stop") | Some("stop_workflow") => OnError::Stop,
            Some(other) => {
                return Err(NodeError::Configuration(format!(
                    "Unknown on_error policy: {}",
                    other
                )))
            }
        };

        if items.is_empty() && managers.is_empty() {
            ctx.logger.info("No nodes to execute");
            return Ok(NodeOutput::new()
                .with_output("plan", json!([]))
                .with_output("results", json!([]))
                .with_output("summary", summarize(&[])));
        }

        let graph = DependencyGraph::new(items.iter().map(FlowItem::plan_node).collect())
            .map_err(|e| NodeError::Configuration(e.to_string()))?;
        let plan = graph
            .plan(mode)
            .map_err(|e| NodeError::Configuration(e.to_string()))?;
        let stages = stages(&plan.groups, &managers, interval, mode);
        let entries: Vec<&PlanEntry> = stages.iter().flatten().collect();
        ctx.logger.info(format!(
            "Executing {} entries in {} stages ({} mode)",
            entries.len(),
            stages.len(),
            mode
        ));
        let plan_report = serde_json::to_value(&entries)
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;

        let configs: HashMap<&str, &Payload> =
            items.iter().map(|i| (i.id.as_str(), &i.config)).collect();
        let shared = ctx.data_inputs();
        let mut outputs: HashMap<NodeId, Payload> = HashMap::new();
        let mut failed: HashSet<NodeId> = HashSet::new();
        let mut results = Vec::with_capacity(entries.len());

        for stage in &stages {
            if ctx.cancellation.is_cancelled() {
                return Err(NodeError::Cancelled);
            }

            let runs = stage.iter().map(|entry| {
                let blocker = entry
                    .dependencies
                    .iter()
                    .find(|dep| failed.contains(*dep))
                    .cloned();
                let inputs = step_inputs(&shared, entry, &outputs);
                let config = configs.get(entry.node_id.as_str()).map(|c| (*c).clone());
                run_step(&ctx, dispatcher.clone(), entry, inputs, config, blocker)
            });
            let finished = join_all(runs).await;

            if ctx.cancellation.is_cancelled() {
                return Err(NodeError::Cancelled);
            }

            let mut stop = false;
            for (result, output) in finished {
                match output {
                    Some(output) => {
                        outputs.insert(result.node_id.clone(), output);
                    }
                    None => {
                        failed.insert(result.node_id.clone());
                        stop |= result.status == Outcome::Error && on_error == OnError::Stop;
                    }
                }
                results.push(result);
            }
            if stop {
                ctx.logger.warn("Stopping flow after a failed entry");
                break;
            }
        }

        let summary = summarize(&results);
        ctx.logger.data("Flow finished", summary.clone());
        if on_error == OnError::Stop {
            if let Some(failure) = results.iter().find(|r| r.status == Outcome::Error) {
                return Err(NodeError::ExecutionFailed(format!(
                    "Node '{}' failed: {}",
                    failure.node_id,
                    failure.error.as_deref().unwrap_or("unknown error")
                )));
            }
        }

        let results = serde_json::to_value(&results)
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
        Ok(NodeOutput::new()
            .with_output("plan", plan_report)
            .with_output("results", results)
            .with_output("summary", summary))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Plan and run a nested list of nodes".to_string(),
            category: "flow".to_string(),
            inputs: vec![
                PortDefinition::optional("nodes", "Nodes to orchestrate"),
                PortDefinition::optional("managers", "Manager nodes run periodically"),
            ],
            outputs: vec![
                PortDefinition::required("plan", "Entries in execution order"),
                PortDefinition::required("results", "Per-entry outcome"),
                PortDefinition::required("summary", "Totals and success rate"),
            ],
        }
    }

    fn validate_config(&self, config: &Payload) -> Result<(), NodeError> {
        if let Some(nodes) = config.get("nodes") {
            let items: Vec<FlowItem> = serde_json::from_value(nodes.clone())
                .map_err(|e| NodeError::Configuration(format!("Invalid nodes: {}", e)))?;
            DependencyGraph::new(items.iter().map(FlowItem::plan_node).collect())
                .map_err(|e| NodeError::Configuration(e.to_string()))?;
        }
        Ok(())
    }
}

fn parse_setting<T: serde::de::DeserializeOwned>(
    ctx: &NodeContext,
    key: &str,
) -> Result<Option<T>, NodeError> {
    match ctx.input_or_config(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| NodeError::Configuration(format!("Invalid {}: {}", key, e))),
    }
}

/// Split the plan into stages that run one after another. Sequential plans
/// get one entry per stage; otherwise entries of the same dependency group
/// share a stage. Manager runs always form stages of their own.
fn stages(
    groups: &[Vec<PlanEntry>],
    managers: &[ManagerNode],
    interval: usize,
    mode: ExecutionMode,
) -> Vec<Vec<PlanEntry>> {
    let level: HashMap<&str, usize> = groups
        .iter()
        .enumerate()
        .flat_map(|(i, group)| group.iter().map(move |e| (e.node_id.as_str(), i)))
        .collect();
    let entries = insert_manager_nodes(groups.iter().flatten().cloned().collect(), managers, interval);

    let mut stages: Vec<Vec<PlanEntry>> = Vec::new();
    let mut current: Option<(bool, Option<usize>)> = None;
    for entry in entries {
        let key = if entry.is_manager {
            (true, None)
        } else {
            (false, level.get(entry.node_id.as_str()).copied())
        };
        let joins = mode != ExecutionMode::Sequential && current == Some(key);
        match stages.last_mut() {
            Some(stage) if joins => stage.push(entry),
            _ => stages.push(vec![entry]),
        }
        current = Some(key);
    }
    stages
}

fn step_inputs(shared: &Payload, entry: &PlanEntry, outputs: &HashMap<NodeId, Payload>) -> Payload {
    let mut inputs = shared.clone();
    for dep in &entry.dependencies {
        if let Some(output) = outputs.get(dep) {
            inputs.insert(dep.clone(), Value::Object(output.clone()));
        }
    }
    inputs
}

async fn run_step(
    ctx: &NodeContext,
    dispatcher: Arc<dyn NodeDispatcher>,
    entry: &PlanEntry,
    inputs: Payload,
    config: Option<Payload>,
    blocker: Option<NodeId>,
) -> (StepResult, Option<Payload>) {
    let mut result = StepResult {
        node_id: entry.node_id.clone(),
        node_type: entry.node_type.clone(),
        is_manager: entry.is_manager,
        status: Outcome::Skipped,
        output: None,
        error: None,
        duration_ms: 0,
    };
    if let Some(dep) = blocker {
        result.error = Some(format!("upstream node '{}' did not succeed", dep));
        return (result, None);
    }

    let child = ctx
        .child(entry.node_id.as_str())
        .with_inputs(inputs)
        .with_config(config.unwrap_or_default());
    child.logger.info(format!("Running {} node", entry.node_type));

    let started = Instant::now();
    let outcome = dispatcher.dispatch(&entry.node_type, child.clone()).await;
    result.duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(output) => {
            result.status = Outcome::Success;
            result.output = Some(output.outputs.clone());
            (result, Some(output.outputs))
        }
        Err(NodeError::Cancelled) => (result, None),
        Err(err) => {
            child.logger.error(err.to_string());
            result.status = Outcome::Error;
            result.error = Some(err.to_string());
            (result, None)
        }
    }
}

fn summarize(results: &[StepResult]) -> Value {
    let total = results.len();
    let count = |outcome: Outcome| results.iter().filter(|r| r.status == outcome).count();
    let successful = count(Outcome::Success);
    let success_rate = if total > 0 {
        successful as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    let total_ms: u64 = results.iter().map(|r| r.duration_ms).sum();
    let errors: Vec<Value> = results
        .iter()
        .filter(|r| r.status == Outcome::Error)
        .map(|r| json!({ "nodeId": r.node_id, "error": r.error }))
        .collect();

    json!({
        "total": total,
        "successful": successful,
        "failed": count(Outcome::Error),
        "skipped": count(Outcome::Skipped),
        "successRate": success_rate,
        "totalDurationMs": total_ms,
        "errors": errors,
    })
}
