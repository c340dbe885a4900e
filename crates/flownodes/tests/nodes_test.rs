use flowcore::{
    ExecutionInstance, ExecutionMode, ExecutionStatus, Node, NodeContext, NodeError, NodeSpec,
    NodeStatus, Payload, Workflow,
};
use flownodes::{
    node_output, register_all, CodeNode, DelayNode, FileReadNode, FileWriteNode, JsonParseNode,
    JsonStringifyNode, SchedulerNode,
};
use flowruntime::FlowRuntime;
use flowsandbox::{Bindings, SandboxConfig, SandboxLimits, SandboxResult, SandboxRunner, SandboxStatus};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

fn runtime() -> FlowRuntime {
    init_tracing();
    let runtime = FlowRuntime::new();
    register_all(runtime.registry(), Arc::new(SandboxRunner::default()));
    runtime
}

fn config(value: Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

fn code(id: &str, source: &str) -> NodeSpec {
    NodeSpec::new(id, "code").with_config("code", source)
}

async fn run(
    runtime: &FlowRuntime,
    workflow: Workflow,
    context: Payload,
) -> ExecutionInstance {
    let workflow_id = workflow.id.clone();
    runtime.register_workflow(workflow).await.unwrap();
    let execution_id = runtime
        .start_execution(&workflow_id, context, Some(ExecutionMode::Sequential))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(20), runtime.wait_for_completion(execution_id))
        .await
        .expect("execution did not finish")
        .unwrap()
}

#[test]
fn test_every_standard_type_is_registered() {
    let runtime = runtime();
    let types = runtime.registry().list_node_types();
    for expected in [
        "code",
        "debug.log",
        "file.read",
        "file.write",
        "flow",
        "http.request",
        "scheduler",
        "time.delay",
        "transform.json_parse",
        "transform.json_stringify",
    ] {
        assert!(types.contains(&expected.to_string()), "{} missing", expected);
    }
}

#[tokio::test]
async fn test_code_nodes_chain_through_outputs_and_context() {
    let runtime = runtime();
    let mut workflow = Workflow::new("code chain").with_id("code-chain");
    workflow.add_node(code("seed", "output.value = 21"));
    workflow.add_node(code(
        "double",
        "print('doubling', value)\noutput.value = inputs.value * 2\noutput.user = context.user",
    ));
    workflow.connect("seed", "double");

    let mut context = Payload::new();
    context.insert("user".to_string(), json!("ada"));
    let instance = run(&runtime, workflow, context).await;

    assert_eq!(instance.status, ExecutionStatus::Success);
    let double = instance.node("double").unwrap();
    let output = double.output.clone().unwrap();
    assert_eq!(output["value"], json!(42));
    assert_eq!(output["user"], json!("ada"));
    assert!(double.logs.iter().any(|e| e.message == "doubling\t21"));
}

#[tokio::test]
async fn test_script_error_fails_the_node() {
    let runtime = runtime();
    let mut workflow = Workflow::new("broken").with_id("broken");
    workflow.add_node(code("bad", "error('no luck')"));
    let instance = run(&runtime, workflow, Payload::new()).await;

    assert_eq!(instance.status, ExecutionStatus::Failed);
    let bad = instance.node("bad").unwrap();
    assert_eq!(bad.status, NodeStatus::Failed);
    assert!(bad.error.as_deref().unwrap().contains("no luck"));
}

#[tokio::test]
async fn test_float_division_by_zero_fails_the_node() {
    let runtime = runtime();
    let mut workflow = Workflow::new("divide").with_id("divide");
    let divide = workflow.add_node(code("divide", "output.ratio = context.total / context.count"));
    let after = workflow.add_node(code("after", "output.ran = true"));
    workflow.connect(divide, after);
    let instance = run(&runtime, workflow, config(json!({ "total": 10, "count": 0 }))).await;

    assert_eq!(instance.status, ExecutionStatus::Failed);
    let divide = instance.node("divide").unwrap();
    assert_eq!(divide.status, NodeStatus::Failed);
    assert!(divide.output.is_none());
    assert!(divide.error.as_deref().unwrap().contains("non-finite"), "{:?}", divide.error);
    assert_eq!(status_of(&instance, "after"), NodeStatus::Skipped);
}

#[tokio::test]
async fn test_script_timeout_uses_node_limits() {
    let runtime = runtime();
    let mut workflow = Workflow::new("spin").with_id("spin");
    workflow.add_node(
        code("spin", "while true do end").with_config("limits", json!({ "timeout_ms": 200 })),
    );
    let instance = run(&runtime, workflow, Payload::new()).await;

    assert_eq!(status_of(&instance, "spin"), NodeStatus::Failed);
    assert_eq!(
        instance.node("spin").unwrap().error.as_deref(),
        Some("Sandbox timed out after 200ms")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopping_a_run_interrupts_a_running_script() {
    let runtime = runtime();
    let mut workflow = Workflow::new("busy").with_id("busy");
    workflow.add_node(code("busy", "while true do end"));
    runtime.register_workflow(workflow).await.unwrap();
    let execution_id = runtime
        .start_execution("busy", Payload::new(), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(runtime.stop_execution(execution_id).unwrap());
    let instance = tokio::time::timeout(
        Duration::from_secs(10),
        runtime.wait_for_completion(execution_id),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(instance.status, ExecutionStatus::Cancelled);
    assert_eq!(status_of(&instance, "busy"), NodeStatus::Skipped);
}

#[tokio::test]
async fn test_isolated_run_without_worker_is_a_process_error() {
    init_tracing();
    let runner = SandboxRunner::new(SandboxConfig::default().with_worker("/nonexistent/flow-sandbox"));
    let node = CodeNode::new(Arc::new(runner));
    let ctx = NodeContext::new("isolated").with_config(config(json!({
        "code": "output.x = 1",
        "isolated": true,
    })));

    match node.execute(ctx).await {
        Err(NodeError::SandboxProcess { message, .. }) => {
            assert!(message.contains("/nonexistent/flow-sandbox"), "{}", message)
        }
        other => panic!("expected process error, got {:?}", other.map(|o| o.outputs)),
    }
}

#[test]
fn test_code_config_is_checked_at_load_time() {
    let node = CodeNode::new(Arc::new(SandboxRunner::default()));
    assert!(node.validate_config(&config(json!({ "code": "output.a = 1" }))).is_ok());
    assert!(node.validate_config(&Payload::new()).is_err());
    assert!(node.validate_config(&config(json!({ "code": 7 }))).is_err());
}

fn result(status: SandboxStatus, reported: bool) -> SandboxResult {
    SandboxResult {
        status,
        output: Bindings::new(),
        logs: Vec::new(),
        duration: Duration::from_millis(5),
        error: Some("went wrong".to_string()),
        traceback: Some("stack".to_string()),
        stdout: "raw out".to_string(),
        stderr: "raw err".to_string(),
        exit_code: Some(1),
        pid: Some(42),
        reported,
    }
}

#[test]
fn test_sandbox_results_map_onto_node_errors() {
    let limits = SandboxLimits::default().with_timeout(Duration::from_millis(750));

    let mut ok = result(SandboxStatus::Success, true);
    ok.output.insert("answer".to_string(), json!(42));
    assert_eq!(node_output(ok, &limits).unwrap().get("answer"), Some(&json!(42)));

    assert_eq!(
        node_output(result(SandboxStatus::Timeout, false), &limits).unwrap_err(),
        NodeError::SandboxTimeout { ms: 750 }
    );

    match node_output(result(SandboxStatus::Error, true), &limits).unwrap_err() {
        NodeError::Script { message, traceback } => {
            assert_eq!(message, "went wrong");
            assert_eq!(traceback.as_deref(), Some("stack"));
        }
        other => panic!("unexpected {:?}", other),
    }

    let err = node_output(result(SandboxStatus::Error, false), &limits).unwrap_err();
    assert!(matches!(err, NodeError::SandboxProcess { .. }));
    let diagnostic = err.diagnostic().unwrap();
    assert!(diagnostic.contains("raw out") && diagnostic.contains("raw err"));
}

fn flow_workflow(flow_config: Value) -> Workflow {
    let mut workflow = Workflow::new("nested").with_id("nested");
    let mut spec = NodeSpec::new("orchestrate", "flow");
    spec.config = config(flow_config);
    workflow.add_node(spec);
    workflow
}

#[tokio::test]
async fn test_flow_node_orchestrates_nested_nodes() {
    let runtime = runtime();
    let workflow = flow_workflow(json!({
        "mode": "parallel",
        "nodes": [
            { "id": "report", "type": "code", "dependencies": ["double"],
              "config": { "code": "output.seen = inputs.double.value" } },
            { "id": "double", "type": "code", "config": { "code": "output.value = 21 * 2" } },
        ],
    }));
    let instance = run(&runtime, workflow, Payload::new()).await;
    assert_eq!(instance.status, ExecutionStatus::Success);

    let output = instance.node("orchestrate").unwrap().output.clone().unwrap();
    let plan: Vec<&str> = output["plan"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["nodeId"].as_str().unwrap())
        .collect();
    assert_eq!(plan, vec!["double", "report"]);
    assert_eq!(output["results"][1]["output"]["seen"], json!(42));
    assert_eq!(output["summary"]["total"], json!(2));
    assert_eq!(output["summary"]["successRate"], json!(100.0));
}

#[tokio::test]
async fn test_flow_node_runs_managers_and_continues_past_errors() {
    let runtime = runtime();
    let workflow = flow_workflow(json!({
        "managers": [{ "id": "sched", "type": "scheduler" }],
        "manager_interval": 1,
        "nodes": [
            { "id": "one", "type": "code", "config": { "code": "output.n = 1" } },
            { "id": "bad", "type": "code", "config": { "code": "error('bad entry')" } },
            { "id": "two", "type": "code", "dependencies": ["one"],
              "config": { "code": "output.n = inputs.one.n + 1" } },
        ],
    }));
    let instance = run(&runtime, workflow, Payload::new()).await;
    assert_eq!(instance.status, ExecutionStatus::Success);

    let output = instance.node("orchestrate").unwrap().output.clone().unwrap();
    let results = output["results"].as_array().unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r["nodeId"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["one", "sched", "bad", "sched", "two", "sched"]);
    for manager in results.iter().filter(|r| r["isManager"] == json!(true)) {
        assert_eq!(manager["nodeType"], "scheduler");
        assert_eq!(manager["status"], "success");
        assert_eq!(manager["output"]["scheduled_tasks"], json!([]));
    }
    assert_eq!(results[2]["status"], "error");
    assert_eq!(results[4]["output"]["n"], json!(2));
    assert_eq!(output["summary"]["successful"], json!(5));
    assert_eq!(output["summary"]["failed"], json!(1));
}

#[tokio::test]
async fn test_flow_node_rejects_managers_of_unregistered_types() {
    let runtime = runtime();
    let workflow = flow_workflow(json!({
        "managers": ["nightly-supervisor"],
        "nodes": [
            { "id": "one", "type": "code", "config": { "code": "output.n = 1" } },
        ],
    }));
    let instance = run(&runtime, workflow, Payload::new()).await;

    assert_eq!(instance.status, ExecutionStatus::Failed);
    let flow = instance.node("orchestrate").unwrap();
    assert_eq!(flow.status, NodeStatus::Failed);
    let error = flow.error.clone().unwrap();
    assert!(error.contains("unregistered node type 'supervisor'"), "{}", error);
}

#[tokio::test]
async fn test_flow_node_stop_policy_fails_the_node() {
    let runtime = runtime();
    let workflow = flow_workflow(json!({
        "on_error": "stop",
        "nodes": [
            { "id": "bad", "type": "code", "config": { "code": "error('nested failure')" } },
            { "id": "after", "type": "code", "config": { "code": "output.ran = true" } },
        ],
    }));
    let instance = run(&runtime, workflow, Payload::new()).await;

    assert_eq!(instance.status, ExecutionStatus::Failed);
    let error = instance.node("orchestrate").unwrap().error.clone().unwrap();
    assert!(error.contains("Node 'bad' failed"), "{}", error);
    assert!(error.contains("nested failure"), "{}", error);
}

#[tokio::test]
async fn test_flow_node_rejects_cyclic_node_lists() {
    let runtime = runtime();
    let workflow = flow_workflow(json!({
        "nodes": [
            { "id": "a", "type": "code", "dependencies": ["b"], "config": { "code": "" } },
            { "id": "b", "type": "code", "dependencies": ["a"], "config": { "code": "" } },
        ],
    }));
    // Rejected by validate_config before the run starts
    let workflow_id = workflow.id.clone();
    runtime.register_workflow(workflow).await.unwrap();
    let execution_id = runtime
        .start_execution(&workflow_id, Payload::new(), None)
        .await
        .unwrap();
    let instance = runtime.wait_for_completion(execution_id).await.unwrap();
    assert_eq!(instance.status, ExecutionStatus::Failed);
    assert!(instance.error.unwrap().contains("Cycle detected"));
}

#[tokio::test]
async fn test_scheduler_node_keeps_state_per_node_id() {
    let node = SchedulerNode::new();
    let first = NodeContext::new("sched").with_config(config(json!({
        "new_tasks": [
            { "id": "extract", "nodeId": "api", "priority": 10, "estimatedTime": 20 },
            { "id": "load", "nodeId": "db", "priority": 90, "dependencies": ["extract"] },
            { "id": "notify", "nodeId": "mail", "priority": 60 },
        ],
    })));
    let output = node.execute(first).await.unwrap();

    let scheduled: Vec<&str> = output.get("scheduled_tasks").unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert_eq!(scheduled, vec!["load", "notify", "extract"]);
    assert_eq!(output.get("total_estimated_minutes"), Some(&json!(80)));
    let timeline = output.get("timeline").unwrap().as_array().unwrap();
    assert_eq!(timeline.len(), 3);
    assert_eq!(timeline[0]["taskId"], "notify");
    assert_eq!(timeline[2]["taskId"], "load");

    let second = NodeContext::new("sched").with_inputs(config(json!({ "start": ["extract"] })));
    let output = node.execute(second).await.unwrap();
    assert_eq!(output.get("running_tasks").unwrap().as_array().unwrap().len(), 1);
    assert_eq!(output.get("batches").unwrap().as_array().unwrap().len(), 1);

    let third = NodeContext::new("sched").with_inputs(config(json!({ "complete": ["extract"] })));
    let output = node.execute(third).await.unwrap();
    assert_eq!(output.get("completed_count"), Some(&json!(1)));

    let other = node.execute(NodeContext::new("other")).await.unwrap();
    assert_eq!(other.get("scheduled_tasks"), Some(&json!([])));
}

#[tokio::test]
async fn test_scheduler_node_rejects_bad_submissions_without_losing_state() {
    let node = SchedulerNode::new();
    let submit = |tasks: Value| {
        NodeContext::new("sched").with_inputs(config(json!({ "new_tasks": tasks })))
    };

    let output = node
        .execute(submit(json!([{ "id": "t", "nodeId": "api" }])))
        .await
        .unwrap();
    assert_eq!(output.get("scheduled_tasks").unwrap().as_array().unwrap().len(), 1);

    match node.execute(submit(json!([{ "id": "t", "nodeId": "api" }]))).await {
        Err(NodeError::Configuration(message)) => {
            assert!(message.contains("Duplicate task id: t"), "{}", message)
        }
        other => panic!("expected configuration error, got {:?}", other.map(|o| o.outputs)),
    }
    let huge = node
        .execute(submit(json!([{ "id": "huge", "nodeId": "api", "estimatedTime": 1_000_000_000_000_000_000u64 }])))
        .await;
    assert!(matches!(huge, Err(NodeError::Configuration(_))));

    let output = node.execute(NodeContext::new("sched")).await.unwrap();
    let scheduled: Vec<&str> = output.get("scheduled_tasks").unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert_eq!(scheduled, vec!["t"]);
}

/// `flow-sandbox` from `FLOW_SANDBOX_WORKER`, else from the target directory
/// one level above this test binary. None when it has not been built.
fn sandbox_worker() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("FLOW_SANDBOX_WORKER") {
        return Some(PathBuf::from(path));
    }
    let exe = std::env::current_exe().ok()?;
    let target_dir = exe.parent()?.parent()?;
    let worker = target_dir.join(format!("flow-sandbox{}", std::env::consts::EXE_SUFFIX));
    worker.exists().then_some(worker)
}

#[cfg(unix)]
fn process_gone(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    matches!(kill(Pid::from_raw(pid as i32), None), Err(nix::errno::Errno::ESRCH))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopping_a_run_terminates_its_sandbox_process() {
    init_tracing();
    let Some(worker) = sandbox_worker() else {
        eprintln!("flow-sandbox worker not built; build the workspace or set FLOW_SANDBOX_WORKER");
        return;
    };
    let sandbox = Arc::new(SandboxRunner::new(SandboxConfig::default().with_worker(worker)));
    let runtime = FlowRuntime::new();
    register_all(runtime.registry(), sandbox.clone());

    let mut workflow = Workflow::new("isolated").with_id("isolated");
    let busy = workflow.add_node(
        code("busy", "while true do end").with_config("isolated", true),
    );
    let after = workflow.add_node(code("after", "output.ran = true"));
    workflow.connect(busy, after);
    runtime.register_workflow(workflow).await.unwrap();
    let execution_id = runtime
        .start_execution("isolated", Payload::new(), None)
        .await
        .unwrap();

    let pid = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(pid) = sandbox.running().first().and_then(|id| sandbox.pid(id)) {
                break pid;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sandbox worker never started");

    assert!(runtime.stop_execution(execution_id).unwrap());
    let instance = tokio::time::timeout(
        Duration::from_secs(10),
        runtime.wait_for_completion(execution_id),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(instance.status, ExecutionStatus::Cancelled);
    assert_eq!(status_of(&instance, "busy"), NodeStatus::Skipped);
    assert_eq!(status_of(&instance, "after"), NodeStatus::Waiting);
    assert!(sandbox.running().is_empty());
    #[cfg(unix)]
    assert!(process_gone(pid), "worker {} still alive", pid);
    #[cfg(not(unix))]
    let _ = pid;
}

#[tokio::test]
async fn test_file_write_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/out.json");

    let write = NodeContext::new("write")
        .with_config(config(json!({ "path": path.to_str().unwrap(), "create_dirs": true })))
        .with_inputs(config(json!({ "content": { "rows": [1, 2, 3] } })));
    let written = FileWriteNode.execute(write).await.unwrap();
    assert!(written.get("bytes").unwrap().as_u64().unwrap() > 0);

    let read = NodeContext::new("read")
        .with_config(config(json!({ "path": path.to_str().unwrap(), "format": "json" })));
    let output = FileReadNode.execute(read).await.unwrap();
    assert_eq!(output.get("content"), Some(&json!({ "rows": [1, 2, 3] })));

    let missing = NodeContext::new("read")
        .with_config(config(json!({ "path": dir.path().join("nope.txt").to_str().unwrap() })));
    assert!(matches!(
        FileReadNode.execute(missing).await,
        Err(NodeError::ExecutionFailed(_))
    ));
}

#[tokio::test]
async fn test_json_transforms() {
    let parse = NodeContext::new("parse").with_inputs(config(json!({ "json": "{\"a\": [1, 2]}" })));
    let parsed = JsonParseNode.execute(parse).await.unwrap();
    assert_eq!(parsed.get("parsed"), Some(&json!({ "a": [1, 2] })));

    let not_text = NodeContext::new("parse").with_inputs(config(json!({ "json": 5 })));
    assert!(matches!(
        JsonParseNode.execute(not_text).await,
        Err(NodeError::InvalidInputType { .. })
    ));

    let stringify = NodeContext::new("stringify").with_inputs(config(json!({ "value": { "a": 1 } })));
    let text = JsonStringifyNode.execute(stringify).await.unwrap();
    assert_eq!(text.get("json"), Some(&json!("{\"a\":1}")));
}

#[tokio::test]
async fn test_delay_passes_inputs_and_honours_cancellation() {
    let ctx = NodeContext::new("delay")
        .with_config(config(json!({ "delay_ms": 10 })))
        .with_inputs(config(json!({ "keep": "me" })));
    let output = DelayNode.execute(ctx).await.unwrap();
    assert_eq!(output.get("keep"), Some(&json!("me")));

    let token = CancellationToken::new();
    let ctx = NodeContext::new("delay")
        .with_config(config(json!({ "delay_ms": 60_000 })))
        .with_cancellation(token.clone());
    let cancel = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });
    assert_eq!(DelayNode.execute(ctx).await.unwrap_err(), NodeError::Cancelled);
    cancel.await.unwrap();
}

fn status_of(instance: &ExecutionInstance, node_id: &str) -> NodeStatus {
    instance.node(node_id).unwrap().status
}
