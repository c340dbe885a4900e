// crates/flowcli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    ExecutionEvent, ExecutionInstance, ExecutionMode, ExecutionStatus, LogLevel, NodeSpec,
    NodeStatus, Payload, Topic, Workflow,
};
use flowruntime::{DependencyGraph, FlowRuntime, NodeRegistry, RuntimeConfig};
use flowsandbox::SandboxRunner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    /// Runtime configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger context as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// sequential, parallel or mixed
        #[arg(short, long)]
        mode: Option<ExecutionMode>,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// Print the execution plan of a workflow file
    Plan {
        file: PathBuf,

        #[arg(short, long, default_value = "sequential")]
        mode: ExecutionMode,
    },

    /// List available node types
    Nodes,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Commands::Run { file, input, mode } => run_workflow(config, &file, input, mode).await,
        Commands::Validate { file } => validate_workflow(config, &file),
        Commands::Plan { file, mode } => print_plan(&file, mode),
        Commands::Nodes => {
            list_nodes(config);
            Ok(())
        }
        Commands::Init { output } => create_example_workflow(&output),
    }
}

fn build_runtime(config: RuntimeConfig) -> FlowRuntime {
    let sandbox = Arc::new(SandboxRunner::new(config.sandbox.clone()));
    let registry = Arc::new(NodeRegistry::new());
    flownodes::register_all(&registry, sandbox);
    FlowRuntime::with_registry(registry, config)
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&workflow_json)
        .with_context(|| format!("{} is not a workflow definition", file.display()))
}

async fn run_workflow(
    config: RuntimeConfig,
    file: &Path,
    input: Option<String>,
    mode: Option<ExecutionMode>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(file)?;

    println!("📋 Workflow: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());
    println!();

    let context: Payload = match input {
        Some(input_str) => match serde_json::from_str(&input_str)? {
            serde_json::Value::Object(obj) => obj,
            _ => bail!("Input must be a JSON object"),
        },
        None => Payload::new(),
    };

    let runtime = build_runtime(config);
    let workflow_id = workflow.id.clone();
    runtime.register_workflow(workflow).await?;

    let mut events = runtime.connect();
    runtime.subscribe(events.observer_id, Topic::Workflow(workflow_id.clone()));

    let execution_id = runtime.start_execution(&workflow_id, context, mode).await?;
    println!("▶️  Execution {} started", execution_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let done = event.is_terminal();
                print_event(&event);
                if done {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("🛑 Stopping execution...");
                runtime.stop_execution(execution_id)?;
            }
        }
    }

    let instance = runtime.wait_for_completion(execution_id).await?;
    print_summary(&instance);
    runtime.shutdown().await;

    match instance.status {
        ExecutionStatus::Success => Ok(()),
        status => bail!(
            "Execution ended with status {:?}: {}",
            status,
            instance.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::ExecutionUpdate { execution } => match execution.status {
            ExecutionStatus::Running => println!("▶️  Workflow running ({} mode)", execution.mode),
            ExecutionStatus::Success => println!("✨ Workflow completed successfully"),
            status => println!(
                "💥 Workflow {:?}: {}",
                status,
                execution.error.as_deref().unwrap_or("")
            ),
        },
        ExecutionEvent::NodeUpdate { node, .. } => match node.status {
            NodeStatus::Running => println!("  ⚡ Starting node: {} ({})", node.node_id, node.node_type),
            NodeStatus::Success => println!(
                "  ✅ Node {} completed in {}ms",
                node.node_id,
                node.duration_ms().unwrap_or(0)
            ),
            NodeStatus::Failed => println!(
                "  ❌ Node {} failed: {}",
                node.node_id,
                node.error.as_deref().unwrap_or("")
            ),
            NodeStatus::Skipped => println!("  ⏭️  Node {} skipped", node.node_id),
            NodeStatus::Waiting => {}
        },
        ExecutionEvent::Log { entry, .. } => {
            let node = entry.node_id.as_deref().unwrap_or("workflow");
            match entry.level {
                LogLevel::Debug => tracing::debug!("[{}] {}", node, entry.message),
                LogLevel::Info => println!("     ℹ️  [{}] {}", node, entry.message),
                LogLevel::Warning => println!("     ⚠️  [{}] {}", node, entry.message),
                LogLevel::Error => println!("     ❗ [{}] {}", node, entry.message),
            }
        }
    }
}

fn print_summary(instance: &ExecutionInstance) {
    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", instance.id);
    println!("   Status: {:?}", instance.status);
    println!(
        "   Completed: {}/{} nodes",
        instance.count_nodes(NodeStatus::Success),
        instance.node_executions.len()
    );
    if let Some(ms) = instance.duration_ms() {
        println!("   Duration: {}ms", ms);
    }

    let mut outputs: Vec<_> = instance.outputs().into_iter().collect();
    outputs.sort_by(|a, b| a.0.cmp(&b.0));
    if !outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, values) in outputs.iter().filter(|(_, v)| !v.is_empty()) {
            println!("   Node {}:", node_id);
            for (key, value) in values {
                println!("     {}: {}", key, value);
            }
        }
    }
}

fn validate_workflow(config: RuntimeConfig, file: &Path) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(file)?;
    workflow.validate()?;
    DependencyGraph::from_workflow(&workflow)?.topological_order()?;
    build_runtime(config).registry().ensure_known(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Nodes: {}", workflow.nodes.len());
    println!("   Connections: {}", workflow.connections.len());

    Ok(())
}

fn print_plan(file: &Path, mode: ExecutionMode) -> Result<()> {
    let workflow = load_workflow(file)?;
    let plan = DependencyGraph::from_workflow(&workflow)?.plan(mode)?;

    println!("🗺️  Plan for {} ({} mode)", workflow.name, mode);
    for (i, group) in plan.groups.iter().enumerate() {
        println!("  Step {}:", i + 1);
        for entry in group {
            let after = if entry.dependencies.is_empty() {
                String::new()
            } else {
                format!(" after {}", entry.dependencies.join(", "))
            };
            println!(
                "    {}. {} ({}, ~{}ms){}",
                entry.order, entry.node_id, entry.node_type, entry.estimated_ms, after
            );
        }
    }
    println!("  Estimated total: {}ms", plan.total_estimated_ms());
    Ok(())
}

fn list_nodes(config: RuntimeConfig) {
    println!("📦 Available Node Types:");
    println!();

    let runtime = build_runtime(config);
    let registry = runtime.registry();
    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
            for port in &metadata.inputs {
                let required = if port.required { "required" } else { "optional" };
                println!("      in  {} [{}] {}", port.name, required, port.description);
            }
            for port in &metadata.outputs {
                println!("      out {} {}", port.name, port.description);
            }
        } else {
            println!("  • {}", node_type);
        }
    }
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let mut workflow = Workflow::new("Example Workflow").with_id("example");
    workflow.description = Some("Doubles a value in Lua and logs the result".to_string());

    let double = NodeSpec::new("double", "code")
        .with_name("Double")
        .with_config(
            "code",
            "local n = (context and context.value) or 21\n\
             output.value = n * 2\n\
             output.message = 'doubled ' .. n .. ' to ' .. output.value",
        )
        .with_position(100.0, 100.0);

    let log = NodeSpec::new("log", "debug.log")
        .with_name("Log Result")
        .with_position(300.0, 100.0);

    let double_id = workflow.add_node(double);
    let log_id = workflow.add_node(log);
    workflow.connect_ports(double_id, "message", log_id, "message");

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"value\": 4}}'",
        output.display()
    );

    Ok(())
}
