use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeMetadata, NodeOutput, Payload, PortDefinition};
use flowsandbox::{
    run_inline, Bindings, SandboxError, SandboxId, SandboxLimits, SandboxResult, SandboxRunner,
    SandboxStatus,
};
use serde_json::Value;
use std::sync::Arc;

/// Binding under which a script sees the run's shared trigger context
pub const CONTEXT_BINDING: &str = "context";

/// Runs a Lua snippet against the node's inputs.
///
/// Config:
/// - `code`: the script; whatever it leaves in `output` becomes the node output
/// - `isolated` (alias `sandbox`): run in a worker process instead of inline
/// - `limits`: partial [`SandboxLimits`] overriding the runner defaults
pub struct CodeNode {
    runner: Arc<SandboxRunner>,
}

impl CodeNode {
    pub fn new(runner: Arc<SandboxRunner>) -> Self {
        Self { runner }
    }

    fn limits(&self, ctx: &NodeContext) -> Result<SandboxLimits, NodeError> {
        match ctx.config.get("limits") {
            None | Some(Value::Null) => Ok(self.runner.default_limits().clone()),
            Some(value) => {
                let mut merged = serde_json::to_value(self.runner.default_limits())
                    .map_err(|e| NodeError::Configuration(e.to_string()))?;
                if let (Some(base), Some(overrides)) = (merged.as_object_mut(), value.as_object()) {
                    for (key, v) in overrides {
                        base.insert(key.clone(), v.clone());
                    }
                } else {
                    return Err(NodeError::invalid_type("limits", "object", value));
                }
                serde_json::from_value(merged)
                    .map_err(|e| NodeError::Configuration(format!("Invalid limits: {}", e)))
            }
        }
    }
}

#[async_trait]
impl Node for CodeNode {
    fn node_type(&self) -> &str {
        "code"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let code = script_source(&ctx.config)?;
        let limits = self.limits(&ctx)?;
        let isolated = ctx.config_bool("isolated") || ctx.config_bool("sandbox");
        let bindings = bindings_for(&ctx);

        let result = if isolated {
            let id = SandboxId::new_v4();
            ctx.logger.debug(format!("Running in sandbox {}", id));
            self.runner
                .run_with_id(id, code, &bindings, &limits, ctx.cancellation.clone())
                .await
        } else {
            run_inline(code, &bindings, &limits, &ctx.cancellation).await
        };
        let result = result.map_err(from_sandbox_error)?;

        for line in &result.logs {
            ctx.logger.info(line.as_str());
        }
        tracing::debug!(
            node_id = %ctx.node_id,
            isolated,
            status = ?result.status,
            duration_ms = result.duration.as_millis() as u64,
            "Code node finished"
        );
        node_output(result, &limits)
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Run a Lua script against the node inputs".to_string(),
            category: "code".to_string(),
            inputs: vec![PortDefinition::optional(
                "*",
                "Every input is visible as `inputs.<name>` and as a global",
            )],
            outputs: vec![PortDefinition::optional(
                "*",
                "Keys the script assigns into `output`",
            )],
        }
    }

    fn validate_config(&self, config: &Payload) -> Result<(), NodeError> {
        script_source(config).map(|_| ())
    }
}

fn script_source(config: &Payload) -> Result<&str, NodeError> {
    let code = config
        .get("code")
        .ok_or_else(|| NodeError::Configuration("Missing config: code".to_string()))?;
    code.as_str()
        .ok_or_else(|| NodeError::invalid_type("code", "string", code))
}

fn bindings_for(ctx: &NodeContext) -> Bindings {
    let mut bindings = ctx.data_inputs();
    if let Some(shared) = ctx.shared_context() {
        bindings
            .entry(CONTEXT_BINDING)
            .or_insert_with(|| Value::Object(shared.clone()));
    }
    bindings
}

/// Map a finished sandbox run onto the node contract
pub fn node_output(result: SandboxResult, limits: &SandboxLimits) -> Result<NodeOutput, NodeError> {
    match result.status {
        SandboxStatus::Success => Ok(NodeOutput::from_payload(result.output)),
        SandboxStatus::Timeout => Err(NodeError::SandboxTimeout {
            ms: limits.timeout_ms,
        }),
        SandboxStatus::Error if result.reported => Err(NodeError::Script {
            message: result.error.unwrap_or_else(|| "script failed".to_string()),
            traceback: result.traceback,
        }),
        SandboxStatus::Error => Err(NodeError::SandboxProcess {
            message: result
                .error
                .unwrap_or_else(|| "sandbox worker failed".to_string()),
            stdout: result.stdout,
            stderr: result.stderr,
        }),
    }
}

fn from_sandbox_error(err: SandboxError) -> NodeError {
    match err {
        SandboxError::Cancelled => NodeError::Cancelled,
        other => NodeError::SandboxProcess {
            message: other.to_string(),
            stdout: String::new(),
            stderr: String::new(),
        },
    }
}
