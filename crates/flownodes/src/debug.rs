use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeMetadata, NodeOutput, PortDefinition};
use serde_json::Value;

/// Simple debug node that logs its inputs
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .input_or_config("message")
            .and_then(Value::as_str)
            .unwrap_or("(no message)")
            .to_string();

        ctx.logger.info(format!("DEBUG: {}", message));

        for (key, value) in ctx.data_inputs() {
            ctx.logger.data(format!("  {}", key), value);
        }

        Ok(NodeOutput::new().with_output("message", message))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortDefinition::optional("message", "Text to log")],
            outputs: vec![PortDefinition::required("message", "The logged text")],
        }
    }
}
