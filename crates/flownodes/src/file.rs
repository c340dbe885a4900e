use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeMetadata, NodeOutput, PortDefinition};
use serde_json::Value;
use std::path::PathBuf;

fn path_setting(ctx: &NodeContext) -> Result<PathBuf, NodeError> {
    let value = ctx
        .input_or_config("path")
        .ok_or_else(|| NodeError::MissingInput("path".to_string()))?;
    value
        .as_str()
        .map(PathBuf::from)
        .ok_or_else(|| NodeError::invalid_type("path", "string", value))
}

fn io_error(action: &str, path: &std::path::Path, err: std::io::Error) -> NodeError {
    NodeError::ExecutionFailed(format!("Failed to {} {}: {}", action, path.display(), err))
}

/// Read a file as text, or as JSON with `format: "json"`
pub struct FileReadNode;

#[async_trait]
impl Node for FileReadNode {
    fn node_type(&self) -> &str {
        "file.read"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let path = path_setting(&ctx)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error("read", &path, e))?;
        ctx.logger
            .info(format!("Read {} bytes from {}", text.len(), path.display()));

        let content = match ctx.config.get("format").and_then(Value::as_str) {
            Some("json") => serde_json::from_str(&text).map_err(|e| {
                NodeError::ExecutionFailed(format!("{} is not valid JSON: {}", path.display(), e))
            })?,
            _ => Value::String(text),
        };

        Ok(NodeOutput::new()
            .with_output("content", content)
            .with_output("path", path.display().to_string()))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Read a file".to_string(),
            category: "file".to_string(),
            inputs: vec![PortDefinition::required("path", "File to read (input or config)")],
            outputs: vec![PortDefinition::required("content", "Text, or parsed JSON")],
        }
    }
}

/// Write `content` to a file. Non-string content is written as JSON.
pub struct FileWriteNode;

#[async_trait]
impl Node for FileWriteNode {
    fn node_type(&self) -> &str {
        "file.write"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let path = path_setting(&ctx)?;
        let content = ctx
            .input_or_config("content")
            .ok_or_else(|| NodeError::MissingInput("content".to_string()))?;
        let bytes = match content {
            Value::String(text) => text.clone().into_bytes(),
            other => serde_json::to_vec_pretty(other)
                .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?,
        };

        if ctx.config_bool("create_dirs") {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("create", parent, e))?;
            }
        }
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| io_error("write", &path, e))?;
        ctx.logger
            .info(format!("Wrote {} bytes to {}", bytes.len(), path.display()));

        Ok(NodeOutput::new()
            .with_output("path", path.display().to_string())
            .with_output("bytes", bytes.len()))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Write a file".to_string(),
            category: "file".to_string(),
            inputs: vec![
                PortDefinition::required("path", "Destination (input or config)"),
                PortDefinition::required("content", "Text or JSON value"),
            ],
            outputs: vec![PortDefinition::required("bytes", "Bytes written")],
        }
    }
}
