use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeMetadata, NodeOutput, PortDefinition};
use serde_json::{Map, Value};
use std::time::Duration;

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let url_value = ctx
            .input_or_config("url")
            .ok_or_else(|| NodeError::MissingInput("url".to_string()))?;
        let url = url_value
            .as_str()
            .ok_or_else(|| NodeError::invalid_type("url", "string", url_value))?;
        let method = ctx
            .config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        ctx.logger.info(format!("{} {}", method, url));

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            _ => {
                return Err(NodeError::Configuration(format!(
                    "Unsupported method: {}",
                    method
                )))
            }
        };

        match ctx.input_or_config("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(json) => request = request.json(json),
        }

        if let Some(Value::Object(headers)) = ctx.config.get("headers") {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    request = request.header(key, val_str);
                }
            }
        }

        if let Some(ms) = ctx.config.get("timeout_ms").and_then(Value::as_u64) {
            request = request.timeout(Duration::from_millis(ms));
        }

        let response = tokio::select! {
            response = request.send() => response
                .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?,
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        };

        let status = response.status().as_u16();
        let headers_map: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.logger.info(format!("Response status: {}", status));

        let json = serde_json::from_str::<Value>(&body_text).unwrap_or(Value::Null);
        if ctx.config_bool("fail_on_error_status") && status >= 400 {
            return Err(NodeError::ExecutionFailed(format!(
                "{} {} returned status {}",
                method, url, status
            )));
        }

        Ok(NodeOutput::new()
            .with_output("status", status)
            .with_output("body", body_text)
            .with_output("json", json)
            .with_output("headers", Value::Object(headers_map)))
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            inputs: vec![
                PortDefinition::required("url", "Request URL (input or config)"),
                PortDefinition::optional("body", "Request body; non-strings are sent as JSON"),
            ],
            outputs: vec![
                PortDefinition::required("status", "Response status code"),
                PortDefinition::required("body", "Response body as text"),
                PortDefinition::optional("json", "Response body parsed as JSON, or null"),
                PortDefinition::required("headers", "Response headers"),
            ],
        }
    }
}
