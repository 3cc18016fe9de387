use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use cascade_core::config::ExecutorConfig;
use cascade_core::error::{CascadeError, Result};
use cascade_core::traits::{ExecutionRequest, NodeExecutor};
use cascade_core::types::ResolvedInputs;

/// Node executor that delegates to a remote service.
///
/// POSTs `{entity_id, workflow_id, node_id, kind, config, inputs}` to the
/// configured endpoint and takes the JSON response body as the node output.
pub struct HttpNodeExecutor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    entity_id: &'a str,
    workflow_id: &'a str,
    node_id: &'a str,
    kind: &'a str,
    config: &'a Value,
    inputs: &'a ResolvedInputs,
}

impl HttpNodeExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CascadeError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

impl NodeExecutor for HttpNodeExecutor {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let node_id = request.node.id.clone();
            let fail = |message: String| CascadeError::NodeExecution {
                node_id: node_id.clone(),
                message,
            };

            let mut req = self.client.post(&self.endpoint).json(&ExecuteBody {
                entity_id: &request.entity_id,
                workflow_id: &request.workflow_id,
                node_id: &request.node.id,
                kind: request.node.kind.as_str(),
                config: &request.node.config,
                inputs: &request.inputs,
            });
            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| fail(format!("executor request failed: {}", e)))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(fail(format!("executor returned {}: {}", status, body)));
            }

            resp.json::<Value>()
                .await
                .map_err(|e| fail(format!("invalid executor response: {}", e)))
        })
    }
}
