//! Tool-server session over HTTP: the same JSON-RPC envelope, POSTed to
//! `/mcp/v1` of the configured URL.
//!
//! Connect optionally probes `GET /health`; a failed probe is logged and
//! tolerated (the server may simply not expose one). Configured headers are
//! sent on every request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::EngineError;

use super::session::RpcError;

/// JSON-RPC response body.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// HTTP flavour of the tool-server session.
///
/// **Interaction**: created by `McpClient::connect` for http transports;
/// used for `tools/list` and `tools/call`.
#[derive(Debug)]
pub struct McpHttpSession {
    client: Client,
    base_url: String,
    headers: BTreeMap<String, String>,
    next_id: AtomicI64,
}

impl McpHttpSession {
    /// Builds the session and probes `/health` (warn-and-continue on failure).
    pub async fn connect(
        base_url: impl Into<String>,
        headers: BTreeMap<String, String>,
        call_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| EngineError::ToolException(format!("http client: {e}")))?;

        let session = Self {
            client,
            base_url,
            headers,
            next_id: AtomicI64::new(1),
        };

        match session
            .client
            .get(format!("{}/health", session.base_url))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(url = %session.base_url, "tool server health check passed");
            }
            Ok(response) => {
                warn!(url = %session.base_url, status = %response.status(), "tool server health check failed, continuing");
            }
            Err(e) => {
                warn!(url = %session.base_url, error = %e, "tool server health check unreachable, continuing");
            }
        }

        Ok(session)
    }

    /// POSTs one JSON-RPC request to `/mcp/v1` and parses the response.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self
            .client
            .post(format!("{}/mcp/v1", self.base_url))
            .json(&body);
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::ToolException(format!("{method} request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::ToolException(format!(
                "{method} HTTP {status}: {}",
                if text.is_empty() { "no body" } else { &text }
            )));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| EngineError::ToolException(format!("{method} response body: {e}")))?;
        if let Some(error) = parsed.error {
            return Err(EngineError::ToolError {
                code: error.code,
                message: error.message,
            });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}
