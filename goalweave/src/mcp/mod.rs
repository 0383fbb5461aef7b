//! Tool-server client: long-lived connection to an out-of-process tool
//! provider, with tool discovery and invocation.
//!
//! Two transports behind one client: line-RPC over a child process's stdio
//! (`McpSession`) and JSON-RPC over HTTP (`McpHttpSession`). Connecting is
//! fatal on failure and bounded by a handshake timeout; invocation failures
//! are reported to the caller while the client stays connected.

mod session;
mod session_http;

pub use session::{McpSession, RpcError, SessionPhase, StdioServerParams};
pub use session_http::McpHttpSession;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::graph::ToolExecutor;
use crate::llm::{Tool, ToolUse};

/// Handshake budget: spawn/probe, initialize, and first tool listing.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-call deadline for `tools/call` and later `tools/list` refreshes.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport selector in `mcp_servers.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Http,
}

/// Configuration for one tool server, as found in `mcp_servers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: TransportKind,
    // Stdio transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    // HTTP transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
}

/// The `mcp_servers.json` file: a list of server configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersFile {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// A tool discovered on a server, cached by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    pub server_name: String,
}

impl McpTool {
    /// The provider-facing tool spec for this server tool.
    pub fn to_llm_tool(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

#[derive(Debug)]
enum Session {
    Stdio(McpSession),
    Http(McpHttpSession),
}

/// Client for one tool server: connect, discover, invoke, disconnect.
#[derive(Debug)]
pub struct McpClient {
    config: McpServerConfig,
    session: Session,
    tools: DashMap<String, McpTool>,
}

impl McpClient {
    /// Connects to the configured server and discovers its tools.
    ///
    /// The whole sequence (spawn/probe, initialize handshake, `tools/list`)
    /// is bounded by the handshake timeout; on expiry the client is dropped
    /// with `HandshakeTimeout`. Connection failures during init are fatal for
    /// this client.
    pub async fn connect(config: McpServerConfig) -> Result<Self, EngineError> {
        let client = tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::connect_inner(config))
            .await
            .map_err(|_| EngineError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??;
        info!(
            server = %client.config.name,
            tools = client.tools.len(),
            "connected to tool server"
        );
        Ok(client)
    }

    async fn connect_inner(config: McpServerConfig) -> Result<Self, EngineError> {
        let session = match config.transport {
            TransportKind::Stdio => {
                let command = config.command.clone().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "server '{}': command is required for stdio transport",
                        config.name
                    ))
                })?;
                let params = StdioServerParams {
                    command,
                    args: config.args.clone(),
                    cwd: config.cwd.clone(),
                    env: config.env.clone(),
                };
                let session = McpSession::spawn(&params).await?;
                session.initialize("goalweave", HANDSHAKE_TIMEOUT).await?;
                Session::Stdio(session)
            }
            TransportKind::Http => {
                let url = config.url.clone().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "server '{}': url is required for http transport",
                        config.name
                    ))
                })?;
                let session =
                    McpHttpSession::connect(url, config.headers.clone(), CALL_TIMEOUT).await?;
                Session::Http(session)
            }
        };

        let client = Self {
            config,
            session,
            tools: DashMap::new(),
        };
        client.refresh_tools().await?;
        Ok(client)
    }

    /// Server name from the configuration.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Re-runs `tools/list` and replaces the cache.
    pub async fn refresh_tools(&self) -> Result<(), EngineError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        self.tools.clear();
        for tool in tools {
            let Some(name) = tool.get("name").and_then(Value::as_str) else {
                continue;
            };
            self.tools.insert(
                name.to_string(),
                McpTool {
                    name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool.get("inputSchema").cloned().unwrap_or(json!({})),
                    server_name: self.config.name.clone(),
                },
            );
        }
        debug!(server = %self.config.name, count = self.tools.len(), "tools discovered");
        Ok(())
    }

    /// Cached tools, name-ordered.
    pub fn tools(&self) -> Vec<McpTool> {
        let mut tools: Vec<McpTool> = self.tools.iter().map(|t| t.value().clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// True when the server advertises a tool with this name.
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Invokes a tool and extracts its result.
    ///
    /// The first textual content item wins; a non-text item falls back to its
    /// `data` field; with no content items the raw payload is returned.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, EngineError> {
        if !self.tools.contains_key(name) {
            return Err(EngineError::MissingTool(name.to_string()));
        }
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(extract_content(result))
    }

    /// Closes the connection: the child process (if any) is signalled, and
    /// the HTTP client released.
    pub async fn disconnect(self) {
        if let Session::Stdio(session) = &self.session {
            session.shutdown().await;
        }
        info!(server = %self.config.name, "disconnected from tool server");
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        match &self.session {
            Session::Stdio(session) => session.request(method, params, CALL_TIMEOUT).await,
            Session::Http(session) => session.request(method, params).await,
        }
    }
}

#[async_trait]
impl ToolExecutor for McpClient {
    async fn execute(&self, tool_use: &ToolUse) -> Result<Value, EngineError> {
        self.call_tool(&tool_use.name, tool_use.input.clone()).await
    }
}

/// Pulls the useful payload out of a `tools/call` result content array.
fn extract_content(result: Value) -> Value {
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return result;
    };
    for item in content {
        if item.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                return Value::String(text.to_string());
            }
        }
    }
    if let Some(first) = content.first() {
        if let Some(data) = first.get("data") {
            return data.clone();
        }
    }
    Value::Array(content.clone())
}
