//! Line-RPC session: newline-delimited JSON-RPC 2.0 over a child process's
//! stdio.
//!
//! The session spawns the configured command, takes its stdin/stdout pipes,
//! and keeps them for its whole life; one connection serves many
//! `tools/list` and `tools/call` requests. A background task owns the stdout
//! pipe and feeds parsed messages into an inbox; callers send a request and
//! block (asynchronously) until the response with the matching id arrives or
//! the per-call deadline expires. Responses that arrive before their waiter
//! are parked by id. Child stderr is drained to the log.
//!
//! State machine: unconnected → launching → initialising → ready → closed.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::EngineError;

/// MCP protocol version sent during initialize.
const PROTOCOL_VERSION: &str = "2025-06-18";

/// How to launch a stdio tool server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StdioServerParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Launching,
    Initialising,
    Ready,
    Closed,
}

/// JSON-RPC error object on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// One incoming JSON-RPC message (response, request, or notification).
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// A matched response: result or error.
#[derive(Debug)]
struct Response {
    result: Option<Value>,
    error: Option<RpcError>,
}

/// Inbox shared between the reader task and waiting callers.
#[derive(Debug)]
struct Inbox {
    rx: mpsc::UnboundedReceiver<(i64, Response)>,
    /// Responses that arrived before anyone waited for them.
    parked: HashMap<i64, Response>,
}

/// Long-lived line-RPC connection to a child tool server.
///
/// **Interaction**: created by `McpClient::connect` for stdio transports;
/// used for `initialize`, `tools/list`, and `tools/call`.
#[derive(Debug)]
pub struct McpSession {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    inbox: Mutex<Inbox>,
    next_id: AtomicI64,
    phase: std::sync::Mutex<SessionPhase>,
}

impl McpSession {
    /// Spawns the server process and wires the pipes. Does not handshake.
    pub async fn spawn(params: &StdioServerParams) -> Result<Self, EngineError> {
        let mut command = Command::new(&params.command);
        command
            .args(&params.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &params.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::ToolException(format!("failed to spawn '{}': {e}", params.command))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ToolException("child stdout not piped".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ToolException("child stdin not piped".into()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Incoming>(&line) {
                    Ok(msg) => {
                        if msg.result.is_some() || msg.error.is_some() {
                            let Some(id) = msg.id.as_ref().and_then(Value::as_i64) else {
                                debug!(line = %line, "response without numeric id, dropping");
                                continue;
                            };
                            let _ = tx.send((
                                id,
                                Response {
                                    result: msg.result,
                                    error: msg.error,
                                },
                            ));
                        } else if let Some(method) = msg.method {
                            // Server-initiated request or notification; this
                            // client does not serve any, only log it.
                            debug!(%method, "ignoring server-initiated message");
                        }
                    }
                    Err(e) => debug!(error = %e, line = %line, "unparsable line from server"),
                }
            }
            debug!("tool server stdout closed");
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "goalweave::mcp::stderr", "{line}");
                }
            });
        }

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            inbox: Mutex::new(Inbox {
                rx,
                parked: HashMap::new(),
            }),
            next_id: AtomicI64::new(1),
            phase: std::sync::Mutex::new(SessionPhase::Launching),
        })
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().expect("phase lock")
    }

    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().expect("phase lock") = phase;
    }

    /// Performs the initialize handshake: `initialize` request, then the
    /// `notifications/initialized` notification.
    pub async fn initialize(&self, client_name: &str, deadline: Duration) -> Result<(), EngineError> {
        self.set_phase(SessionPhase::Initialising);
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": client_name,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        self.request("initialize", params, deadline).await?;
        self.notify("notifications/initialized", json!({})).await?;
        self.set_phase(SessionPhase::Ready);
        Ok(())
    }

    /// Sends one request and waits for the matching response.
    ///
    /// A JSON-RPC error object becomes `EngineError::ToolError`; a missed
    /// deadline becomes `EngineError::Timeout` (the connection stays usable).
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, EngineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        self.send_line(&line).await?;
        debug!(%method, id, "request sent");

        let response = tokio::time::timeout(deadline, self.wait_for(id))
            .await
            .map_err(|_| EngineError::Timeout(format!("no response to '{method}' (id {id})")))??;

        if let Some(error) = response.error {
            return Err(EngineError::ToolError {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Sends a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), EngineError> {
        let line = serde_json::to_string(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))?;
        self.send_line(&line).await
    }

    /// Kills the child process and closes the session.
    pub async fn shutdown(&self) {
        self.set_phase(SessionPhase::Closed);
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill tool server");
        }
    }

    async fn send_line(&self, line: &str) -> Result<(), EngineError> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::ToolException(format!("write to tool server: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| EngineError::ToolException(format!("write to tool server: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| EngineError::ToolException(format!("flush to tool server: {e}")))?;
        Ok(())
    }

    async fn wait_for(&self, id: i64) -> Result<Response, EngineError> {
        let mut inbox = self.inbox.lock().await;
        if let Some(parked) = inbox.parked.remove(&id) {
            return Ok(parked);
        }
        while let Some((got_id, response)) = inbox.rx.recv().await {
            if got_id == id {
                return Ok(response);
            }
            inbox.parked.insert(got_id, response);
        }
        Err(EngineError::ToolException(
            "tool server connection closed".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A canned line-RPC server: emits fixed responses for ids 1..=n and then
    /// swallows stdin. Enough to exercise the framing without a real server.
    #[cfg(unix)]
    fn canned_server(responses: &[&str]) -> StdioServerParams {
        let printf = responses
            .iter()
            .map(|r| format!("printf '%s\\n' '{}'", r.replace('\'', "'\\''")))
            .collect::<Vec<_>>()
            .join("; ");
        let script = if printf.is_empty() {
            "cat > /dev/null".to_string()
        } else {
            format!("{printf}; cat > /dev/null")
        };
        StdioServerParams {
            command: "sh".into(),
            args: vec!["-c".into(), script],
            cwd: None,
            env: Default::default(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn request_matches_response_by_id_even_when_early() {
        // Responses for ids 2 and 1 arrive immediately and out of order; the
        // inbox parks them until each waiter asks.
        let params = canned_server(&[
            r#"{"jsonrpc":"2.0","id":2,"result":{"second":true}}"#,
            r#"{"jsonrpc":"2.0","id":1,"result":{"first":true}}"#,
        ]);
        let session = McpSession::spawn(&params).await.unwrap();
        let first = session
            .request("a", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(first, json!({"first": true}));
        let second = session
            .request("b", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(second, json!({"second": true}));
        session.shutdown().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rpc_error_objects_become_tool_errors() {
        let params = canned_server(&[
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
        ]);
        let session = McpSession::spawn(&params).await.unwrap();
        let err = session
            .request("nope", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            EngineError::ToolError { code, message } => {
                assert_eq!(code, -32601);
                assert!(message.contains("not found"));
            }
            other => panic!("expected ToolError, got {other:?}"),
        }
        // The connection survives a tool error.
        assert_eq!(session.phase(), SessionPhase::Launching);
        session.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missed_deadline_is_a_timeout() {
        let params = canned_server(&[]);
        let session = McpSession::spawn(&params).await.unwrap();
        let err = session
            .request("slow", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_fatal() {
        let params = StdioServerParams {
            command: "definitely-not-a-real-binary-goalweave".into(),
            args: vec![],
            cwd: None,
            env: Default::default(),
        };
        let err = McpSession::spawn(&params).await.unwrap_err();
        assert_eq!(err.code(), "tool_exception");
    }
}
