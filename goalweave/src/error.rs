//! Engine-wide error taxonomy.
//!
//! Every failure the engine can produce carries a stable symbolic code
//! (`EngineError::code`) so that hosts, stored runs, and the test harness can
//! classify errors without parsing messages. Failures that can be represented
//! as a step or node failure are recovered locally (so `on_failure` edges can
//! react); failures that corrupt engine invariants surface as a failed run.

use thiserror::Error;

/// Engine error with a stable symbolic code per variant.
///
/// **Interaction**: produced across the engine (executor, worker, memory
/// views, tool-server client, runtime log) and consumed by
/// `StepExecutionResult::error_type`, stored `Problem`s, and the CLI.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph failed validation before any side effect.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Action spec is malformed (missing tool name, code body, graph id, ...).
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Plan step is malformed (unknown action kind, bad dependency).
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// A required collaborator is not configured (LLM provider, tool executor).
    #[error("not configured: {0}")]
    Configuration(String),

    /// Tool name resolves neither to a registered function nor a server tool.
    #[error("tool not found: {0}")]
    MissingTool(String),

    /// Function name is not in the registry.
    #[error("function not registered: {0}")]
    MissingFunction(String),

    /// A node id referenced during execution does not exist in the graph.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Transport or runtime failure while invoking a tool.
    #[error("tool exception: {0}")]
    ToolException(String),

    /// LLM provider failure other than rate limiting.
    #[error("llm error: {0}")]
    LlmError(String),

    /// Provider surfaced a rate error; retryable at the node level.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Tool-server handshake did not complete within its deadline.
    #[error("handshake timeout after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// The tool itself reported an error (JSON-RPC error object).
    #[error("tool error {code}: {message}")]
    ToolError {
        /// JSON-RPC error code as reported by the server.
        code: i64,
        /// Server-provided message.
        message: String,
    },

    /// Sandboxed program failed to parse or evaluate.
    #[error("code error: {0}")]
    CodeError(String),

    /// Sandbox refused the program. Message always contains "Security".
    #[error("Security violation: {0}")]
    Security(String),

    /// The executor's step budget ran out before a terminal node.
    #[error("max steps exceeded: {0}")]
    MaxStepsExceeded(u32),

    /// A node failed on every attempt permitted by the retry budget.
    #[error("retry exhausted for node {node} after {attempts} attempts")]
    RetryExhausted {
        /// Node whose attempts were used up.
        node: String,
        /// Attempts made (initial execution plus retries).
        attempts: u32,
    },

    /// A bounded operation (tool call, test) exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A memory view was asked for a key outside its declared permission set.
    #[error("permission denied: key '{key}' (write: {write})")]
    PermissionDenied {
        /// The key that was refused.
        key: String,
        /// True for a refused write, false for a refused read.
        write: bool,
    },

    /// `record_outcome` was called twice for the same decision.
    #[error("decision already finalised: {0}")]
    AlreadyFinalised(String),

    /// Unexpected internal failure (I/O, storage, poisoned lock).
    #[error("runtime exception: {0}")]
    RuntimeException(String),
}

impl EngineError {
    /// Stable symbolic code for this error, as persisted and matched on.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidGraph(_) => "invalid_graph",
            EngineError::InvalidAction(_) => "invalid_action",
            EngineError::InvalidPlan(_) => "invalid_plan",
            EngineError::Configuration(_) => "configuration",
            EngineError::MissingTool(_) => "missing_tool",
            EngineError::MissingFunction(_) => "missing_function",
            EngineError::NodeNotFound(_) => "node_not_found",
            EngineError::ToolException(_) => "tool_exception",
            EngineError::LlmError(_) => "llm_error",
            EngineError::RateLimit(_) => "rate_limit",
            EngineError::HandshakeTimeout(_) => "handshake_timeout",
            EngineError::ToolError { .. } => "tool_error",
            EngineError::CodeError(_) => "code_error",
            EngineError::Security(_) => "security",
            EngineError::MaxStepsExceeded(_) => "max_steps_exceeded",
            EngineError::RetryExhausted { .. } => "retry_exhausted",
            EngineError::Timeout(_) => "timeout",
            EngineError::PermissionDenied { .. } => "permission_denied",
            EngineError::AlreadyFinalised(_) => "already_finalised",
            EngineError::RuntimeException(_) => "runtime_exception",
        }
    }

    /// True when the error represents a transient condition worth a node retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimit(_) | EngineError::Timeout(_) | EngineError::ToolException(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::RuntimeException(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::RuntimeException(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: every variant maps to its documented symbolic code.
    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::InvalidGraph("x".into()).code(), "invalid_graph");
        assert_eq!(
            EngineError::RateLimit("too many".into()).code(),
            "rate_limit"
        );
        assert_eq!(
            EngineError::ToolError {
                code: -32000,
                message: "boom".into()
            }
            .code(),
            "tool_error"
        );
        assert_eq!(
            EngineError::PermissionDenied {
                key: "k".into(),
                write: true
            }
            .code(),
            "permission_denied"
        );
    }

    /// **Scenario**: security errors always render with "Security" in the text.
    #[test]
    fn security_display_contains_keyword() {
        let s = EngineError::Security("import is not allowed".into()).to_string();
        assert!(s.contains("Security"), "{}", s);
    }

    #[test]
    fn permission_denied_display_names_key() {
        let s = EngineError::PermissionDenied {
            key: "secret".into(),
            write: false,
        }
        .to_string();
        assert!(s.contains("permission denied"), "{}", s);
        assert!(s.contains("secret"), "{}", s);
    }
}
