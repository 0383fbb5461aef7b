//! Mock LLM for tests and examples.
//!
//! Returns scripted responses in order, repeating the last one when the
//! script is exhausted. A response can also be a scripted failure (e.g. a
//! rate error) so retry paths can be exercised deterministically.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::llm::{Completion, LlmProvider, Message, Tool, ToolCompletion, ToolUse};

/// One scripted turn of the mock.
#[derive(Debug, Clone)]
enum Scripted {
    Text(String),
    ToolCalls(Vec<ToolUse>),
    RateLimited(String),
    Error(String),
}

/// Mock provider: fixed scripted responses, call counting.
///
/// **Interaction**: implements `LlmProvider`; used wherever tests need an
/// LLM node or model-call step without the network.
pub struct MockLlm {
    script: Mutex<VecDeque<Scripted>>,
    /// Response used when the script runs out (default: empty text).
    fallback: Scripted,
    calls: Mutex<u64>,
    /// Tokens reported per call as (input, output).
    tokens: (u64, u64),
}

impl MockLlm {
    /// Mock that always answers with the same text.
    pub fn with_text(content: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Scripted::Text(content.into()),
            calls: Mutex::new(0),
            tokens: (10, 5),
        }
    }

    /// Mock that fails every call with a rate error (exercises `rate_limit`).
    pub fn always_rate_limited() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Scripted::RateLimited("rate limit exceeded".into()),
            calls: Mutex::new(0),
            tokens: (0, 0),
        }
    }

    /// Queue a scripted text response (builder).
    pub fn then_text(self, content: impl Into<String>) -> Self {
        self.push(Scripted::Text(content.into()))
    }

    /// Queue a scripted tool-call response (builder).
    pub fn then_tool_calls(self, calls: Vec<ToolUse>) -> Self {
        self.push(Scripted::ToolCalls(calls))
    }

    /// Queue a scripted rate-limit failure (builder).
    pub fn then_rate_limited(self, message: impl Into<String>) -> Self {
        self.push(Scripted::RateLimited(message.into()))
    }

    /// Queue a scripted provider failure (builder).
    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.push(Scripted::Error(message.into()))
    }

    /// Report these token counts on every call (builder).
    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.tokens = (input, output);
        self
    }

    /// How many completions were requested so far.
    pub fn call_count(&self) -> u64 {
        *self.calls.lock().expect("mock lock")
    }

    fn push(self, scripted: Scripted) -> Self {
        self.script.lock().expect("mock lock").push_back(scripted);
        self
    }

    fn next(&self) -> Scripted {
        *self.calls.lock().expect("mock lock") += 1;
        self.script
            .lock()
            .expect("mock lock")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn complete(
        &self,
        _messages: &[Message],
        _system: Option<&str>,
    ) -> Result<Completion, EngineError> {
        match self.next() {
            Scripted::Text(content) => Ok(Completion {
                content,
                input_tokens: self.tokens.0,
                output_tokens: self.tokens.1,
            }),
            Scripted::ToolCalls(_) => Ok(Completion {
                content: String::new(),
                input_tokens: self.tokens.0,
                output_tokens: self.tokens.1,
            }),
            Scripted::RateLimited(msg) => Err(EngineError::RateLimit(msg)),
            Scripted::Error(msg) => Err(EngineError::LlmError(msg)),
        }
    }

    async fn complete_with_tools(
        &self,
        _messages: &[Message],
        _tools: &[Tool],
        _system: Option<&str>,
    ) -> Result<ToolCompletion, EngineError> {
        match self.next() {
            Scripted::Text(content) => Ok(ToolCompletion {
                content,
                tool_calls: Vec::new(),
                input_tokens: self.tokens.0,
                output_tokens: self.tokens.1,
            }),
            Scripted::ToolCalls(tool_calls) => Ok(ToolCompletion {
                content: String::new(),
                tool_calls,
                input_tokens: self.tokens.0,
                output_tokens: self.tokens.1,
            }),
            Scripted::RateLimited(msg) => Err(EngineError::RateLimit(msg)),
            Scripted::Error(msg) => Err(EngineError::LlmError(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_responses_play_in_order_then_fall_back() {
        let llm = MockLlm::with_text("fallback").then_text("first");
        let r1 = llm.complete(&[Message::user("hi")], None).await.unwrap();
        assert_eq!(r1.content, "first");
        let r2 = llm.complete(&[Message::user("hi")], None).await.unwrap();
        assert_eq!(r2.content, "fallback");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn rate_limited_script_surfaces_rate_limit_code() {
        let llm = MockLlm::with_text("ok").then_rate_limited("429");
        let err = llm.complete(&[Message::user("hi")], None).await.unwrap_err();
        assert_eq!(err.code(), "rate_limit");
        // Script consumed; next call falls back to success.
        assert!(llm.complete(&[Message::user("hi")], None).await.is_ok());
    }

    #[tokio::test]
    async fn tool_call_script_returns_calls() {
        let llm = MockLlm::with_text("done").then_tool_calls(vec![ToolUse {
            id: "call-1".into(),
            name: "echo".into(),
            input: json!({"text": "hi"}),
        }]);
        let r = llm
            .complete_with_tools(&[Message::user("go")], &[], None)
            .await
            .unwrap();
        assert_eq!(r.tool_calls.len(), 1);
        assert_eq!(r.tool_calls[0].name, "echo");
    }
}
