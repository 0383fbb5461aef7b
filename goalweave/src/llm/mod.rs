//! LLM provider abstraction.
//!
//! The engine never talks to a model vendor directly: LLM nodes and the
//! action dispatcher depend on `LlmProvider`, which offers exactly two
//! operations: `complete` and `complete_with_tools`. Implementations:
//! `MockLlm` (scripted responses for tests) and `ChatOpenAI` (Chat
//! Completions API via async-openai).

mod mock;
mod openai;

pub use mock::MockLlm;
pub use openai::ChatOpenAI;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One chat message exchanged with the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: ChatRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }
}

/// A tool offered to the model for `complete_with_tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's arguments.
    pub input_schema: Value,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Response to `complete`: assistant text plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Response to `complete_with_tools`: text, requested tool calls, tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCompletion {
    pub content: String,
    pub tool_calls: Vec<ToolUse>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Uniform completion contract shielding the engine from model vendors.
///
/// Implementations must be safe to call from multiple tasks (`complete` is
/// assumed thread-safe by the shared-resource policy).
///
/// **Interaction**: used by `LlmNode` (both generate and tool-use flavours),
/// the worker's model-call action, and LLM-assisted routing.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One completion turn over the given messages.
    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
    ) -> Result<Completion, EngineError>;

    /// One completion turn with tools offered; the model may request calls.
    async fn complete_with_tools(
        &self,
        messages: &[Message],
        tools: &[Tool],
        system: Option<&str>,
    ) -> Result<ToolCompletion, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::user("hi").role, ChatRole::User);
        assert_eq!(Message::assistant("ok").role, ChatRole::Assistant);
        assert_eq!(Message::system("be brief").role, ChatRole::System);
    }

    #[test]
    fn chat_role_serialises_snake_case() {
        assert_eq!(serde_json::to_string(&ChatRole::User).unwrap(), "\"user\"");
        assert_eq!(
            serde_json::to_string(&ChatRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
