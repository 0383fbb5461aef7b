//! OpenAI Chat Completions provider (ChatOpenAI).
//!
//! Implements `LlmProvider` over the Chat Completions API. Requires
//! `OPENAI_API_KEY` (or explicit config). Rate errors from the API surface as
//! `EngineError::RateLimit` so the executor's retry budget applies; all other
//! API failures map to `llm_error`.

use async_trait::async_trait;
use tracing::{debug, trace};

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionMessageToolCalls, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage, ChatCompletionTool,
        ChatCompletionTools, CreateChatCompletionRequestArgs, FunctionObject,
    },
    Client,
};

use crate::error::EngineError;
use crate::llm::{ChatRole, Completion, LlmProvider, Message, Tool, ToolCompletion, ToolUse};

/// OpenAI-backed provider implementing the engine's completion contract.
///
/// Uses `OPENAI_API_KEY` from the environment by default; or provide config
/// via `ChatOpenAI::with_config` (custom key / base URL).
pub struct ChatOpenAI {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: Option<f32>,
}

impl ChatOpenAI {
    /// Build with default config (API key from `OPENAI_API_KEY` env).
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
            temperature: None,
        }
    }

    /// Build with custom config (e.g. custom API key or base URL).
    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
            temperature: None,
        }
    }

    /// Set temperature (0–2). Lower values are more deterministic.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Convert engine messages (plus optional system prompt) to request messages.
    fn messages_to_request(
        messages: &[Message],
        system: Option<&str>,
    ) -> Vec<ChatCompletionRequestMessage> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            out.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessage::from(system),
            ));
        }
        for m in messages {
            out.push(match m.role {
                ChatRole::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessage::from(m.content.as_str()),
                ),
                ChatRole::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessage::from(m.content.as_str()),
                ),
                ChatRole::Assistant => {
                    ChatCompletionRequestMessage::Assistant((m.content.as_str()).into())
                }
            });
        }
        out
    }

    fn map_api_error(e: impl std::fmt::Display) -> EngineError {
        let text = e.to_string();
        if text.to_lowercase().contains("rate") {
            EngineError::RateLimit(text)
        } else {
            EngineError::LlmError(format!("OpenAI API error: {text}"))
        }
    }

    async fn create(
        &self,
        messages: &[Message],
        tools: Option<&[Tool]>,
        system: Option<&str>,
    ) -> Result<ToolCompletion, EngineError> {
        let openai_messages = Self::messages_to_request(messages, system);
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(self.model.clone());
        args.messages(openai_messages);

        if let Some(tools) = tools {
            let chat_tools: Vec<ChatCompletionTools> = tools
                .iter()
                .map(|t| {
                    ChatCompletionTools::Function(ChatCompletionTool {
                        function: FunctionObject {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: Some(t.input_schema.clone()),
                            ..Default::default()
                        },
                    })
                })
                .collect();
            args.tools(chat_tools);
        }

        if let Some(t) = self.temperature {
            args.temperature(t);
        }

        let request = args
            .build()
            .map_err(|e| EngineError::LlmError(format!("OpenAI request build failed: {e}")))?;

        debug!(
            model = %self.model,
            message_count = messages.len(),
            tools_count = tools.map(|t| t.len()).unwrap_or(0),
            temperature = ?self.temperature,
            "OpenAI chat create"
        );
        if let Ok(js) = serde_json::to_string(&request) {
            trace!(request = %js, "OpenAI request body");
        }

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(Self::map_api_error)?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::LlmError("OpenAI returned no choices".to_string()))?;

        let msg = choice.message;
        let content = msg.content.unwrap_or_default();
        let tool_calls: Vec<ToolUse> = msg
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tc| {
                if let ChatCompletionMessageToolCalls::Function(f) = tc {
                    let input = serde_json::from_str(&f.function.arguments)
                        .unwrap_or(serde_json::Value::Null);
                    Some(ToolUse {
                        id: f.id,
                        name: f.function.name,
                        input,
                    })
                } else {
                    None
                }
            })
            .collect();

        let (input_tokens, output_tokens) = response
            .usage
            .map(|u| (u64::from(u.prompt_tokens), u64::from(u.completion_tokens)))
            .unwrap_or((0, 0));

        Ok(ToolCompletion {
            content,
            tool_calls,
            input_tokens,
            output_tokens,
        })
    }
}

#[async_trait]
impl LlmProvider for ChatOpenAI {
    async fn complete(
        &self,
        messages: &[Message],
        system: Option<&str>,
    ) -> Result<Completion, EngineError> {
        let response = self.create(messages, None, system).await?;
        Ok(Completion {
            content: response.content,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        })
    }

    async fn complete_with_tools(
        &self,
        messages: &[Message],
        tools: &[Tool],
        system: Option<&str>,
    ) -> Result<ToolCompletion, EngineError> {
        self.create(messages, Some(tools), system).await
    }
}
