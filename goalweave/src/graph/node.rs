//! Nodes: units of computation over the shared blackboard.
//!
//! A `NodeSpec` declares what a node reads, writes, and may call; the
//! executor builds a `NodeContext` (permission-scoped memory, filtered tools,
//! goal context) and dispatches to a `NodeImpl`. Four built-ins cover the
//! closed set of node types; anything else is supplied through the node
//! registry keyed by node id.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::goal::Goal;
use crate::llm::{LlmProvider, Message, Tool, ToolUse};
use crate::memory::MemoryView;

use super::worker::parse_llm_json_response;

/// Closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// One completion turn; output parsed from the response.
    LlmGenerate,
    /// Completion with tools; tool calls dispatched and fed back.
    LlmToolUse,
    /// Selects among declared routes; sets `next_node`.
    Router,
    /// Registered in-process implementation.
    Function,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::LlmGenerate => "llm_generate",
            NodeType::LlmToolUse => "llm_tool_use",
            NodeType::Router => "router",
            NodeType::Function => "function",
        }
    }
}

/// Declarative description of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub node_type: NodeType,
    /// Keys this node may read from shared memory.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys this node may write to shared memory.
    #[serde(default)]
    pub output_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Tool names this node may call (required non-empty for `llm_tool_use`).
    #[serde(default)]
    pub tools: Vec<String>,
    /// Route label → target node id (required non-empty for `router`).
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
}

/// Everything a node sees while executing: scoped memory, filtered tools,
/// goal context, and the current attempt number.
///
/// A context is a short-lived capability tied to one node visit.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub spec: NodeSpec,
    pub memory: MemoryView,
    pub goal: Goal,
    pub goal_context: String,
    /// Tools available to this node (already filtered to `spec.tools`).
    pub available_tools: Vec<Tool>,
    /// 1-based attempt number for this visit.
    pub attempt: u32,
}

impl NodeContext {
    /// Snapshot of the inputs this node is permitted to read.
    pub fn input_snapshot(&self) -> BTreeMap<String, Value> {
        self.memory.read_permitted()
    }
}

/// Result of one node execution attempt.
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub success: bool,
    /// Key→value pairs the node produced (declared ones are also in memory).
    pub output: BTreeMap<String, Value>,
    pub error: Option<String>,
    /// Explicit next node (routers); overrides edge following.
    pub next_node: Option<String>,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

impl NodeResult {
    pub fn ok(output: BTreeMap<String, Value>) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Set the explicit next node (builder).
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next_node = Some(next.into());
        self
    }
}

/// Executes tool calls on behalf of LLM nodes and the worker.
///
/// **Interaction**: implemented over the MCP client(s) by `AgentRunner`; a
/// process-local function registry can sit in front (lookup order is the
/// caller's concern).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Runs one tool invocation and returns its result payload.
    async fn execute(&self, tool_use: &ToolUse) -> Result<Value, EngineError>;
}

/// A node implementation.
///
/// `validate_input` reports warnings only; the executor logs them as
/// problems but proceeds. `execute` reports failure inside `NodeResult`
/// rather than erroring, so the retry budget and `on_failure` edges apply.
#[async_trait]
pub trait NodeImpl: Send + Sync {
    /// Names of declared inputs missing from memory (warnings, not errors).
    fn validate_input(&self, ctx: &NodeContext) -> Vec<String> {
        let present = ctx.memory.read_permitted();
        ctx.spec
            .input_keys
            .iter()
            .filter(|k| !present.contains_key(*k))
            .map(|k| format!("missing input '{k}'"))
            .collect()
    }

    /// Runs the node against its context.
    async fn execute(&self, ctx: &NodeContext) -> NodeResult;
}

// === Built-in: LLM node (generate and tool-use) ===

/// Rounds of tool use before the node gives up waiting for a final answer.
const MAX_TOOL_ROUNDS: usize = 5;

/// LLM-backed node covering `llm_generate` and `llm_tool_use`.
pub struct LlmNode {
    llm: Arc<dyn LlmProvider>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
}

impl LlmNode {
    /// Generate-only node (no tool executor).
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            tool_executor: None,
        }
    }

    /// Tool-using node.
    pub fn with_tool_executor(llm: Arc<dyn LlmProvider>, tool_executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            llm,
            tool_executor: Some(tool_executor),
        }
    }

    fn build_prompt(ctx: &NodeContext) -> String {
        let mut prompt = String::new();
        if !ctx.goal_context.is_empty() {
            prompt.push_str(&ctx.goal_context);
            prompt.push('\n');
        }
        if !ctx.spec.description.is_empty() {
            prompt.push_str(&ctx.spec.description);
            prompt.push('\n');
        }
        let inputs = ctx.input_snapshot();
        if !inputs.is_empty() {
            prompt.push_str("\n--- Context Data ---\n");
            for (key, value) in &inputs {
                match value {
                    Value::String(s) => prompt.push_str(&format!("{key}: {s}\n")),
                    other => prompt.push_str(&format!("{key}: {other}\n")),
                }
            }
        }
        if !ctx.spec.output_keys.is_empty() {
            prompt.push_str(&format!(
                "\nRespond with a JSON object containing the keys: {}.\n",
                ctx.spec.output_keys.join(", ")
            ));
        }
        prompt
    }

    /// Writes parsed output into the node's declared keys and returns the
    /// produced output map.
    fn shape_output(ctx: &NodeContext, content: &str) -> Result<BTreeMap<String, Value>, EngineError> {
        let (parsed, cleaned) = parse_llm_json_response(content);
        let mut output = BTreeMap::new();
        match parsed {
            Some(Value::Object(map)) => {
                let mut matched = false;
                for key in &ctx.spec.output_keys {
                    if let Some(value) = map.get(key) {
                        ctx.memory.write(key, value.clone())?;
                        output.insert(key.clone(), value.clone());
                        matched = true;
                    }
                }
                if !matched {
                    // Nothing lined up with the declared keys; keep the whole
                    // object under the first declared key so data is not lost.
                    if let Some(first) = ctx.spec.output_keys.first() {
                        let value = Value::Object(map);
                        ctx.memory.write(first, value.clone())?;
                        output.insert(first.clone(), value);
                    }
                }
            }
            Some(value) => {
                if let Some(first) = ctx.spec.output_keys.first() {
                    ctx.memory.write(first, value.clone())?;
                    output.insert(first.clone(), value);
                }
            }
            None => {
                if let Some(first) = ctx.spec.output_keys.first() {
                    let value = Value::String(cleaned);
                    ctx.memory.write(first, value.clone())?;
                    output.insert(first.clone(), value);
                }
            }
        }
        Ok(output)
    }

    async fn run_generate(&self, ctx: &NodeContext) -> Result<NodeResult, EngineError> {
        let prompt = Self::build_prompt(ctx);
        let response = self
            .llm
            .complete(&[Message::user(prompt)], ctx.spec.system_prompt.as_deref())
            .await?;
        let output = Self::shape_output(ctx, &response.content)?;
        let mut result = NodeResult::ok(output);
        result.tokens_used = response.input_tokens + response.output_tokens;
        Ok(result)
    }

    async fn run_tool_use(&self, ctx: &NodeContext) -> Result<NodeResult, EngineError> {
        let tool_executor = self
            .tool_executor
            .as_ref()
            .ok_or_else(|| EngineError::Configuration("no tool executor configured".into()))?;

        let mut messages = vec![Message::user(Self::build_prompt(ctx))];
        let mut tokens = 0u64;

        for round in 0..MAX_TOOL_ROUNDS {
            let response = self
                .llm
                .complete_with_tools(
                    &messages,
                    &ctx.available_tools,
                    ctx.spec.system_prompt.as_deref(),
                )
                .await?;
            tokens += response.input_tokens + response.output_tokens;

            if response.tool_calls.is_empty() {
                let output = Self::shape_output(ctx, &response.content)?;
                let mut result = NodeResult::ok(output);
                result.tokens_used = tokens;
                return Ok(result);
            }

            if !response.content.is_empty() {
                messages.push(Message::assistant(response.content.clone()));
            }
            for call in &response.tool_calls {
                debug!(node = %ctx.node_id, tool = %call.name, round, "dispatching tool call");
                let text = match tool_executor.execute(call).await {
                    Ok(value) => match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    },
                    Err(e) => format!("Tool '{}' failed: {e}", call.name),
                };
                messages.push(Message::user(format!("Tool '{}' returned: {text}", call.name)));
            }
        }

        Err(EngineError::LlmError(format!(
            "no final answer after {MAX_TOOL_ROUNDS} tool rounds"
        )))
    }
}

#[async_trait]
impl NodeImpl for LlmNode {
    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        let result = match ctx.spec.node_type {
            NodeType::LlmToolUse => self.run_tool_use(ctx).await,
            _ => self.run_generate(ctx).await,
        };
        match result {
            Ok(r) => r,
            Err(e) => NodeResult::fail(e.to_string()),
        }
    }
}

// === Built-in: router ===

/// Router: maps its route-selection input to one of the declared routes.
///
/// Selection order: exact label match on the first declared input key's
/// value; LLM one-shot classification when a provider is available; first
/// declared route as the fallback.
pub struct RouterNode {
    llm: Option<Arc<dyn LlmProvider>>,
}

impl RouterNode {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self { llm }
    }

    async fn pick_route(&self, ctx: &NodeContext) -> Option<String> {
        let routes = &ctx.spec.routes;
        let selector = ctx
            .spec
            .input_keys
            .first()
            .and_then(|key| ctx.memory.read(key).ok().flatten());

        if let Some(Value::String(label)) = &selector {
            if routes.contains_key(label) {
                return Some(label.clone());
            }
        }

        if let Some(llm) = &self.llm {
            let labels: Vec<&str> = routes.keys().map(String::as_str).collect();
            let prompt = format!(
                "{}\nSelect the best route for the current state.\nState: {}\nRoutes: {}\nAnswer with exactly one route name.",
                ctx.goal_context,
                serde_json::to_string(&ctx.input_snapshot()).unwrap_or_default(),
                labels.join(", ")
            );
            if let Ok(response) = llm.complete(&[Message::user(prompt)], None).await {
                let answer = response.content.trim().trim_matches('"');
                if routes.contains_key(answer) {
                    return Some(answer.to_string());
                }
                warn!(node = %ctx.node_id, answer, "router LLM answer matched no route");
            }
        }

        routes.keys().next().cloned()
    }
}

#[async_trait]
impl NodeImpl for RouterNode {
    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        let Some(label) = self.pick_route(ctx).await else {
            return NodeResult::fail("router has no routes declared");
        };
        let Some(target) = ctx.spec.routes.get(&label).cloned() else {
            return NodeResult::fail(format!("route '{label}' has no target"));
        };
        debug!(node = %ctx.node_id, route = %label, target = %target, "router selected");
        let mut output = BTreeMap::new();
        output.insert("route".to_string(), Value::String(label));
        NodeResult::ok(output).with_next(target)
    }
}

// === Built-in: function ===

/// Signature of an in-process function node body.
pub type NodeFn =
    Arc<dyn Fn(&NodeContext) -> Result<BTreeMap<String, Value>, EngineError> + Send + Sync>;

/// Function node: wraps a registered closure. The closure's returned pairs
/// are written to the node's declared output keys.
pub struct FunctionNode {
    func: NodeFn,
}

impl FunctionNode {
    pub fn new(
        func: impl Fn(&NodeContext) -> Result<BTreeMap<String, Value>, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl NodeImpl for FunctionNode {
    async fn execute(&self, ctx: &NodeContext) -> NodeResult {
        match (self.func)(ctx) {
            Ok(output) => {
                for (key, value) in &output {
                    if ctx.spec.output_keys.iter().any(|k| k == key) {
                        if let Err(e) = ctx.memory.write(key, value.clone()) {
                            return NodeResult::fail(e.to_string());
                        }
                    }
                }
                NodeResult::ok(output)
            }
            Err(e) => NodeResult::fail(e.to_string()),
        }
    }
}
