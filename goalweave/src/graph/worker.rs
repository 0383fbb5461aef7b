//! Worker: executes one plan step by dispatching on its action kind.
//!
//! The five kinds (model call, external tool, sub-graph, registered
//! function, sandboxed code) share uniform input resolution (`$name`
//! references into the current context) and result shaping. Every dispatch
//! records exactly one decision in the runtime log; the outcome carries
//! success/error/tokens/latency.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::EngineError;
use crate::llm::{LlmProvider, Message, Tool, ToolUse};
use crate::runtime::{DecisionOption, DecisionType, Outcome, Runtime};

use super::executor::ExecutionResult;
use super::node::ToolExecutor;
use super::plan::{ActionSpec, ActionType, PlanStep};
use super::sandbox::CodeSandbox;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").expect("fence regex"));
static EMBEDDED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\{[\s\S]*\}|\[[\s\S]*\])").expect("json regex"));

/// Parses JSON from an LLM response, tolerating markdown code fences.
///
/// Tries, in order: each fenced block (```json … ``` or plain ``` … ```), the
/// whole response, and the first embedded `{…}`/`[…]` span. Returns the
/// parsed value (or `None`) together with the text that was parsed (or the
/// trimmed input when nothing parsed).
pub fn parse_llm_json_response(text: &str) -> (Option<Value>, String) {
    let cleaned = text.trim();

    for capture in CODE_FENCE.captures_iter(cleaned) {
        let body = capture[1].trim();
        if let Ok(parsed) = serde_json::from_str::<Value>(body) {
            return (Some(parsed), body.to_string());
        }
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(cleaned) {
        return (Some(parsed), cleaned.to_string());
    }

    for capture in EMBEDDED_JSON.captures_iter(cleaned) {
        let body = &capture[1];
        if let Ok(parsed) = serde_json::from_str::<Value>(body) {
            return (Some(parsed), body.to_string());
        }
    }

    (None, cleaned.to_string())
}

/// Result of executing one plan step.
#[derive(Debug, Clone, Default)]
pub struct StepExecutionResult {
    pub success: bool,
    pub outputs: BTreeMap<String, Value>,
    pub error: Option<String>,
    /// Stable symbolic error code, for judge rules.
    pub error_type: Option<String>,
    pub tokens_used: u64,
    pub latency_ms: u64,
    /// Which executor handled the step ("llm_call", "tool_use", ...).
    pub executor_type: String,
}

impl StepExecutionResult {
    fn ok(outputs: BTreeMap<String, Value>, executor_type: &str) -> Self {
        Self {
            success: true,
            outputs,
            executor_type: executor_type.to_string(),
            ..Default::default()
        }
    }

    fn fail(error: impl Into<String>, error_type: &str, executor_type: &str) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_type: Some(error_type.to_string()),
            executor_type: executor_type.to_string(),
            ..Default::default()
        }
    }
}

/// A registered in-process function: arguments in, JSON value out.
///
/// Both synchronous and asynchronous functions register through the same
/// boxed-future shape; the dispatcher awaits them uniformly.
pub type RegisteredFn = Arc<
    dyn Fn(BTreeMap<String, Value>) -> BoxFuture<'static, Result<Value, EngineError>>
        + Send
        + Sync,
>;

/// Executes a sub-graph on behalf of a `sub_graph` step.
///
/// **Interaction**: implemented by the host (typically a closure over another
/// `GraphExecutor`); injected into the worker.
#[async_trait]
pub trait SubGraphExecutor: Send + Sync {
    async fn execute(
        &self,
        graph_id: &str,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ExecutionResult, EngineError>;
}

/// The action dispatcher.
pub struct Worker {
    runtime: Arc<Runtime>,
    llm: Option<Arc<dyn LlmProvider>>,
    tools: DashMap<String, Tool>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    functions: DashMap<String, RegisteredFn>,
    sub_graph: Option<Arc<dyn SubGraphExecutor>>,
    sandbox: CodeSandbox,
}

impl Worker {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            llm: None,
            tools: DashMap::new(),
            tool_executor: None,
            functions: DashMap::new(),
            sub_graph: None,
            sandbox: CodeSandbox::new(),
        }
    }

    /// Attach an LLM provider for `llm_call` steps (builder).
    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Attach a tool executor for `tool_use` steps (builder).
    pub fn with_tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tool_executor = Some(executor);
        self
    }

    /// Attach a sub-graph executor for `sub_graph` steps (builder).
    pub fn with_sub_graph(mut self, sub_graph: Arc<dyn SubGraphExecutor>) -> Self {
        self.sub_graph = Some(sub_graph);
        self
    }

    /// Override the sandbox (builder).
    pub fn with_sandbox(mut self, sandbox: CodeSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Registers a tool spec so `tool_use` steps can resolve it.
    pub fn register_tool(&self, tool: Tool) {
        self.tools.insert(tool.name.clone(), tool);
    }

    /// Registers a synchronous function.
    pub fn register_function(
        &self,
        name: impl Into<String>,
        func: impl Fn(BTreeMap<String, Value>) -> Result<Value, EngineError> + Send + Sync + 'static,
    ) {
        let func = Arc::new(func);
        self.functions.insert(
            name.into(),
            Arc::new(move |args| {
                let func = Arc::clone(&func);
                Box::pin(async move { func(args) })
            }),
        );
    }

    /// Registers an asynchronous function.
    pub fn register_async_function(&self, name: impl Into<String>, func: RegisteredFn) {
        self.functions.insert(name.into(), func);
    }

    /// Executes one plan step against the current context.
    ///
    /// Records one decision; its outcome carries the step's
    /// success/error/tokens/latency.
    pub async fn execute(
        &self,
        step: &PlanStep,
        context: &BTreeMap<String, Value>,
    ) -> StepExecutionResult {
        let kind = step
            .action
            .action_type
            .map(|t| t.as_str())
            .unwrap_or("unknown");
        let decision = self.runtime.decide(
            &step.id,
            &format!("Execute plan step: {}", step.description),
            vec![DecisionOption::new(kind, format!("Execute {kind} action"))],
            kind,
            &format!("Step requires {kind}"),
            step.inputs.clone(),
            DecisionType::ActionDispatch,
        );
        let decision_id = match decision {
            Ok(id) => id,
            Err(e) => {
                return StepExecutionResult::fail(e.to_string(), e.code(), kind);
            }
        };

        let start = Instant::now();
        let resolved = resolve_refs(&step.inputs, context);
        let mut result = self.dispatch(&step.action, resolved, context).await;
        if result.latency_ms == 0 {
            result.latency_ms = start.elapsed().as_millis() as u64;
        }

        let outcome = if result.success {
            Outcome::success(
                Value::Object(result.outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                result.tokens_used,
                result.latency_ms,
            )
        } else {
            Outcome::failure(
                result.error.clone().unwrap_or_else(|| "unknown error".into()),
                result.tokens_used,
                result.latency_ms,
            )
        };
        if let Err(e) = self.runtime.record_outcome(&decision_id, outcome) {
            debug!(step = %step.id, error = %e, "failed to record step outcome");
        }

        result
    }

    async fn dispatch(
        &self,
        action: &ActionSpec,
        inputs: BTreeMap<String, Value>,
        context: &BTreeMap<String, Value>,
    ) -> StepExecutionResult {
        match action.action_type {
            Some(ActionType::LlmCall) => self.execute_llm_call(action, inputs).await,
            Some(ActionType::ToolUse) => self.execute_tool_use(action, inputs).await,
            Some(ActionType::SubGraph) => self.execute_sub_graph(action, inputs).await,
            Some(ActionType::Function) => self.execute_function(action, inputs).await,
            Some(ActionType::CodeExecution) => self.execute_code(action, inputs, context),
            None => StepExecutionResult::fail("no action type specified", "invalid_action", "unknown"),
        }
    }

    async fn execute_llm_call(
        &self,
        action: &ActionSpec,
        inputs: BTreeMap<String, Value>,
    ) -> StepExecutionResult {
        const EXECUTOR: &str = "llm_call";
        let Some(llm) = &self.llm else {
            return StepExecutionResult::fail("no LLM provider configured", "configuration", EXECUTOR);
        };

        let mut prompt = interpolate(action.prompt.as_deref().unwrap_or(""), &inputs);
        if !inputs.is_empty() {
            prompt.push_str("\n\n--- Context Data ---\n");
            for (key, value) in &inputs {
                match value {
                    Value::String(s) => prompt.push_str(&format!("{key}: {s}\n")),
                    Value::Object(_) | Value::Array(_) => prompt.push_str(&format!(
                        "{key}: {}\n",
                        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
                    )),
                    other => prompt.push_str(&format!("{key}: {other}\n")),
                }
            }
        }

        match llm
            .complete(&[Message::user(prompt)], action.system_prompt.as_deref())
            .await
        {
            Ok(response) => {
                let (parsed, _) = parse_llm_json_response(&response.content);
                let result_value = parsed.clone().unwrap_or_else(|| Value::String(response.content.clone()));
                let outputs: BTreeMap<String, Value> = [
                    ("result".to_string(), result_value),
                    ("response".to_string(), Value::String(response.content)),
                    ("parsed_json".to_string(), parsed.unwrap_or(Value::Null)),
                ]
                .into_iter()
                .collect();
                let mut r = StepExecutionResult::ok(outputs, EXECUTOR);
                r.tokens_used = response.input_tokens + response.output_tokens;
                r
            }
            Err(e) => {
                let error_type = match &e {
                    EngineError::RateLimit(_) => "rate_limit",
                    _ => "llm_error",
                };
                StepExecutionResult::fail(e.to_string(), error_type, EXECUTOR)
            }
        }
    }

    async fn execute_tool_use(
        &self,
        action: &ActionSpec,
        inputs: BTreeMap<String, Value>,
    ) -> StepExecutionResult {
        const EXECUTOR: &str = "tool_use";
        let Some(tool_name) = action.tool_name.as_deref() else {
            return StepExecutionResult::fail("no tool name specified", "invalid_action", EXECUTOR);
        };

        // Step inputs override the action's own args; then resolve `$name`
        // references against the merged map itself (second pass).
        let mut args = action.tool_args.clone();
        args.extend(inputs);
        let merged = args.clone();
        let args = resolve_refs(&args, &merged);

        // A process-local function shadows a server tool of the same name.
        if let Some(func) = self.functions.get(tool_name).map(|f| f.value().clone()) {
            return match func(args).await {
                Ok(value) => shape_function_result(value, EXECUTOR),
                Err(e) => StepExecutionResult::fail(e.to_string(), "tool_exception", EXECUTOR),
            };
        }

        if !self.tools.contains_key(tool_name) {
            return StepExecutionResult::fail(
                format!("Tool '{tool_name}' not found"),
                "missing_tool",
                EXECUTOR,
            );
        }
        let Some(executor) = &self.tool_executor else {
            return StepExecutionResult::fail("no tool executor configured", "configuration", EXECUTOR);
        };

        let tool_use = ToolUse {
            id: format!("step_{tool_name}"),
            name: tool_name.to_string(),
            input: Value::Object(args.into_iter().collect()),
        };
        match executor.execute(&tool_use).await {
            Ok(value) => {
                let mut outputs = BTreeMap::new();
                outputs.insert("result".to_string(), value.clone());
                // Tools often answer with a JSON object (or its text form);
                // spread the top-level fields so steps can wire them onward.
                match value {
                    Value::Object(map) => {
                        for (k, v) in map {
                            outputs.insert(k, v);
                        }
                    }
                    Value::String(ref s) => {
                        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(s) {
                            for (k, v) in map {
                                outputs.insert(k, v);
                            }
                        }
                    }
                    _ => {}
                }
                StepExecutionResult::ok(outputs, EXECUTOR)
            }
            Err(e @ EngineError::ToolError { .. }) => {
                StepExecutionResult::fail(e.to_string(), "tool_error", EXECUTOR)
            }
            Err(e) => StepExecutionResult::fail(e.to_string(), "tool_exception", EXECUTOR),
        }
    }

    async fn execute_sub_graph(
        &self,
        action: &ActionSpec,
        inputs: BTreeMap<String, Value>,
    ) -> StepExecutionResult {
        const EXECUTOR: &str = "sub_graph";
        let Some(sub_graph) = &self.sub_graph else {
            return StepExecutionResult::fail(
                "no sub-graph executor configured",
                "configuration",
                EXECUTOR,
            );
        };
        let Some(graph_id) = action.graph_id.as_deref() else {
            return StepExecutionResult::fail("no graph ID specified", "invalid_action", EXECUTOR);
        };

        match sub_graph.execute(graph_id, inputs).await {
            Ok(result) => {
                let mut r = if result.success {
                    StepExecutionResult::ok(result.output, EXECUTOR)
                } else {
                    StepExecutionResult::fail(
                        result.error.unwrap_or_else(|| "sub-graph failed".into()),
                        "runtime_exception",
                        EXECUTOR,
                    )
                };
                r.tokens_used = result.total_tokens;
                r
            }
            Err(e) => StepExecutionResult::fail(e.to_string(), e.code(), EXECUTOR),
        }
    }

    async fn execute_function(
        &self,
        action: &ActionSpec,
        inputs: BTreeMap<String, Value>,
    ) -> StepExecutionResult {
        const EXECUTOR: &str = "function";
        let Some(name) = action.function_name.as_deref() else {
            return StepExecutionResult::fail("no function name specified", "invalid_action", EXECUTOR);
        };
        let Some(func) = self.functions.get(name).map(|f| f.value().clone()) else {
            return StepExecutionResult::fail(
                format!("Function '{name}' not registered"),
                "missing_function",
                EXECUTOR,
            );
        };

        let mut args = action.function_args.clone();
        args.extend(inputs);

        match func(args).await {
            Ok(value) => shape_function_result(value, EXECUTOR),
            Err(e) => StepExecutionResult::fail(e.to_string(), e.code(), EXECUTOR),
        }
    }

    fn execute_code(
        &self,
        action: &ActionSpec,
        inputs: BTreeMap<String, Value>,
        context: &BTreeMap<String, Value>,
    ) -> StepExecutionResult {
        const EXECUTOR: &str = "code_execution";
        let Some(code) = action.code.as_deref() else {
            return StepExecutionResult::fail("no code specified", "invalid_action", EXECUTOR);
        };

        let mut locals = context.clone();
        locals.extend(inputs);

        let sandbox_result = self.sandbox.execute(code, &locals);
        if sandbox_result.success {
            let mut outputs = BTreeMap::new();
            outputs.insert("result".to_string(), sandbox_result.result);
            outputs.extend(sandbox_result.variables);
            let mut r = StepExecutionResult::ok(outputs, EXECUTOR);
            r.latency_ms = sandbox_result.execution_time_ms;
            r
        } else {
            let error = sandbox_result.error.unwrap_or_else(|| "code failed".into());
            let error_type = if error.contains("Security") {
                "security"
            } else {
                "code_error"
            };
            let mut r = StepExecutionResult::fail(error, error_type, EXECUTOR);
            r.latency_ms = sandbox_result.execution_time_ms;
            r
        }
    }
}

/// Resolves `$name` string references against a context map. Unresolvable
/// references keep their literal form.
fn resolve_refs(
    inputs: &BTreeMap<String, Value>,
    context: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    inputs
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                Value::String(s) if s.starts_with('$') => {
                    context.get(&s[1..]).cloned().unwrap_or_else(|| value.clone())
                }
                other => other.clone(),
            };
            (key.clone(), resolved)
        })
        .collect()
}

/// Replaces `{name}` placeholders with the stringified input value,
/// tolerating placeholders with no matching input.
fn interpolate(template: &str, inputs: &BTreeMap<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in inputs {
        let placeholder = format!("{{{key}}}");
        if out.contains(&placeholder) {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &text);
        }
    }
    out
}

/// Preserves a `{success, outputs, error}`-shaped return; wraps anything else
/// as `{result}`.
fn shape_function_result(value: Value, executor_type: &str) -> StepExecutionResult {
    if let Value::Object(ref map) = value {
        if map.contains_key("success") {
            let success = map.get("success").and_then(Value::as_bool).unwrap_or(false);
            let outputs: BTreeMap<String, Value> = map
                .get("outputs")
                .and_then(Value::as_object)
                .map(|o: &Map<String, Value>| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            return StepExecutionResult {
                success,
                outputs,
                error: map.get("error").and_then(Value::as_str).map(String::from),
                error_type: map.get("error_type").and_then(Value::as_str).map(String::from),
                executor_type: executor_type.to_string(),
                ..Default::default()
            };
        }
    }
    StepExecutionResult::ok(
        [("result".to_string(), value)].into_iter().collect(),
        executor_type,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use serde_json::json;

    fn worker() -> Worker {
        Worker::new(Arc::new(Runtime::unpersisted()))
    }

    fn started(worker: Worker) -> Worker {
        worker
            .runtime
            .start_run("g1", "test goal", BTreeMap::new())
            .expect("start run");
        worker
    }

    /// **Scenario**: JSON extraction returns the same value for bare JSON, a
    /// ```json fence, and a generic fence.
    #[test]
    fn json_extraction_is_fence_insensitive() {
        let expected = json!({"key": "value"});
        let bare = r#"{"key": "value"}"#;
        let json_fence = "```json\n{\"key\": \"value\"}\n```";
        let generic_fence = "```\n{\"key\": \"value\"}\n```";
        for text in [bare, json_fence, generic_fence] {
            let (parsed, _) = parse_llm_json_response(text);
            assert_eq!(parsed, Some(expected.clone()), "input: {text}");
        }
    }

    #[test]
    fn json_extraction_finds_embedded_objects_and_falls_back_to_text() {
        let (parsed, _) = parse_llm_json_response("Here you go: {\"a\": 1} hope that helps");
        assert_eq!(parsed, Some(json!({"a": 1})));

        let (parsed, cleaned) = parse_llm_json_response("  just words  ");
        assert_eq!(parsed, None);
        assert_eq!(cleaned, "just words");
    }

    #[test]
    fn dollar_references_resolve_from_context() {
        let inputs: BTreeMap<String, Value> = [
            ("a".to_string(), json!("$seed")),
            ("b".to_string(), json!("$missing")),
            ("c".to_string(), json!("literal")),
        ]
        .into_iter()
        .collect();
        let context: BTreeMap<String, Value> =
            [("seed".to_string(), json!(42))].into_iter().collect();
        let resolved = resolve_refs(&inputs, &context);
        assert_eq!(resolved.get("a"), Some(&json!(42)));
        assert_eq!(resolved.get("b"), Some(&json!("$missing")));
        assert_eq!(resolved.get("c"), Some(&json!("literal")));
    }

    #[tokio::test]
    async fn llm_call_step_emits_result_response_and_parsed_json() {
        let w = started(worker().with_llm(Arc::new(MockLlm::with_text("```json\n{\"tone\": \"warm\"}\n```"))));
        let step = PlanStep::new("s1", "draft", ActionSpec::llm_call("Write to {name}"))
            .with_input("name", json!("Ada"));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.outputs.get("result"), Some(&json!({"tone": "warm"})));
        assert_eq!(result.outputs.get("parsed_json"), Some(&json!({"tone": "warm"})));
        assert!(result.outputs.contains_key("response"));
        assert_eq!(result.tokens_used, 15);
        assert_eq!(result.executor_type, "llm_call");
    }

    #[tokio::test]
    async fn llm_call_without_provider_is_a_configuration_failure() {
        let w = started(worker());
        let step = PlanStep::new("s1", "draft", ActionSpec::llm_call("hi"));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("configuration"));
    }

    #[tokio::test]
    async fn rate_errors_classify_as_rate_limit() {
        let w = started(worker().with_llm(Arc::new(MockLlm::always_rate_limited())));
        let step = PlanStep::new("s1", "draft", ActionSpec::llm_call("hi"));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert_eq!(result.error_type.as_deref(), Some("rate_limit"));
    }

    #[tokio::test]
    async fn registered_function_shadows_server_tools() {
        let w = started(worker());
        w.register_function("add_one", |args| {
            let x = args.get("x").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({"y": x + 1}))
        });
        let step = PlanStep::new("s1", "add", ActionSpec::tool_use("add_one"))
            .with_input("x", json!(3));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert!(result.success);
        assert_eq!(result.outputs.get("result"), Some(&json!({"y": 4})));
    }

    #[tokio::test]
    async fn unknown_tool_is_missing_tool() {
        let w = started(worker());
        let step = PlanStep::new("s1", "call", ActionSpec::tool_use("nope"));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert_eq!(result.error_type.as_deref(), Some("missing_tool"));
    }

    #[tokio::test]
    async fn known_tool_without_executor_is_configuration() {
        let w = started(worker());
        w.register_tool(Tool {
            name: "echo".into(),
            description: "echo".into(),
            input_schema: json!({}),
        });
        let step = PlanStep::new("s1", "call", ActionSpec::tool_use("echo"));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert_eq!(result.error_type.as_deref(), Some("configuration"));
    }

    #[tokio::test]
    async fn function_returning_success_shape_is_preserved() {
        let w = started(worker());
        w.register_function("check", |_| {
            Ok(json!({"success": false, "outputs": {}, "error": "went wrong", "error_type": "tool_error"}))
        });
        let step = PlanStep::new("s1", "check", ActionSpec::function("check"));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("went wrong"));
        assert_eq!(result.error_type.as_deref(), Some("tool_error"));
    }

    #[tokio::test]
    async fn unregistered_function_is_missing_function() {
        let w = started(worker());
        let step = PlanStep::new("s1", "call", ActionSpec::function("ghost"));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert_eq!(result.error_type.as_deref(), Some("missing_function"));
    }

    #[tokio::test]
    async fn code_step_returns_result_and_new_variables() {
        let w = started(worker());
        let step = PlanStep::new("s1", "compute", ActionSpec::code("y = x + 1\ny * 2"))
            .with_input("x", json!(3));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.outputs.get("result"), Some(&json!(8)));
        assert_eq!(result.outputs.get("y"), Some(&json!(4)));
        assert_eq!(result.executor_type, "code_execution");
    }

    #[tokio::test]
    async fn refused_code_classifies_as_security() {
        let w = started(worker());
        let step = PlanStep::new("s1", "bad", ActionSpec::code("import os"));
        let result = w.execute(&step, &BTreeMap::new()).await;
        assert_eq!(result.error_type.as_deref(), Some("security"));
    }

    #[tokio::test]
    async fn each_dispatch_records_exactly_one_decision() {
        let w = started(worker());
        let step = PlanStep::new("s1", "compute", ActionSpec::code("1 + 1"));
        w.execute(&step, &BTreeMap::new()).await;
        w.execute(&step, &BTreeMap::new()).await;
        let run = w.runtime.current_run().expect("active run");
        assert_eq!(run.decisions.len(), 2);
        assert!(run.decisions.iter().all(|d| d.has_outcome()));
        assert!(run
            .decisions
            .iter()
            .all(|d| d.intent.starts_with("Execute plan step:")));
    }
}
