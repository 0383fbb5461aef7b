//! Graph executor: drives nodes, follows edges, budgets steps, pauses and
//! resumes.
//!
//! One `execute` call is one run: validate the graph, initialise (or
//! rehydrate) shared memory, then loop: build the node's scoped context,
//! dispatch, record the decision, retry within the node budget, honour pause
//! and terminal nodes, follow edges. Failures that can be represented as a
//! node failure stay in the loop so `on_failure` edges can react; anything
//! that corrupts the engine's invariants fails the run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::goal::Goal;
use crate::llm::{LlmProvider, Tool};
use crate::memory::SharedMemory;
use crate::runtime::{DecisionOption, DecisionType, Outcome, Runtime, Severity};

use super::edge::{EdgeCondition, EdgeSpec, GraphSpec, RESUME_SUFFIX};
use super::node::{
    FunctionNode, LlmNode, NodeContext, NodeImpl, NodeResult, NodeSpec, NodeType, RouterNode,
    ToolExecutor,
};
use super::sandbox::CodeSandbox;

/// Opaque resume token produced on pause and accepted on the next call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Node the run paused at.
    pub paused_at: String,
    /// Where to re-enter: the pause node's `_resume` entry when the graph
    /// declares one, else the pause node itself.
    pub resume_from: String,
    /// Memory snapshot at the pause point.
    pub memory: BTreeMap<String, Value>,
    /// Reserved; always `None` (resume re-enters via `resume_from`).
    pub next_node: Option<String>,
}

/// Result of executing a graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps_executed: u32,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    /// Node ids in traversal order.
    #[serde(default)]
    pub path: Vec<String>,
    /// Set when the run paused for human input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_state: Option<SessionState>,
    /// Id of the recorded run, when one was opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ExecutionResult {
    fn refused(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Mutable bookkeeping for one run of the loop.
struct LoopState {
    steps: u32,
    path: Vec<String>,
    total_tokens: u64,
    total_latency_ms: u64,
}

/// Executes agent graphs.
pub struct GraphExecutor {
    runtime: Arc<Runtime>,
    llm: Option<Arc<dyn LlmProvider>>,
    tools: Vec<Tool>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    node_registry: HashMap<String, Arc<dyn NodeImpl>>,
    sandbox: CodeSandbox,
}

impl GraphExecutor {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            llm: None,
            tools: Vec::new(),
            tool_executor: None,
            node_registry: HashMap::new(),
            sandbox: CodeSandbox::new(),
        }
    }

    /// Attach an LLM provider for LLM nodes and routers (builder).
    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Declare the tools available to `llm_tool_use` nodes (builder).
    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    /// Attach the tool executor that runs those tools (builder).
    pub fn with_tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tool_executor = Some(executor);
        self
    }

    /// Registers a custom node implementation for a node id.
    pub fn register_node(&mut self, node_id: impl Into<String>, node: Arc<dyn NodeImpl>) {
        self.node_registry.insert(node_id.into(), node);
    }

    /// Registers a function as a node implementation.
    pub fn register_function(
        &mut self,
        node_id: impl Into<String>,
        func: impl Fn(&NodeContext) -> Result<BTreeMap<String, Value>, EngineError>
            + Send
            + Sync
            + 'static,
    ) {
        self.node_registry
            .insert(node_id.into(), Arc::new(FunctionNode::new(func)));
    }

    /// Executes a graph for a goal.
    ///
    /// `session_state` resumes a previously paused run: memory is rehydrated
    /// from the snapshot, `input_data` is overlaid, and execution re-enters
    /// at the resume point.
    pub async fn execute(
        &self,
        graph: &GraphSpec,
        goal: &Goal,
        input_data: BTreeMap<String, Value>,
        session_state: Option<SessionState>,
    ) -> ExecutionResult {
        // Refused before side effects: no run is opened for an invalid graph.
        let errors = graph.validate();
        if !errors.is_empty() {
            return ExecutionResult::refused(format!("Invalid graph: {}", errors.join("; ")));
        }

        let memory = match &session_state {
            Some(state) => {
                info!(keys = state.memory.len(), "restored session memory");
                SharedMemory::from_snapshot(state.memory.clone())
            }
            None => SharedMemory::new(),
        };
        for (key, value) in &input_data {
            memory.write(key.clone(), value.clone());
        }

        let entry = graph.entry_point(session_state.as_ref().map(|s| s.resume_from.as_str()));
        if session_state.is_some() && entry != graph.entry_node {
            info!(resume_from = %entry, "resuming paused session");
        }
        // Re-entering at the paused node must not immediately re-pause it.
        let resume_skip = session_state.as_ref().map(|s| s.paused_at.clone());

        let run_id = match self.runtime.start_run(&goal.id, &goal.description, input_data) {
            Ok(id) => id,
            Err(e) => return ExecutionResult::refused(e.to_string()),
        };

        info!(goal = %goal.name, entry = %entry, run_id = %run_id, "starting execution");

        let mut state = LoopState {
            steps: 0,
            path: Vec::new(),
            total_tokens: 0,
            total_latency_ms: 0,
        };

        match self
            .run_loop(graph, goal, &memory, entry, resume_skip, &mut state)
            .await
        {
            Ok(Some(paused)) => paused,
            Ok(None) => {
                let output = memory.read_all();
                let narrative = format!(
                    "Executed {} steps through path: {}",
                    state.steps,
                    state.path.join(" -> ")
                );
                match self.runtime.end_run(true, Some(output.clone()), narrative) {
                    Ok(run) => ExecutionResult {
                        success: true,
                        output,
                        error: None,
                        steps_executed: state.steps,
                        total_tokens: state.total_tokens,
                        total_latency_ms: state.total_latency_ms,
                        path: state.path,
                        paused_at: None,
                        session_state: None,
                        run_id: Some(run.id),
                    },
                    Err(e) => ExecutionResult {
                        success: false,
                        output,
                        error: Some(e.to_string()),
                        steps_executed: state.steps,
                        total_tokens: state.total_tokens,
                        total_latency_ms: state.total_latency_ms,
                        path: state.path,
                        paused_at: None,
                        session_state: None,
                        run_id: None,
                    },
                }
            }
            Err(e) => {
                self.runtime
                    .report_problem(Severity::Critical, e.to_string(), None);
                let narrative = format!("Failed at step {}: {e}", state.steps);
                let run = self.runtime.end_run(false, None, narrative);
                ExecutionResult {
                    success: false,
                    output: BTreeMap::new(),
                    error: Some(e.to_string()),
                    steps_executed: state.steps,
                    total_tokens: state.total_tokens,
                    total_latency_ms: state.total_latency_ms,
                    path: state.path,
                    paused_at: None,
                    session_state: None,
                    run_id: run.ok().map(|r| r.id),
                }
            }
        }
    }

    /// The step loop. Returns `Ok(Some(result))` on pause, `Ok(None)` on
    /// normal completion, `Err` on an invariant-corrupting failure.
    async fn run_loop(
        &self,
        graph: &GraphSpec,
        goal: &Goal,
        memory: &SharedMemory,
        entry: String,
        resume_skip: Option<String>,
        state: &mut LoopState,
    ) -> Result<Option<ExecutionResult>, EngineError> {
        let mut current = entry;

        loop {
            if state.steps >= graph.max_steps {
                self.runtime.report_problem(
                    Severity::Warning,
                    format!("Step budget of {} exhausted", graph.max_steps),
                    None,
                );
                break;
            }
            state.steps += 1;

            let node_spec = graph
                .get_node(&current)
                .ok_or_else(|| EngineError::NodeNotFound(current.clone()))?
                .clone();

            state.path.push(current.clone());
            self.runtime.record_node_visit(&current);

            debug!(
                step = state.steps,
                node = %node_spec.name,
                node_type = node_spec.node_type.as_str(),
                "executing node"
            );

            let ctx = self.build_context(&node_spec, memory, goal);
            let node_impl = self.node_implementation(&node_spec)?;

            let validation = node_impl.validate_input(&ctx);
            if !validation.is_empty() {
                warn!(node = %current, warnings = ?validation, "input validation warnings");
                self.runtime.report_problem(
                    Severity::Warning,
                    format!("Validation warnings for {current}: {}", validation.join(", ")),
                    None,
                );
            }

            let decision_type = if node_spec.node_type == NodeType::Router {
                DecisionType::Routing
            } else {
                DecisionType::NodeExecution
            };
            let decision_id = self.runtime.decide(
                &current,
                &format!("Execute node: {}", node_spec.name),
                vec![DecisionOption::new(
                    node_spec.node_type.as_str(),
                    format!("Execute {} node", node_spec.node_type.as_str()),
                )
                .with_payload(serde_json::to_value(&node_spec.routes).unwrap_or(Value::Null))],
                node_spec.node_type.as_str(),
                &format!("Node type is {}", node_spec.node_type.as_str()),
                ctx.input_snapshot(),
                decision_type,
            )?;
            self.runtime
                .set_active_constraints(&decision_id, goal.active_constraint_ids());

            let result = self
                .execute_with_retry(graph, &node_impl, &ctx, &decision_id)
                .await?;

            state.total_tokens += result.tokens_used;
            state.total_latency_ms += result.latency_ms;

            if !result.success {
                // Out of retries. Record the failure and still fall through to
                // next-node selection, so an on_failure edge can handle it.
                self.runtime.report_problem(
                    Severity::Critical,
                    format!(
                        "Node {current} failed: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    ),
                    None,
                );
            }

            // Pause handling must precede next-node selection: pause nodes may
            // lawfully have no outgoing edges. The node a resumed session
            // re-enters at has already had its pause.
            let resumed_here = state.steps == 1 && resume_skip.as_deref() == Some(current.as_str());
            if graph.pause_nodes.contains(&current) && !resumed_here {
                let snapshot = memory.read_all();
                let session_state = SessionState {
                    paused_at: current.clone(),
                    resume_from: format!("{current}{RESUME_SUFFIX}"),
                    memory: snapshot.clone(),
                    next_node: None,
                };
                info!(node = %current, "paused for human input, session state saved");
                let run = self.runtime.pause_run(
                    Some(snapshot.clone()),
                    format!("Paused at {} after {} steps", node_spec.name, state.steps),
                )?;
                return Ok(Some(ExecutionResult {
                    success: true,
                    output: snapshot,
                    error: None,
                    steps_executed: state.steps,
                    total_tokens: state.total_tokens,
                    total_latency_ms: state.total_latency_ms,
                    path: state.path.clone(),
                    paused_at: Some(current),
                    session_state: Some(session_state),
                    run_id: Some(run.id),
                }));
            }

            if graph.terminal_nodes.contains(&current) {
                debug!(node = %current, "reached terminal node");
                break;
            }

            if let Some(next) = result.next_node {
                debug!(from = %current, to = %next, "router directed");
                current = next;
                continue;
            }

            match self.follow_edges(graph, goal, &current, &result, memory)? {
                Some(edge) => {
                    debug!(from = %current, to = %edge.target, "edge selected");
                    if edge.condition == EdgeCondition::OnFailure {
                        // Taking a failure edge is itself a recovery choice;
                        // make it visible in the decision trail.
                        let decision_id = self.runtime.decide(
                            &current,
                            &format!("Recover from failure of node: {}", node_spec.name),
                            vec![DecisionOption::new(
                                edge.id.clone(),
                                format!("Follow on_failure edge to {}", edge.target),
                            )],
                            &edge.id,
                            "Node exhausted its retries; a failure edge is declared",
                            BTreeMap::new(),
                            DecisionType::Recovery,
                        )?;
                        self.runtime.record_outcome(
                            &decision_id,
                            Outcome::success(
                                serde_json::json!({ "next_node": edge.target }),
                                0,
                                0,
                            ),
                        )?;
                    }
                    current = edge.target;
                }
                None => {
                    debug!(node = %current, "no matching edge, ending execution");
                    break;
                }
            }
        }

        Ok(None)
    }

    /// Executes a node with the per-node retry budget. Failed attempts before
    /// the last one land in the decision's audit trail; the final attempt
    /// (success or failure) becomes the decision's single outcome.
    async fn execute_with_retry(
        &self,
        graph: &GraphSpec,
        node_impl: &Arc<dyn NodeImpl>,
        ctx: &NodeContext,
        decision_id: &str,
    ) -> Result<NodeResult, EngineError> {
        let max_attempts = graph.max_retries_per_node.max(1);
        let mut ctx = ctx.clone();

        for attempt in 1..=max_attempts {
            ctx.attempt = attempt;
            let start = Instant::now();
            let mut result = node_impl.execute(&ctx).await;
            if result.latency_ms == 0 {
                result.latency_ms = start.elapsed().as_millis() as u64;
            }

            if result.success {
                self.runtime.record_outcome(
                    decision_id,
                    Outcome::success(
                        Value::Object(
                            result
                                .output
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect(),
                        ),
                        result.tokens_used,
                        result.latency_ms,
                    ),
                )?;
                return Ok(result);
            }

            let error = result.error.clone().unwrap_or_else(|| "unknown error".into());
            if attempt < max_attempts {
                warn!(node = %ctx.node_id, attempt, %error, "node failed, retrying");
                self.runtime.record_attempt(
                    decision_id,
                    Outcome::failure(error, result.tokens_used, result.latency_ms),
                )?;
                continue;
            }

            self.runtime.record_outcome(
                decision_id,
                Outcome::failure(error, result.tokens_used, result.latency_ms),
            )?;
            return Ok(result);
        }

        unreachable!("retry loop always returns")
    }

    fn build_context(&self, node_spec: &NodeSpec, memory: &SharedMemory, goal: &Goal) -> NodeContext {
        let available_tools = self
            .tools
            .iter()
            .filter(|t| node_spec.tools.iter().any(|name| name == &t.name))
            .cloned()
            .collect();
        NodeContext {
            node_id: node_spec.id.clone(),
            spec: node_spec.clone(),
            memory: memory.with_permissions(node_spec.input_keys.clone(), node_spec.output_keys.clone()),
            goal: goal.clone(),
            goal_context: goal.to_prompt_context(),
            available_tools,
            attempt: 1,
        }
    }

    /// Registry first, then the built-in for the node's type.
    fn node_implementation(&self, spec: &NodeSpec) -> Result<Arc<dyn NodeImpl>, EngineError> {
        if let Some(node) = self.node_registry.get(&spec.id) {
            return Ok(Arc::clone(node));
        }
        match spec.node_type {
            NodeType::LlmGenerate => {
                let llm = self.require_llm(spec)?;
                Ok(Arc::new(LlmNode::new(llm)))
            }
            NodeType::LlmToolUse => {
                let llm = self.require_llm(spec)?;
                let executor = self.tool_executor.clone().ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "node '{}' needs a tool executor but none is configured",
                        spec.id
                    ))
                })?;
                Ok(Arc::new(LlmNode::with_tool_executor(llm, executor)))
            }
            NodeType::Router => Ok(Arc::new(RouterNode::new(self.llm.clone()))),
            NodeType::Function => Err(EngineError::MissingFunction(format!(
                "function node '{}' is not registered",
                spec.id
            ))),
        }
    }

    fn require_llm(&self, spec: &NodeSpec) -> Result<Arc<dyn LlmProvider>, EngineError> {
        self.llm.clone().ok_or_else(|| {
            EngineError::Configuration(format!(
                "node '{}' needs an LLM provider but none is configured",
                spec.id
            ))
        })
    }

    /// First matching edge in priority-then-declaration order wins; its input
    /// mapping is applied to memory.
    fn follow_edges(
        &self,
        graph: &GraphSpec,
        goal: &Goal,
        current: &str,
        result: &NodeResult,
        memory: &SharedMemory,
    ) -> Result<Option<EdgeSpec>, EngineError> {
        let snapshot = memory.read_all();
        for edge in graph.outgoing_edges(current) {
            if edge.should_traverse(result.success, &result.output, &snapshot, goal, &self.sandbox)? {
                for (key, value) in edge.map_inputs(&result.output, &snapshot) {
                    memory.write(key, value);
                }
                return Ok(Some(edge.clone()));
            }
        }
        Ok(None)
    }
}
