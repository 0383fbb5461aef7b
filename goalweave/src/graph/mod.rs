//! The agent graph: nodes, edges, plans, the executor, and the sandbox.

mod edge;
mod executor;
mod node;
mod plan;
mod sandbox;
mod worker;

pub use edge::{EdgeCondition, EdgeSpec, GraphSpec, RESUME_SUFFIX};
pub use executor::{ExecutionResult, GraphExecutor, SessionState};
pub use node::{
    FunctionNode, LlmNode, NodeContext, NodeFn, NodeImpl, NodeResult, NodeSpec, NodeType,
    RouterNode, ToolExecutor,
};
pub use plan::{ActionSpec, ActionType, PlanStep};
pub use sandbox::{CodeSandbox, SandboxResult};
pub use worker::{
    parse_llm_json_response, RegisteredFn, StepExecutionResult, SubGraphExecutor, Worker,
};
