//! Goalweave: a goal-driven agent execution runtime.
//!
//! An agent is a declarative specification (a [`goal::Goal`], a graph of
//! [`graph::NodeSpec`]s wired by [`graph::EdgeSpec`]s, optional external tool
//! servers) executed by [`graph::GraphExecutor`] against an abstracted LLM
//! backend ([`llm::LlmProvider`]). Every choice the agent makes is recorded
//! through [`runtime::Runtime`] as an append-only decision trail, persisted
//! by [`storage::FileStorage`], and analysed after the fact by
//! [`builder::BuilderQuery`]. Completed agents are evaluated in parallel by
//! [`testing::ParallelTestRunner`].
//!
//! # A minimal run
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use goalweave::goal::Goal;
//! use goalweave::graph::{EdgeSpec, GraphExecutor, GraphSpec, NodeSpec, NodeType};
//! use goalweave::runtime::Runtime;
//!
//! # async fn demo(graph: GraphSpec, goal: Goal) {
//! let runtime = Arc::new(Runtime::unpersisted());
//! let mut executor = GraphExecutor::new(runtime);
//! executor.register_function("a", |ctx| {
//!     let x = ctx.memory.read("x")?.and_then(|v| v.as_i64()).unwrap_or(0);
//!     Ok([("y".to_string(), serde_json::json!(x + 1))].into_iter().collect())
//! });
//! let result = executor
//!     .execute(&graph, &goal, BTreeMap::new(), None)
//!     .await;
//! assert!(result.success);
//! # }
//! ```

pub mod builder;
pub mod error;
pub mod goal;
pub mod graph;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod runner;
pub mod runtime;
pub mod storage;
pub mod testing;

pub use error::EngineError;
