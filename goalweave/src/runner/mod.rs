//! Agent runner: loads an exported agent and executes it.
//!
//! The export directory carries `agent.json` (agent identity, graph, goal,
//! required tools, metadata) and optionally `mcp_servers.json`. The runner
//! connects one client per configured tool server, bridges node tool calls
//! to whichever client advertises the tool, and owns the runtime + executor
//! for its runs. It is also the agent the test harness factories construct,
//! one runner per harness worker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::goal::Goal;
use crate::graph::{
    ExecutionResult, GraphExecutor, GraphSpec, NodeContext, NodeImpl, SessionState, ToolExecutor,
};
use crate::llm::{LlmProvider, Tool, ToolUse};
use crate::mcp::{McpClient, McpServersFile};
use crate::runtime::Runtime;
use crate::storage::FileStorage;
use crate::testing::{Agent, AgentFactory};

/// Identity block of `agent.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

/// Metadata block of `agent.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub created_at: DateTime<Utc>,
    pub node_count: usize,
    pub edge_count: usize,
}

/// The full agent specification as exported to `agent.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub agent: AgentInfo,
    pub graph: GraphSpec,
    pub goal: Goal,
    #[serde(default)]
    pub required_tools: Vec<String>,
    pub metadata: AgentMetadata,
}

impl AgentDefinition {
    /// Reads `agent.json` from an export directory.
    pub fn load(dir: &Path) -> Result<Self, EngineError> {
        let path = dir.join("agent.json");
        let text = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Writes `agent.json` back to an export directory (round-trip capable).
    pub fn save(&self, dir: &Path) -> Result<(), EngineError> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("agent.json"), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Builds a definition from its parts, filling the metadata block.
    pub fn new(agent: AgentInfo, graph: GraphSpec, goal: Goal, required_tools: Vec<String>) -> Self {
        let metadata = AgentMetadata {
            created_at: Utc::now(),
            node_count: graph.nodes.len(),
            edge_count: graph.edges.len(),
        };
        Self {
            agent,
            graph,
            goal,
            required_tools,
            metadata,
        }
    }
}

/// Routes a tool call to whichever connected client advertises the tool.
struct MultiClientExecutor {
    clients: Vec<Arc<McpClient>>,
}

#[async_trait]
impl ToolExecutor for MultiClientExecutor {
    async fn execute(&self, tool_use: &ToolUse) -> Result<Value, EngineError> {
        for client in &self.clients {
            if client.has_tool(&tool_use.name) {
                return client.call_tool(&tool_use.name, tool_use.input.clone()).await;
            }
        }
        Err(EngineError::MissingTool(tool_use.name.clone()))
    }
}

/// A loaded agent, ready to run.
pub struct AgentRunner {
    definition: AgentDefinition,
    clients: Vec<Arc<McpClient>>,
    executor: GraphExecutor,
}

impl AgentRunner {
    /// Loads an exported agent from a directory and connects its tool
    /// servers. A server that fails to connect fails the load (connection
    /// failures during init are fatal).
    pub async fn load(
        dir: impl Into<PathBuf>,
        llm: Option<Arc<dyn LlmProvider>>,
        storage: Option<Arc<FileStorage>>,
    ) -> Result<Self, EngineError> {
        let dir = dir.into();
        let definition = AgentDefinition::load(&dir)?;

        let mut clients = Vec::new();
        let servers_path = dir.join("mcp_servers.json");
        if servers_path.exists() {
            let text = std::fs::read_to_string(&servers_path)?;
            let file: McpServersFile = serde_json::from_str(&text)?;
            for config in file.servers {
                let name = config.name.clone();
                let client = McpClient::connect(config).await?;
                info!(server = %name, "tool server connected for agent");
                clients.push(Arc::new(client));
            }
        }

        Self::from_parts(definition, clients, llm, storage)
    }

    /// Builds a runner from an in-memory definition and already-connected
    /// clients (tests, embedding).
    pub fn from_parts(
        definition: AgentDefinition,
        clients: Vec<Arc<McpClient>>,
        llm: Option<Arc<dyn LlmProvider>>,
        storage: Option<Arc<FileStorage>>,
    ) -> Result<Self, EngineError> {
        let available: Vec<Tool> = clients
            .iter()
            .flat_map(|c| c.tools().into_iter().map(|t| t.to_llm_tool()))
            .collect();
        for required in &definition.required_tools {
            if !available.iter().any(|t| &t.name == required) {
                warn!(tool = %required, "required tool not advertised by any connected server");
            }
        }

        let runtime = Arc::new(match storage {
            Some(storage) => Runtime::new(storage),
            None => Runtime::unpersisted(),
        });
        let mut executor = GraphExecutor::new(runtime).with_tools(available);
        if let Some(llm) = llm {
            executor = executor.with_llm(llm);
        }
        if !clients.is_empty() {
            executor = executor.with_tool_executor(Arc::new(MultiClientExecutor {
                clients: clients.clone(),
            }));
        }

        Ok(Self {
            definition,
            clients,
            executor,
        })
    }

    /// The loaded definition.
    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    /// Registers a custom node implementation (function nodes, overrides).
    pub fn register_node(&mut self, node_id: impl Into<String>, node: Arc<dyn NodeImpl>) {
        self.executor.register_node(node_id, node);
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
        self.executor.register_function(node_id, func);
    }

    /// Executes the agent's graph against an input payload.
    pub async fn run(&self, input: BTreeMap<String, Value>) -> ExecutionResult {
        self.executor
            .execute(&self.definition.graph, &self.definition.goal, input, None)
            .await
    }

    /// Resumes a paused run with new input (e.g. a user's answer).
    pub async fn resume(
        &self,
        session_state: SessionState,
        input: BTreeMap<String, Value>,
    ) -> ExecutionResult {
        self.executor
            .execute(
                &self.definition.graph,
                &self.definition.goal,
                input,
                Some(session_state),
            )
            .await
    }

    /// Disconnects every tool server client.
    pub async fn shutdown(self) {
        for client in self.clients {
            if let Ok(client) = Arc::try_unwrap(client).map_err(|_| ()) {
                client.disconnect().await;
            }
        }
    }
}

#[async_trait]
impl Agent for AgentRunner {
    async fn run(&self, input: Value) -> Result<Value, EngineError> {
        let input_map: BTreeMap<String, Value> = match input {
            Value::Object(map) => map.into_iter().collect(),
            Value::Null => BTreeMap::new(),
            other => [("input".to_string(), other)].into_iter().collect(),
        };
        let result = AgentRunner::run(self, input_map).await;
        if result.success {
            Ok(Value::Object(result.output.into_iter().collect()))
        } else {
            Err(EngineError::RuntimeException(
                result.error.unwrap_or_else(|| "agent execution failed".into()),
            ))
        }
    }
}

/// Factory the test harness uses: loads one fresh runner per worker.
pub struct AgentRunnerFactory {
    dir: PathBuf,
    llm: Option<Arc<dyn LlmProvider>>,
    storage: Option<Arc<FileStorage>>,
}

impl AgentRunnerFactory {
    pub fn new(
        dir: impl Into<PathBuf>,
        llm: Option<Arc<dyn LlmProvider>>,
        storage: Option<Arc<FileStorage>>,
    ) -> Self {
        Self {
            dir: dir.into(),
            llm,
            storage,
        }
    }
}

#[async_trait]
impl AgentFactory for AgentRunnerFactory {
    async fn create(&self) -> Result<Box<dyn Agent>, EngineError> {
        let runner =
            AgentRunner::load(self.dir.clone(), self.llm.clone(), self.storage.clone()).await?;
        Ok(Box::new(runner))
    }
}
