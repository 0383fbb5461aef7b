//! Edges and the graph specification.
//!
//! Edges decide where execution goes after a node completes: `always`,
//! `on_success`, `on_failure`, or a `conditional` predicate evaluated in the
//! sandbox over `{memory, result, output, goal}`. `GraphSpec` ties nodes,
//! edges, entry/terminal/pause sets and the step/retry budgets together, and
//! validates the graph invariants before any side effect.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::goal::Goal;

use super::node::{NodeSpec, NodeType};
use super::sandbox::CodeSandbox;

/// When an edge may be traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Always,
    OnSuccess,
    OnFailure,
    /// Predicate expression, evaluated in the sandbox.
    Conditional,
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: EdgeCondition,
    /// Predicate over `{memory, result, output, goal}` (conditional edges).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    /// Higher priority wins on ties; declaration order breaks remaining ties.
    #[serde(default)]
    pub priority: i32,
    /// Source-output key → target-input key, applied to memory on traversal.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
}

impl EdgeSpec {
    /// Unconditional edge.
    pub fn always(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(id, source, target, EdgeCondition::Always)
    }

    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition,
            predicate: None,
            priority: 0,
            input_mapping: BTreeMap::new(),
        }
    }

    /// Set the priority (builder).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the predicate expression (builder; implies `Conditional`).
    pub fn with_predicate(mut self, predicate: impl Into<String>) -> Self {
        self.condition = EdgeCondition::Conditional;
        self.predicate = Some(predicate.into());
        self
    }

    /// Decides whether this edge fires for the given source result.
    ///
    /// The success flag alone drives `on_success`/`on_failure`; a successful
    /// node carrying an `error` field in its output is still a success here.
    pub fn should_traverse(
        &self,
        source_success: bool,
        source_output: &BTreeMap<String, Value>,
        memory: &BTreeMap<String, Value>,
        goal: &Goal,
        sandbox: &CodeSandbox,
    ) -> Result<bool, EngineError> {
        match self.condition {
            EdgeCondition::Always => Ok(true),
            EdgeCondition::OnSuccess => Ok(source_success),
            EdgeCondition::OnFailure => Ok(!source_success),
            EdgeCondition::Conditional => {
                let Some(predicate) = &self.predicate else {
                    return Ok(false);
                };
                let output = Value::Object(
                    source_output
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                );
                let bindings: BTreeMap<String, Value> = [
                    (
                        "memory".to_string(),
                        Value::Object(memory.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                    ),
                    ("result".to_string(), output.clone()),
                    ("output".to_string(), output),
                    ("goal".to_string(), serde_json::to_value(goal)?),
                ]
                .into_iter()
                .collect();
                sandbox.eval_predicate(predicate, &bindings)
            }
        }
    }

    /// Applies the input mapping: for each `src → tgt`, copies
    /// `source_output[src]` (falling back to `memory[src]`) into the result.
    pub fn map_inputs(
        &self,
        source_output: &BTreeMap<String, Value>,
        memory: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let mut mapped = BTreeMap::new();
        for (src, tgt) in &self.input_mapping {
            if let Some(value) = source_output.get(src).or_else(|| memory.get(src)) {
                mapped.insert(tgt.clone(), value.clone());
            }
        }
        mapped
    }
}

/// Suffix that names a pause node's resume entry point.
pub const RESUME_SUFFIX: &str = "_resume";

/// The complete graph: nodes, edges, entry/terminal/pause sets, budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub id: String,
    pub goal_id: String,
    #[serde(default)]
    pub version: String,
    pub entry_node: String,
    #[serde(default)]
    pub terminal_nodes: BTreeSet<String>,
    #[serde(default)]
    pub pause_nodes: BTreeSet<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries_per_node: u32,
}

fn default_max_steps() -> u32 {
    50
}

fn default_max_retries() -> u32 {
    2
}

impl GraphSpec {
    /// Looks up a node by id.
    pub fn get_node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Outgoing edges of a node, priority-descending then declaration order.
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&EdgeSpec> {
        let mut edges: Vec<(usize, &EdgeSpec)> = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.source == node_id)
            .collect();
        edges.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ia.cmp(ib)));
        edges.into_iter().map(|(_, e)| e).collect()
    }

    /// Entry point for a fresh run or a resume.
    ///
    /// Resuming prefers the pause node's dedicated resume entry
    /// (`<paused>_resume`) when the graph declares one, else re-enters at the
    /// paused node itself.
    pub fn entry_point(&self, resume_from: Option<&str>) -> String {
        if let Some(resume) = resume_from {
            if self.get_node(resume).is_some() {
                return resume.to_string();
            }
            if let Some(paused) = resume.strip_suffix(RESUME_SUFFIX) {
                if self.get_node(paused).is_some() {
                    return paused.to_string();
                }
            }
        }
        self.entry_node.clone()
    }

    /// Validates the graph invariants. Empty vec means valid.
    ///
    /// Checks: entry exists; edge endpoints exist; every non-terminal,
    /// non-pause node has an outgoing edge; `llm_tool_use` declares a tool;
    /// routers declare routes and route targets exist; no node is unreachable
    /// from the entry plus the resume entries.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();

        if !ids.contains(self.entry_node.as_str()) {
            errors.push(format!("entry node '{}' does not exist", self.entry_node));
        }
        for terminal in &self.terminal_nodes {
            if !ids.contains(terminal.as_str()) {
                errors.push(format!("terminal node '{terminal}' does not exist"));
            }
        }
        for pause in &self.pause_nodes {
            if !ids.contains(pause.as_str()) {
                errors.push(format!("pause node '{pause}' does not exist"));
            }
        }
        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) {
                errors.push(format!("edge '{}' has unknown source '{}'", edge.id, edge.source));
            }
            if !ids.contains(edge.target.as_str()) {
                errors.push(format!("edge '{}' has unknown target '{}'", edge.id, edge.target));
            }
            if edge.condition == EdgeCondition::Conditional && edge.predicate.is_none() {
                errors.push(format!("conditional edge '{}' has no predicate", edge.id));
            }
        }

        for node in &self.nodes {
            let has_outgoing = self.edges.iter().any(|e| e.source == node.id)
                || (node.node_type == NodeType::Router && !node.routes.is_empty());
            if !has_outgoing
                && !self.terminal_nodes.contains(&node.id)
                && !self.pause_nodes.contains(&node.id)
            {
                errors.push(format!(
                    "node '{}' is neither terminal nor paused but has no outgoing edge",
                    node.id
                ));
            }
            match node.node_type {
                NodeType::LlmToolUse if node.tools.is_empty() => {
                    errors.push(format!("llm_tool_use node '{}' declares no tools", node.id));
                }
                NodeType::Router => {
                    if node.routes.is_empty() {
                        errors.push(format!("router node '{}' declares no routes", node.id));
                    }
                    for (label, target) in &node.routes {
                        if !ids.contains(target.as_str()) {
                            errors.push(format!(
                                "router '{}' route '{label}' targets unknown node '{target}'",
                                node.id
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        // Reachability from the primary entry plus resume entries.
        let mut entries: Vec<&str> = vec![self.entry_node.as_str()];
        for pause in &self.pause_nodes {
            entries.push(pause.as_str());
            let resume = format!("{pause}{RESUME_SUFFIX}");
            if let Some(node) = self.nodes.iter().find(|n| n.id == resume) {
                entries.push(node.id.as_str());
            }
        }
        let reachable = self.reachable_from(&entries);
        for node in &self.nodes {
            if !reachable.contains(node.id.as_str()) {
                errors.push(format!("node '{}' is unreachable from the entry", node.id));
            }
        }

        errors
    }

    fn reachable_from<'a>(&'a self, entries: &[&'a str]) -> HashSet<&'a str> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = entries
            .iter()
            .copied()
            .filter(|id| self.get_node(id).is_some())
            .collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for edge in self.edges.iter().filter(|e| e.source == id) {
                stack.push(edge.target.as_str());
            }
            if let Some(node) = self.get_node(id) {
                for target in node.routes.values() {
                    stack.push(target.as_str());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, node_type: NodeType) -> NodeSpec {
        NodeSpec {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            node_type,
            input_keys: vec![],
            output_keys: vec![],
            system_prompt: None,
            tools: vec![],
            routes: BTreeMap::new(),
        }
    }

    fn linear_graph() -> GraphSpec {
        GraphSpec {
            id: "graph".into(),
            goal_id: "g1".into(),
            version: "1".into(),
            entry_node: "a".into(),
            terminal_nodes: ["b".to_string()].into_iter().collect(),
            pause_nodes: BTreeSet::new(),
            nodes: vec![node("a", NodeType::Function), node("b", NodeType::Function)],
            edges: vec![EdgeSpec::always("e1", "a", "b")],
            max_steps: 10,
            max_retries_per_node: 2,
        }
    }

    #[test]
    fn valid_linear_graph_passes() {
        assert!(linear_graph().validate().is_empty());
    }

    #[test]
    fn dangling_edge_and_missing_entry_are_reported() {
        let mut graph = linear_graph();
        graph.entry_node = "zz".into();
        graph.edges.push(EdgeSpec::always("e2", "b", "ghost"));
        let errors = graph.validate();
        assert!(errors.iter().any(|e| e.contains("entry node")));
        assert!(errors.iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn non_terminal_node_without_outgoing_edge_is_invalid() {
        let mut graph = linear_graph();
        graph.terminal_nodes.clear();
        let errors = graph.validate();
        assert!(errors.iter().any(|e| e.contains("no outgoing edge")), "{errors:?}");
    }

    #[test]
    fn unreachable_node_is_reported() {
        let mut graph = linear_graph();
        graph.nodes.push(node("island", NodeType::Function));
        graph.terminal_nodes.insert("island".into());
        let errors = graph.validate();
        assert!(errors.iter().any(|e| e.contains("unreachable")), "{errors:?}");
    }

    #[test]
    fn router_routes_must_target_existing_nodes() {
        let mut graph = linear_graph();
        let mut router = node("r", NodeType::Router);
        router.routes.insert("x".into(), "nowhere".into());
        graph.nodes.push(router);
        graph.edges.push(EdgeSpec::always("e3", "b", "r"));
        graph.terminal_nodes.clear();
        graph.terminal_nodes.insert("r".into());
        let errors = graph.validate();
        assert!(errors.iter().any(|e| e.contains("unknown node 'nowhere'")), "{errors:?}");
    }

    /// **Scenario**: resume entry resolution: dedicated `_resume` node when
    /// present, else the paused node itself, else the primary entry.
    #[test]
    fn entry_point_prefers_resume_nodes() {
        let mut graph = linear_graph();
        assert_eq!(graph.entry_point(None), "a");
        assert_eq!(graph.entry_point(Some("b_resume")), "b");

        graph.nodes.push(node("b_resume", NodeType::Function));
        graph.edges.push(EdgeSpec::always("e4", "b_resume", "b"));
        assert_eq!(graph.entry_point(Some("b_resume")), "b_resume");
        assert_eq!(graph.entry_point(Some("ghost_resume")), "a");
    }

    #[test]
    fn on_success_and_on_failure_follow_the_flag() {
        let sandbox = CodeSandbox::new();
        let goal = Goal::new("g", "g", "g");
        let success = EdgeSpec::new("e", "a", "b", EdgeCondition::OnSuccess);
        let failure = EdgeSpec::new("e", "a", "b", EdgeCondition::OnFailure);
        let empty = BTreeMap::new();
        assert!(success.should_traverse(true, &empty, &empty, &goal, &sandbox).unwrap());
        assert!(!success.should_traverse(false, &empty, &empty, &goal, &sandbox).unwrap());
        assert!(failure.should_traverse(false, &empty, &empty, &goal, &sandbox).unwrap());
        assert!(!failure.should_traverse(true, &empty, &empty, &goal, &sandbox).unwrap());
    }

    #[test]
    fn conditional_edge_evaluates_predicate_over_memory_and_result() {
        let sandbox = CodeSandbox::new();
        let goal = Goal::new("g", "g", "g");
        let edge = EdgeSpec::new("e", "a", "b", EdgeCondition::Always)
            .with_predicate("memory.count > 2 and result.status == 'ok'");
        let memory: BTreeMap<String, Value> =
            [("count".to_string(), json!(3))].into_iter().collect();
        let output: BTreeMap<String, Value> =
            [("status".to_string(), json!("ok"))].into_iter().collect();
        assert!(edge.should_traverse(true, &output, &memory, &goal, &sandbox).unwrap());

        let memory: BTreeMap<String, Value> =
            [("count".to_string(), json!(1))].into_iter().collect();
        assert!(!edge.should_traverse(true, &output, &memory, &goal, &sandbox).unwrap());
    }

    #[test]
    fn map_inputs_prefers_source_output_over_memory() {
        let mut edge = EdgeSpec::always("e", "a", "b");
        edge.input_mapping.insert("y".into(), "z".into());
        edge.input_mapping.insert("only_in_memory".into(), "w".into());

        let output: BTreeMap<String, Value> = [("y".to_string(), json!(4))].into_iter().collect();
        let memory: BTreeMap<String, Value> = [
            ("y".to_string(), json!(999)),
            ("only_in_memory".to_string(), json!("m")),
        ]
        .into_iter()
        .collect();

        let mapped = edge.map_inputs(&output, &memory);
        assert_eq!(mapped.get("z"), Some(&json!(4)));
        assert_eq!(mapped.get("w"), Some(&json!("m")));
    }

    #[test]
    fn outgoing_edges_order_by_priority_then_declaration() {
        let mut graph = linear_graph();
        graph.nodes.push(node("c", NodeType::Function));
        graph.terminal_nodes.insert("c".into());
        graph.edges = vec![
            EdgeSpec::always("low", "a", "b"),
            EdgeSpec::always("high", "a", "c").with_priority(5),
            EdgeSpec::always("mid", "a", "b").with_priority(5),
        ];
        let order: Vec<&str> = graph.outgoing_edges("a").iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }
}
