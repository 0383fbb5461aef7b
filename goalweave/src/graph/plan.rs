//! Plan steps: the unit of work the action dispatcher executes.
//!
//! A `PlanStep` names an `ActionSpec` (one of five kinds), its inputs (values
//! may be `$name` references into the current context), the outputs it is
//! expected to produce, and the steps it depends on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of action kinds the worker can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    LlmCall,
    ToolUse,
    SubGraph,
    Function,
    CodeExecution,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::LlmCall => "llm_call",
            ActionType::ToolUse => "tool_use",
            ActionType::SubGraph => "sub_graph",
            ActionType::Function => "function",
            ActionType::CodeExecution => "code_execution",
        }
    }
}

/// What a step does. Only the fields of its `action_type` are meaningful.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action_type: Option<ActionType>,
    /// Prompt for `llm_call`, with optional `{name}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_args: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub function_args: BTreeMap<String, Value>,
    /// Program body for `code_execution`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ActionSpec {
    /// Model-call action.
    pub fn llm_call(prompt: impl Into<String>) -> Self {
        Self {
            action_type: Some(ActionType::LlmCall),
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    /// External-tool action.
    pub fn tool_use(tool_name: impl Into<String>) -> Self {
        Self {
            action_type: Some(ActionType::ToolUse),
            tool_name: Some(tool_name.into()),
            ..Default::default()
        }
    }

    /// Sub-graph action.
    pub fn sub_graph(graph_id: impl Into<String>) -> Self {
        Self {
            action_type: Some(ActionType::SubGraph),
            graph_id: Some(graph_id.into()),
            ..Default::default()
        }
    }

    /// Registered-function action.
    pub fn function(function_name: impl Into<String>) -> Self {
        Self {
            action_type: Some(ActionType::Function),
            function_name: Some(function_name.into()),
            ..Default::default()
        }
    }

    /// Sandboxed-code action.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            action_type: Some(ActionType::CodeExecution),
            code: Some(code.into()),
            ..Default::default()
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub action: ActionSpec,
    /// Inputs; string values starting with `$` are context references.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    /// Ids of steps that must complete before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>, action: ActionSpec) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            action,
            inputs: BTreeMap::new(),
            expected_outputs: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Add one input (builder).
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_constructors_set_their_kind() {
        assert_eq!(ActionSpec::llm_call("hi").action_type, Some(ActionType::LlmCall));
        assert_eq!(ActionSpec::tool_use("echo").action_type, Some(ActionType::ToolUse));
        assert_eq!(ActionSpec::code("1 + 1").action_type, Some(ActionType::CodeExecution));
    }

    #[test]
    fn plan_step_round_trips_through_json() {
        let step = PlanStep::new("s1", "compute", ActionSpec::code("x + 1"))
            .with_input("x", json!("$seed"));
        let text = serde_json::to_string(&step).unwrap();
        let back: PlanStep = serde_json::from_str(&text).unwrap();
        assert_eq!(step, back);
    }
}
