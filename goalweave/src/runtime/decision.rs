//! Decisions and problems: the append-only record of what the agent chose.
//!
//! A `Decision` captures one choice point: the intent, the options that were
//! on the table, the chosen one, the reasoning, and eventually exactly one
//! final `Outcome`. Failed attempts that were retried before the final
//! outcome are kept in the decision's audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Kind of choice point that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    /// The executor ran a graph node.
    NodeExecution,
    /// The worker dispatched a plan step's action.
    ActionDispatch,
    /// A router selected among its declared routes.
    Routing,
    /// The engine chose a recovery path (retry, on_failure edge).
    Recovery,
}

impl DecisionType {
    /// Snake-case name, as persisted and grouped on by the builder query.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::NodeExecution => "node_execution",
            DecisionType::ActionDispatch => "action_dispatch",
            DecisionType::Routing => "routing",
            DecisionType::Recovery => "recovery",
        }
    }
}

/// One option that was considered at a choice point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    pub description: String,
    /// Free-form payload (e.g. the action spec, the route target).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl DecisionOption {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            payload: Value::Null,
        }
    }

    /// Attach a payload (builder).
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Result of acting on a decision: success flag, payload or error, cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Result payload on success.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tokens_used: u64,
    pub latency_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

impl Outcome {
    /// Successful outcome with a result payload.
    pub fn success(result: Value, tokens_used: u64, latency_ms: u64) -> Self {
        Self {
            success: true,
            result,
            error: None,
            tokens_used,
            latency_ms,
            recorded_at: Utc::now(),
        }
    }

    /// Failed outcome with an error message.
    pub fn failure(error: impl Into<String>, tokens_used: u64, latency_ms: u64) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error.into()),
            tokens_used,
            latency_ms,
            recorded_at: Utc::now(),
        }
    }
}

/// A logged agent choice, append-only within a run.
///
/// **Interaction**: allocated by `Runtime::decide`; finalised once by
/// `Runtime::record_outcome`; read back by `BuilderQuery`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    /// Free-text statement of what this decision is for.
    pub intent: String,
    pub options: Vec<DecisionOption>,
    pub chosen_option_id: String,
    pub reasoning: String,
    /// Constraint ids active at the moment of decision.
    #[serde(default)]
    pub active_constraints: Vec<String>,
    /// Snapshot of the inputs visible when deciding.
    #[serde(default)]
    pub input_context: BTreeMap<String, Value>,
    pub decision_type: DecisionType,
    /// Final outcome; `None` only while in flight or when the run paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Non-final failed attempts retried before the outcome (audit trail).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Outcome>,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    /// True when the final outcome has been recorded.
    pub fn has_outcome(&self) -> bool {
        self.outcome.is_some()
    }

    /// True when the final outcome exists and succeeded.
    pub fn was_successful(&self) -> bool {
        self.outcome.as_ref().map(|o| o.success).unwrap_or(false)
    }

    /// The option that was chosen, when it is among `options`.
    pub fn chosen_option(&self) -> Option<&DecisionOption> {
        self.options.iter().find(|o| o.id == self.chosen_option_id)
    }

    /// One-line rendering for analysis surfaces (decision traces, failure
    /// chains): intent, chosen option, and outcome marker.
    pub fn summary_for_builder(&self) -> String {
        let marker = match &self.outcome {
            Some(o) if o.success => "✓".to_string(),
            Some(o) => format!("✗ {}", o.error.as_deref().unwrap_or("failed")),
            None => "…".to_string(),
        };
        format!(
            "[{}] {} → {} {}",
            self.node_id, self.intent, self.chosen_option_id, marker
        )
    }
}

/// Severity of a reported problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// A warning or failure note attached to a run. Problems are informative;
/// they never fail a run by themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    pub reported_at: DateTime<Utc>,
}
