//! Goal: the contract an agent is held to.
//!
//! A goal names what success means (weighted, measurable criteria) and what
//! must never happen (hard/soft constraints). It is immutable once a run
//! begins; the executor only reads it to build prompt context and to expose
//! it to conditional-edge predicates.

use serde::{Deserialize, Serialize};

/// One measurable success criterion of a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    /// Stable identifier, referenced by generated tests.
    pub id: String,
    pub description: String,
    /// What is measured (e.g. "accuracy", "latency_ms").
    pub metric: String,
    /// Target value for the metric, as free-form JSON (number, string, bool).
    pub target: serde_json::Value,
    /// Relative weight in [0, 1].
    pub weight: f64,
}

/// How strictly a constraint binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintSeverity {
    /// Violation fails the run.
    Hard,
    /// Violation is reported but tolerated.
    Soft,
}

/// A constraint the agent must honour while pursuing the goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    pub description: String,
    pub severity: ConstraintSeverity,
    /// Category such as "safety", "format", "cost".
    pub category: String,
    /// Optional machine-checkable expression over the run's memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// The contract the agent is held to: success criteria plus constraints.
///
/// **Interaction**: read by `GraphExecutor` (prompt context, edge predicates)
/// and referenced by id from every `Run`. Runs never embed the goal itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Goal {
    /// Minimal goal with no criteria or constraints (tests, ad-hoc runs).
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            success_criteria: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Renders the goal as prompt context for LLM nodes.
    ///
    /// Lists the description, then criteria with metric/target, then
    /// constraints with severity. Stable ordering so prompts are deterministic.
    pub fn to_prompt_context(&self) -> String {
        let mut out = format!("Goal: {}\n{}\n", self.name, self.description);
        if !self.success_criteria.is_empty() {
            out.push_str("\nSuccess criteria:\n");
            for c in &self.success_criteria {
                out.push_str(&format!(
                    "- {} ({}: {}, weight {})\n",
                    c.description, c.metric, c.target, c.weight
                ));
            }
        }
        if !self.constraints.is_empty() {
            out.push_str("\nConstraints:\n");
            for c in &self.constraints {
                let sev = match c.severity {
                    ConstraintSeverity::Hard => "hard",
                    ConstraintSeverity::Soft => "soft",
                };
                out.push_str(&format!("- [{}/{}] {}\n", sev, c.category, c.description));
            }
        }
        out
    }

    /// Ids of the currently active constraints (all of them; the engine does
    /// not yet scope constraints per node).
    pub fn active_constraint_ids(&self) -> Vec<String> {
        self.constraints.iter().map(|c| c.id.clone()).collect()
    }
}
