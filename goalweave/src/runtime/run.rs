//! Run: one graph execution, from `pending` to a terminal status.
//!
//! The live `Run` is owned by `Runtime` for the duration of execution and
//! handed to storage on termination; after that it is frozen. `RunSummary`
//! is the listing projection (no decisions, no problems).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::decision::{Decision, Problem};

/// Lifecycle status of a run.
///
/// `Paused` is distinct from `Completed`: a paused run is resumable and its
/// decisions may lawfully lack outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "paused" => Ok(RunStatus::Paused),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Aggregate metrics over a run's decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Node ids in traversal order (the executor's path).
    #[serde(default)]
    pub nodes_executed: Vec<String>,
    /// Successful decisions over decisions with an outcome; 0 when none.
    pub success_rate: f64,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
}

/// A single graph execution with its full decision trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub goal_id: String,
    pub goal_description: String,
    pub status: RunStatus,
    #[serde(default)]
    pub input_data: BTreeMap<String, Value>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub problems: Vec<Problem>,
    /// Final output payload (memory snapshot on normal completion).
    #[serde(default)]
    pub output: BTreeMap<String, Value>,
    #[serde(default)]
    pub metrics: RunMetrics,
    /// Closing narrative ("Executed 3 steps through path: a -> b -> c").
    #[serde(default)]
    pub narrative: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Recomputes `metrics.success_rate` from the current decisions.
    pub fn recompute_success_rate(&mut self) {
        let with_outcome = self.decisions.iter().filter(|d| d.has_outcome()).count();
        let successful = self.decisions.iter().filter(|d| d.was_successful()).count();
        self.metrics.success_rate = if with_outcome == 0 {
            0.0
        } else {
            successful as f64 / with_outcome as f64
        };
    }

    /// Listing projection of this run.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            goal_id: self.goal_id.clone(),
            status: self.status,
            step_count: self.decisions.len(),
            success_rate: self.metrics.success_rate,
            narrative: self.narrative.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Projection of a run suitable for listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub goal_id: String,
    pub status: RunStatus,
    pub step_count: usize,
    pub success_rate: f64,
    pub narrative: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::decision::{DecisionOption, DecisionType, Outcome};
    use serde_json::json;

    fn run_with_outcomes(outcomes: &[Option<bool>]) -> Run {
        let decisions = outcomes
            .iter()
            .enumerate()
            .map(|(i, success)| Decision {
                id: format!("d{i}"),
                run_id: "r".into(),
                node_id: format!("n{i}"),
                intent: "step".into(),
                options: vec![DecisionOption::new("only", "only option")],
                chosen_option_id: "only".into(),
                reasoning: String::new(),
                active_constraints: vec![],
                input_context: Default::default(),
                decision_type: DecisionType::NodeExecution,
                outcome: success.map(|ok| {
                    if ok {
                        Outcome::success(json!(null), 0, 1)
                    } else {
                        Outcome::failure("boom", 0, 1)
                    }
                }),
                attempts: vec![],
                decided_at: Utc::now(),
            })
            .collect();
        Run {
            id: "r".into(),
            goal_id: "g".into(),
            goal_description: String::new(),
            status: RunStatus::Running,
            input_data: Default::default(),
            decisions,
            problems: vec![],
            output: Default::default(),
            metrics: RunMetrics::default(),
            narrative: String::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// **Scenario**: success rate counts only decisions with outcomes.
    #[test]
    fn success_rate_over_decisions_with_outcomes() {
        let mut run = run_with_outcomes(&[Some(true), Some(false), None]);
        run.recompute_success_rate();
        assert!((run.metrics.success_rate - 0.5).abs() < f64::EPSILON);
    }

    /// **Scenario**: success rate is reported as 0 when no decision has an outcome.
    #[test]
    fn success_rate_zero_when_no_outcomes() {
        let mut run = run_with_outcomes(&[None, None]);
        run.recompute_success_rate();
        assert_eq!(run.metrics.success_rate, 0.0);
    }

    #[test]
    fn summary_reflects_step_count_and_status() {
        let mut run = run_with_outcomes(&[Some(true)]);
        run.status = RunStatus::Completed;
        run.recompute_success_rate();
        let summary = run.summary();
        assert_eq!(summary.step_count, 1);
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.success_rate, 1.0);
    }

    #[test]
    fn run_status_parses_from_str() {
        assert_eq!("paused".parse::<RunStatus>().unwrap(), RunStatus::Paused);
        assert!("bogus".parse::<RunStatus>().is_err());
    }
}
