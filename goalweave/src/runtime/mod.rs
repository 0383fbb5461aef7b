//! Runtime decision log: the single-writer façade around the current run.
//!
//! The executor opens a run, records decisions and problems through this
//! façade, and closes the run, at which point the frozen `Run` is flushed to
//! storage. Exactly one final outcome may be recorded per decision; retried
//! failures before the final outcome go to the decision's audit trail via
//! `record_attempt`.

mod decision;
mod run;

pub use decision::{Decision, DecisionOption, DecisionType, Outcome, Problem, Severity};
pub use run::{Run, RunMetrics, RunStatus, RunSummary};

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::storage::FileStorage;

/// Single-writer decision log for the run currently executing.
///
/// **Interaction**: owned by the host (one per executor/agent); shared with
/// the worker via `Arc`. Within one run all calls are sequential (spec'd
/// scheduling model), the inner mutex only makes sharing possible.
pub struct Runtime {
    storage: Option<Arc<FileStorage>>,
    current: Mutex<Option<Run>>,
}

impl Runtime {
    /// Runtime that flushes finished runs to the given storage.
    pub fn new(storage: Arc<FileStorage>) -> Self {
        Self {
            storage: Some(storage),
            current: Mutex::new(None),
        }
    }

    /// Runtime that keeps finished runs in memory only (tests, dry runs).
    pub fn unpersisted() -> Self {
        Self {
            storage: None,
            current: Mutex::new(None),
        }
    }

    /// Opens a run (`pending` → `running`). Fails when a run is already open.
    pub fn start_run(
        &self,
        goal_id: &str,
        goal_description: &str,
        input_data: BTreeMap<String, Value>,
    ) -> Result<String, EngineError> {
        let mut current = self.lock_current();
        if current.is_some() {
            return Err(EngineError::RuntimeException(
                "a run is already active on this runtime".into(),
            ));
        }
        let run_id = format!("run_{}", Uuid::new_v4().simple());
        let run = Run {
            id: run_id.clone(),
            goal_id: goal_id.to_string(),
            goal_description: goal_description.to_string(),
            status: RunStatus::Running,
            input_data,
            decisions: Vec::new(),
            problems: Vec::new(),
            output: BTreeMap::new(),
            metrics: RunMetrics::default(),
            narrative: String::new(),
            started_at: Utc::now(),
            ended_at: None,
        };
        info!(run_id = %run_id, goal_id, "run started");
        *current = Some(run);
        Ok(run_id)
    }

    /// Allocates a decision with no outcome yet and returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn decide(
        &self,
        node_id: &str,
        intent: &str,
        options: Vec<DecisionOption>,
        chosen: &str,
        reasoning: &str,
        context: BTreeMap<String, Value>,
        decision_type: DecisionType,
    ) -> Result<String, EngineError> {
        let mut current = self.lock_current();
        let run = current
            .as_mut()
            .ok_or_else(|| EngineError::RuntimeException("no active run".into()))?;
        let decision_id = format!("dec_{}", Uuid::new_v4().simple());
        debug!(run_id = %run.id, node_id, intent, chosen, "decision recorded");
        run.decisions.push(Decision {
            id: decision_id.clone(),
            run_id: run.id.clone(),
            node_id: node_id.to_string(),
            intent: intent.to_string(),
            options,
            chosen_option_id: chosen.to_string(),
            reasoning: reasoning.to_string(),
            active_constraints: Vec::new(),
            input_context: context,
            decision_type,
            outcome: None,
            attempts: Vec::new(),
            decided_at: Utc::now(),
        });
        Ok(decision_id)
    }

    /// Records the constraint ids active for the most recent decision.
    pub fn set_active_constraints(&self, decision_id: &str, constraints: Vec<String>) {
        let mut current = self.lock_current();
        if let Some(run) = current.as_mut() {
            if let Some(d) = run.decisions.iter_mut().find(|d| d.id == decision_id) {
                d.active_constraints = constraints;
            }
        }
    }

    /// Appends a non-final failed attempt to a decision's audit trail.
    ///
    /// Used by node retry: each exhausted attempt before the final outcome is
    /// visible afterwards without consuming the decision's single outcome.
    pub fn record_attempt(&self, decision_id: &str, outcome: Outcome) -> Result<(), EngineError> {
        let mut current = self.lock_current();
        let run = current
            .as_mut()
            .ok_or_else(|| EngineError::RuntimeException("no active run".into()))?;
        let decision = run
            .decisions
            .iter_mut()
            .find(|d| d.id == decision_id)
            .ok_or_else(|| EngineError::RuntimeException(format!("no decision {decision_id}")))?;
        if decision.outcome.is_some() {
            return Err(EngineError::AlreadyFinalised(decision_id.to_string()));
        }
        decision.attempts.push(outcome);
        Ok(())
    }

    /// Closes a decision with its one final outcome.
    ///
    /// A second call for the same decision fails with `AlreadyFinalised`.
    pub fn record_outcome(&self, decision_id: &str, outcome: Outcome) -> Result<(), EngineError> {
        let mut current = self.lock_current();
        let run = current
            .as_mut()
            .ok_or_else(|| EngineError::RuntimeException("no active run".into()))?;
        let decision = run
            .decisions
            .iter_mut()
            .find(|d| d.id == decision_id)
            .ok_or_else(|| EngineError::RuntimeException(format!("no decision {decision_id}")))?;
        if decision.outcome.is_some() {
            return Err(EngineError::AlreadyFinalised(decision_id.to_string()));
        }
        run.metrics.total_tokens += outcome.tokens_used;
        run.metrics.total_latency_ms += outcome.latency_ms;
        decision.outcome = Some(outcome);
        run.recompute_success_rate();
        Ok(())
    }

    /// Appends a problem note to the current run.
    pub fn report_problem(
        &self,
        severity: Severity,
        description: impl Into<String>,
        suggested_fix: Option<String>,
    ) {
        let description = description.into();
        let mut current = self.lock_current();
        if let Some(run) = current.as_mut() {
            warn!(run_id = %run.id, severity = severity.as_str(), %description, "problem reported");
            run.problems.push(Problem {
                severity,
                description,
                suggested_fix,
                reported_at: Utc::now(),
            });
        }
    }

    /// Appends a node id to the run's traversal path.
    pub fn record_node_visit(&self, node_id: &str) {
        let mut current = self.lock_current();
        if let Some(run) = current.as_mut() {
            run.metrics.nodes_executed.push(node_id.to_string());
        }
    }

    /// Closes the run (`completed` or `failed`) and flushes it to storage.
    pub fn end_run(
        &self,
        success: bool,
        output_data: Option<BTreeMap<String, Value>>,
        narrative: impl Into<String>,
    ) -> Result<Run, EngineError> {
        self.close_run(
            if success {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            },
            output_data,
            narrative,
        )
    }

    /// Closes the run as `paused` (resumable) and flushes it to storage.
    pub fn pause_run(
        &self,
        output_data: Option<BTreeMap<String, Value>>,
        narrative: impl Into<String>,
    ) -> Result<Run, EngineError> {
        self.close_run(RunStatus::Paused, output_data, narrative)
    }

    /// The live run, cloned. `None` outside an execution.
    pub fn current_run(&self) -> Option<Run> {
        self.lock_current().clone()
    }

    fn close_run(
        &self,
        status: RunStatus,
        output_data: Option<BTreeMap<String, Value>>,
        narrative: impl Into<String>,
    ) -> Result<Run, EngineError> {
        let mut run = {
            let mut current = self.lock_current();
            current
                .take()
                .ok_or_else(|| EngineError::RuntimeException("no active run".into()))?
        };
        run.status = status;
        run.narrative = narrative.into();
        if let Some(output) = output_data {
            run.output = output;
        }
        run.ended_at = Some(Utc::now());
        run.recompute_success_rate();
        info!(
            run_id = %run.id,
            status = status.as_str(),
            decisions = run.decisions.len(),
            "run ended"
        );
        if let Some(storage) = &self.storage {
            storage.save_run(&run)?;
        }
        Ok(run)
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<Run>> {
        self.current.lock().expect("runtime lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decide_once(runtime: &Runtime) -> String {
        runtime
            .decide(
                "a",
                "Execute node: a",
                vec![DecisionOption::new("function", "Run function node")],
                "function",
                "node type is function",
                BTreeMap::new(),
                DecisionType::NodeExecution,
            )
            .unwrap()
    }

    #[test]
    fn start_decide_outcome_end_lifecycle() {
        let runtime = Runtime::unpersisted();
        runtime.start_run("g1", "demo", BTreeMap::new()).unwrap();
        let decision_id = decide_once(&runtime);
        runtime
            .record_outcome(&decision_id, Outcome::success(json!({"y": 4}), 10, 7))
            .unwrap();
        let run = runtime.end_run(true, None, "done").unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.decisions.len(), 1);
        assert_eq!(run.metrics.success_rate, 1.0);
        assert_eq!(run.metrics.total_tokens, 10);
        assert!(runtime.current_run().is_none());
    }

    /// **Scenario**: exactly one outcome per decision; the second call fails
    /// with `already_finalised`.
    #[test]
    fn second_outcome_is_rejected() {
        let runtime = Runtime::unpersisted();
        runtime.start_run("g1", "demo", BTreeMap::new()).unwrap();
        let decision_id = decide_once(&runtime);
        runtime
            .record_outcome(&decision_id, Outcome::success(json!(null), 0, 1))
            .unwrap();
        let err = runtime
            .record_outcome(&decision_id, Outcome::failure("again", 0, 1))
            .unwrap_err();
        assert_eq!(err.code(), "already_finalised");
    }

    /// **Scenario**: retried failures land in the audit trail, the final
    /// outcome stays single.
    #[test]
    fn attempts_accumulate_before_final_outcome() {
        let runtime = Runtime::unpersisted();
        runtime.start_run("g1", "demo", BTreeMap::new()).unwrap();
        let decision_id = decide_once(&runtime);
        runtime
            .record_attempt(&decision_id, Outcome::failure("rate_limit", 0, 3))
            .unwrap();
        runtime
            .record_outcome(&decision_id, Outcome::success(json!(1), 0, 4))
            .unwrap();
        let run = runtime.end_run(true, None, "done").unwrap();
        let decision = &run.decisions[0];
        assert_eq!(decision.attempts.len(), 1);
        assert!(decision.was_successful());

        // No attempts after finalisation.
        let runtime = Runtime::unpersisted();
        runtime.start_run("g1", "demo", BTreeMap::new()).unwrap();
        let id = decide_once(&runtime);
        runtime.record_outcome(&id, Outcome::success(json!(1), 0, 1)).unwrap();
        let err = runtime
            .record_attempt(&id, Outcome::failure("late", 0, 1))
            .unwrap_err();
        assert_eq!(err.code(), "already_finalised");
    }

    #[test]
    fn pause_run_uses_paused_status() {
        let runtime = Runtime::unpersisted();
        runtime.start_run("g1", "demo", BTreeMap::new()).unwrap();
        let run = runtime
            .pause_run(None, "Paused at approval after 2 steps")
            .unwrap();
        assert_eq!(run.status, RunStatus::Paused);
    }

    #[test]
    fn overlapping_runs_are_refused() {
        let runtime = Runtime::unpersisted();
        runtime.start_run("g1", "demo", BTreeMap::new()).unwrap();
        let err = runtime.start_run("g1", "demo", BTreeMap::new()).unwrap_err();
        assert_eq!(err.code(), "runtime_exception");
    }

    #[test]
    fn problems_and_path_are_recorded() {
        let runtime = Runtime::unpersisted();
        runtime.start_run("g1", "demo", BTreeMap::new()).unwrap();
        runtime.record_node_visit("a");
        runtime.record_node_visit("b");
        runtime.report_problem(Severity::Critical, "node b failed", Some("add retry".into()));
        let run = runtime.end_run(false, None, "failed").unwrap();
        assert_eq!(run.metrics.nodes_executed, vec!["a", "b"]);
        assert_eq!(run.problems.len(), 1);
        assert_eq!(run.problems[0].severity, Severity::Critical);
    }
}
