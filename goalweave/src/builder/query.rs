//! Builder query: read-only projections over stored runs.
//!
//! Organised around the questions an agent builder asks: what happened
//! (summaries, traces), why did it fail (failure analysis), what patterns
//! emerge across runs (success rates, common failures, problematic nodes),
//! and what should change (prioritised suggestions).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::runtime::{Run, RunStatus, RunSummary};
use crate::storage::FileStorage;

/// Node failure rate above which a node counts as problematic.
const PROBLEMATIC_FAILURE_RATE: f64 = 0.1;
/// Error occurrence count from which a suggestion is raised.
const FREQUENT_ERROR_THRESHOLD: usize = 2;
/// Goal success rate below which a restructuring suggestion is raised.
const LOW_SUCCESS_RATE: f64 = 0.8;
/// Intent prefix length used to group similar decisions.
const INTENT_PREFIX: usize = 50;

/// Structured analysis of why one run failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub run_id: String,
    /// Builder summary of the first failed decision.
    pub failure_point: String,
    /// The failed decision's error text.
    pub root_cause: String,
    /// Decision summaries up to and including the failure.
    pub decision_chain: Vec<String>,
    /// Reported problems, severity-tagged.
    pub problems: Vec<String>,
    pub suggestions: Vec<String>,
}

impl fmt::Display for FailureAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Failure Analysis for {} ===", self.run_id)?;
        writeln!(f)?;
        writeln!(f, "Failure Point: {}", self.failure_point)?;
        writeln!(f, "Root Cause: {}", self.root_cause)?;
        writeln!(f)?;
        writeln!(f, "Decision Chain Leading to Failure:")?;
        for (i, decision) in self.decision_chain.iter().enumerate() {
            writeln!(f, "  {}. {decision}", i + 1)?;
        }
        if !self.problems.is_empty() {
            writeln!(f)?;
            writeln!(f, "Reported Problems:")?;
            for problem in &self.problems {
                writeln!(f, "  - {problem}")?;
            }
        }
        if !self.suggestions.is_empty() {
            writeln!(f)?;
            writeln!(f, "Suggestions:")?;
            for suggestion in &self.suggestions {
                writeln!(f, "  → {suggestion}")?;
            }
        }
        Ok(())
    }
}

/// Most-chosen option for one intent prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonChoice {
    pub choice: String,
    pub count: usize,
    /// How many other options were ever chosen for this intent.
    pub alternatives: usize,
}

/// Decision-shape statistics across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionPatterns {
    pub decision_type_distribution: BTreeMap<String, usize>,
    /// Intent prefix → its most common choice.
    pub common_choices: BTreeMap<String, CommonChoice>,
}

/// Patterns detected across all runs for one goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub goal_id: String,
    pub run_count: usize,
    pub success_rate: f64,
    /// Top error messages by frequency (at most five).
    pub common_failures: Vec<(String, usize)>,
    /// Nodes above the failure-rate threshold, worst first.
    pub problematic_nodes: Vec<(String, f64)>,
    pub decision_patterns: DecisionPatterns,
}

impl fmt::Display for PatternAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Pattern Analysis for Goal {} ===", self.goal_id)?;
        writeln!(f)?;
        writeln!(f, "Runs Analyzed: {}", self.run_count)?;
        writeln!(f, "Success Rate: {:.1}%", self.success_rate * 100.0)?;
        if !self.common_failures.is_empty() {
            writeln!(f)?;
            writeln!(f, "Common Failures:")?;
            for (failure, count) in &self.common_failures {
                writeln!(f, "  - {failure} ({count} occurrences)")?;
            }
        }
        if !self.problematic_nodes.is_empty() {
            writeln!(f)?;
            writeln!(f, "Problematic Nodes (failure rate):")?;
            for (node, rate) in &self.problematic_nodes {
                writeln!(f, "  - {node}: {:.1}% failure rate", rate * 100.0)?;
            }
        }
        Ok(())
    }
}

/// Digest of one run inside a comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDigest {
    pub id: String,
    pub status: RunStatus,
    pub decisions: usize,
    pub success_rate: f64,
}

/// Diff of two runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunComparison {
    pub run_1: RunDigest,
    pub run_2: RunDigest,
    pub differences: Vec<String>,
}

/// Per-node performance aggregate across all runs that visited it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePerformance {
    pub node_id: String,
    pub total_decisions: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub decision_type_distribution: BTreeMap<String, usize>,
}

/// One prioritised improvement suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Improvement {
    /// "node_improvement", "error_handling", or "architecture".
    pub kind: String,
    pub target: String,
    pub reason: String,
    pub recommendation: String,
    /// "high" or "medium".
    pub priority: String,
}

/// The read-only query interface over stored runs.
pub struct BuilderQuery {
    storage: Arc<FileStorage>,
}

impl BuilderQuery {
    pub fn new(storage: Arc<FileStorage>) -> Self {
        Self { storage }
    }

    // === What happened? ===

    /// Quick summary of one run.
    pub fn get_run_summary(&self, run_id: &str) -> Result<Option<RunSummary>, EngineError> {
        self.storage.load_summary(run_id)
    }

    /// Complete run with all decisions.
    pub fn get_full_run(&self, run_id: &str) -> Result<Option<Run>, EngineError> {
        self.storage.load_run(run_id)
    }

    /// Summaries of all runs for a goal, in save order.
    pub fn list_runs_for_goal(&self, goal_id: &str) -> Result<Vec<RunSummary>, EngineError> {
        let mut summaries = Vec::new();
        for run_id in self.storage.get_runs_by_goal(goal_id) {
            if let Some(summary) = self.storage.load_summary(&run_id)? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    /// Most recent failed runs, up to `limit`.
    pub fn get_recent_failures(&self, limit: usize) -> Result<Vec<RunSummary>, EngineError> {
        let mut summaries = Vec::new();
        for run_id in self.storage.get_runs_by_status(RunStatus::Failed).iter().rev() {
            if summaries.len() >= limit {
                break;
            }
            if let Some(summary) = self.storage.load_summary(run_id)? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    /// One formatted line per decision of a run.
    pub fn get_decision_trace(&self, run_id: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .storage
            .load_run(run_id)?
            .map(|run| run.decisions.iter().map(|d| d.summary_for_builder()).collect())
            .unwrap_or_default())
    }

    // === Why did it fail? ===

    /// Deep analysis of a failed run. `None` when the run is missing or did
    /// not fail.
    pub fn analyze_failure(&self, run_id: &str) -> Result<Option<FailureAnalysis>, EngineError> {
        let Some(run) = self.storage.load_run(run_id)? else {
            return Ok(None);
        };
        if run.status != RunStatus::Failed {
            return Ok(None);
        }

        let failed: Vec<_> = run
            .decisions
            .iter()
            .filter(|d| d.has_outcome() && !d.was_successful())
            .collect();

        let (failure_point, root_cause) = match failed.first() {
            Some(first) => (
                first.summary_for_builder(),
                first
                    .outcome
                    .as_ref()
                    .and_then(|o| o.error.clone())
                    .unwrap_or_else(|| "Unknown".into()),
            ),
            None => (
                "Unknown - no decision marked as failed".to_string(),
                "Run failed but all decisions succeeded (external cause?)".to_string(),
            ),
        };

        // Prefix of decisions up to and including the first failure.
        let mut decision_chain = Vec::new();
        for decision in &run.decisions {
            decision_chain.push(decision.summary_for_builder());
            if decision.has_outcome() && !decision.was_successful() {
                break;
            }
        }

        let problems = run
            .problems
            .iter()
            .map(|p| format!("[{}] {}", p.severity.as_str(), p.description))
            .collect();

        let mut suggestions = Vec::new();
        for decision in &failed {
            if decision.options.len() > 1 {
                if let Some(alternative) = decision
                    .options
                    .iter()
                    .find(|o| o.id != decision.chosen_option_id)
                {
                    let chosen = decision
                        .chosen_option()
                        .map(|o| o.description.clone())
                        .unwrap_or_else(|| "unknown".into());
                    suggestions.push(format!(
                        "Consider alternative: '{}' instead of '{chosen}'",
                        alternative.description
                    ));
                }
            }
            if decision.input_context.is_empty() {
                suggestions.push(format!(
                    "Decision '{}' had no input context - ensure relevant data is passed",
                    decision.intent
                ));
            }
            if !decision.active_constraints.is_empty() {
                suggestions.push(format!(
                    "Review constraints: {} - may be too restrictive",
                    decision.active_constraints.join(", ")
                ));
            }
        }
        for problem in &run.problems {
            if let Some(fix) = &problem.suggested_fix {
                suggestions.push(fix.clone());
            }
        }

        Ok(Some(FailureAnalysis {
            run_id: run_id.to_string(),
            failure_point,
            root_cause,
            decision_chain,
            problems,
            suggestions,
        }))
    }

    // === What patterns emerge? ===

    /// Patterns across all runs for a goal. `None` when the goal has no runs.
    pub fn find_patterns(&self, goal_id: &str) -> Result<Option<PatternAnalysis>, EngineError> {
        let mut runs = Vec::new();
        for run_id in self.storage.get_runs_by_goal(goal_id) {
            if let Some(run) = self.storage.load_run(&run_id)? {
                runs.push(run);
            }
        }
        if runs.is_empty() {
            return Ok(None);
        }

        let completed = runs.iter().filter(|r| r.status == RunStatus::Completed).count();
        let success_rate = completed as f64 / runs.len() as f64;

        let mut failure_counts: BTreeMap<String, usize> = BTreeMap::new();
        for run in &runs {
            for decision in &run.decisions {
                if decision.has_outcome() && !decision.was_successful() {
                    let error = decision
                        .outcome
                        .as_ref()
                        .and_then(|o| o.error.clone())
                        .unwrap_or_else(|| "Unknown error".into());
                    *failure_counts.entry(error).or_default() += 1;
                }
            }
        }
        let mut common_failures: Vec<(String, usize)> = failure_counts.into_iter().collect();
        common_failures.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        common_failures.truncate(5);

        let mut node_stats: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for run in &runs {
            for decision in &run.decisions {
                let entry = node_stats.entry(decision.node_id.clone()).or_default();
                entry.0 += 1;
                if decision.has_outcome() && !decision.was_successful() {
                    entry.1 += 1;
                }
            }
        }
        let mut problematic_nodes: Vec<(String, f64)> = node_stats
            .into_iter()
            .filter_map(|(node, (total, failed))| {
                let rate = failed as f64 / total as f64;
                (total > 0 && rate > PROBLEMATIC_FAILURE_RATE).then_some((node, rate))
            })
            .collect();
        problematic_nodes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(Some(PatternAnalysis {
            goal_id: goal_id.to_string(),
            run_count: runs.len(),
            success_rate,
            common_failures,
            problematic_nodes,
            decision_patterns: analyze_decision_patterns(&runs),
        }))
    }

    /// Diff of two runs: status, decision counts, first divergence, node sets.
    pub fn compare_runs(&self, run_id_1: &str, run_id_2: &str) -> Result<RunComparison, EngineError> {
        let run1 = self
            .storage
            .load_run(run_id_1)?
            .ok_or_else(|| EngineError::RuntimeException(format!("run not found: {run_id_1}")))?;
        let run2 = self
            .storage
            .load_run(run_id_2)?
            .ok_or_else(|| EngineError::RuntimeException(format!("run not found: {run_id_2}")))?;

        let mut differences = Vec::new();
        if run1.status != run2.status {
            differences.push(format!(
                "Status: {} vs {}",
                run1.status.as_str(),
                run2.status.as_str()
            ));
        }
        if run1.decisions.len() != run2.decisions.len() {
            differences.push(format!(
                "Decision count: {} vs {}",
                run1.decisions.len(),
                run2.decisions.len()
            ));
        }
        for (i, (d1, d2)) in run1.decisions.iter().zip(run2.decisions.iter()).enumerate() {
            if d1.chosen_option_id != d2.chosen_option_id {
                differences.push(format!(
                    "Diverged at decision {i}: chose '{}' vs '{}'",
                    d1.chosen_option_id, d2.chosen_option_id
                ));
                break;
            }
        }
        let nodes1: std::collections::BTreeSet<_> = run1.metrics.nodes_executed.iter().collect();
        let nodes2: std::collections::BTreeSet<_> = run2.metrics.nodes_executed.iter().collect();
        let only_1: Vec<_> = nodes1.difference(&nodes2).map(|s| s.as_str()).collect();
        let only_2: Vec<_> = nodes2.difference(&nodes1).map(|s| s.as_str()).collect();
        if !only_1.is_empty() {
            differences.push(format!("Nodes only in run 1: {}", only_1.join(", ")));
        }
        if !only_2.is_empty() {
            differences.push(format!("Nodes only in run 2: {}", only_2.join(", ")));
        }

        Ok(RunComparison {
            run_1: digest(&run1),
            run_2: digest(&run2),
            differences,
        })
    }

    /// Performance aggregate for one node across every run that visited it.
    pub fn get_node_performance(&self, node_id: &str) -> Result<NodePerformance, EngineError> {
        let mut total = 0usize;
        let mut successful = 0usize;
        let mut total_latency = 0u64;
        let mut total_tokens = 0u64;
        let mut types: BTreeMap<String, usize> = BTreeMap::new();

        for run_id in self.storage.get_runs_by_node(node_id) {
            let Some(run) = self.storage.load_run(&run_id)? else {
                continue;
            };
            for decision in run.decisions.iter().filter(|d| d.node_id == node_id) {
                total += 1;
                if decision.was_successful() {
                    successful += 1;
                }
                if let Some(outcome) = &decision.outcome {
                    total_latency += outcome.latency_ms;
                    total_tokens += outcome.tokens_used;
                }
                *types.entry(decision.decision_type.as_str().to_string()).or_default() += 1;
            }
        }

        Ok(NodePerformance {
            node_id: node_id.to_string(),
            total_decisions: total,
            success_rate: if total > 0 { successful as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency as f64 / total as f64 } else { 0.0 },
            total_tokens,
            decision_type_distribution: types,
        })
    }

    // === What should we change? ===

    /// Prioritised improvement suggestions derived from the pattern analysis.
    pub fn suggest_improvements(&self, goal_id: &str) -> Result<Vec<Improvement>, EngineError> {
        let Some(patterns) = self.find_patterns(goal_id)? else {
            return Ok(Vec::new());
        };

        let mut suggestions = Vec::new();
        for (node_id, failure_rate) in &patterns.problematic_nodes {
            suggestions.push(Improvement {
                kind: "node_improvement".into(),
                target: node_id.clone(),
                reason: format!("Node has {:.1}% failure rate", failure_rate * 100.0),
                recommendation: format!(
                    "Review and improve node '{node_id}' - high failure rate suggests prompt or tool issues"
                ),
                priority: if *failure_rate > 0.3 { "high" } else { "medium" }.into(),
            });
        }
        for (failure, count) in &patterns.common_failures {
            if *count >= FREQUENT_ERROR_THRESHOLD {
                suggestions.push(Improvement {
                    kind: "error_handling".into(),
                    target: failure.clone(),
                    reason: format!("Error occurred {count} times"),
                    recommendation: format!("Add handling for: {failure}"),
                    priority: if *count >= 5 { "high" } else { "medium" }.into(),
                });
            }
        }
        if patterns.success_rate < LOW_SUCCESS_RATE {
            suggestions.push(Improvement {
                kind: "architecture".into(),
                target: goal_id.to_string(),
                reason: format!(
                    "Goal success rate is only {:.1}%",
                    patterns.success_rate * 100.0
                ),
                recommendation: "Consider restructuring the agent graph or improving goal definition"
                    .into(),
                priority: "high".into(),
            });
        }

        Ok(suggestions)
    }
}

fn digest(run: &Run) -> RunDigest {
    RunDigest {
        id: run.id.clone(),
        status: run.status,
        decisions: run.decisions.len(),
        success_rate: run.metrics.success_rate,
    }
}

fn analyze_decision_patterns(runs: &[Run]) -> DecisionPatterns {
    let mut type_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut option_counts: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();

    for run in runs {
        for decision in &run.decisions {
            *type_counts
                .entry(decision.decision_type.as_str().to_string())
                .or_default() += 1;

            let intent_key: String = decision.intent.chars().take(INTENT_PREFIX).collect();
            if let Some(chosen) = decision.chosen_option() {
                *option_counts
                    .entry(intent_key)
                    .or_default()
                    .entry(chosen.description.clone())
                    .or_default() += 1;
            }
        }
    }

    let common_choices = option_counts
        .into_iter()
        .filter_map(|(intent, choices)| {
            let alternatives = choices.len().saturating_sub(1);
            choices
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .map(|(choice, count)| {
                    (
                        intent,
                        CommonChoice {
                            choice,
                            count,
                            alternatives,
                        },
                    )
                })
        })
        .collect();

    DecisionPatterns {
        decision_type_distribution: type_counts,
        common_choices,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Decision, DecisionOption, DecisionType, Outcome, Problem, RunMetrics, Severity};
    use chrono::Utc;
    use serde_json::json;

    fn decision(node: &str, intent: &str, success: Option<bool>) -> Decision {
        Decision {
            id: format!("d_{node}_{intent}"),
            run_id: "r".into(),
            node_id: node.to_string(),
            intent: intent.to_string(),
            options: vec![
                DecisionOption::new("primary", "primary approach"),
                DecisionOption::new("fallback", "fallback approach"),
            ],
            chosen_option_id: "primary".into(),
            reasoning: String::new(),
            active_constraints: vec![],
            input_context: Default::default(),
            decision_type: DecisionType::NodeExecution,
            outcome: success.map(|ok| {
                if ok {
                    Outcome::success(json!(null), 10, 5)
                } else {
                    Outcome::failure("tool timeout", 0, 5)
                }
            }),
            attempts: vec![],
            decided_at: Utc::now(),
        }
    }

    fn run(id: &str, status: RunStatus, decisions: Vec<Decision>) -> Run {
        let nodes: Vec<String> = decisions.iter().map(|d| d.node_id.clone()).collect();
        let mut run = Run {
            id: id.into(),
            goal_id: "g1".into(),
            goal_description: String::new(),
            status,
            input_data: Default::default(),
            decisions,
            problems: vec![],
            output: Default::default(),
            metrics: RunMetrics {
                nodes_executed: nodes,
                ..Default::default()
            },
            narrative: String::new(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
        };
        run.recompute_success_rate();
        run
    }

    fn storage_with(runs: &[Run]) -> (tempfile::TempDir, BuilderQuery) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
        for r in runs {
            storage.save_run(r).unwrap();
        }
        (dir, BuilderQuery::new(storage))
    }

    #[test]
    fn analyze_failure_finds_first_failed_decision() {
        let mut failed_run = run(
            "r1",
            RunStatus::Failed,
            vec![
                decision("a", "Execute node: a", Some(true)),
                decision("b", "Execute node: b", Some(false)),
                decision("c", "Execute node: c", Some(true)),
            ],
        );
        failed_run.problems.push(Problem {
            severity: Severity::Critical,
            description: "Node b failed: tool timeout".into(),
            suggested_fix: Some("Raise the tool deadline".into()),
            reported_at: Utc::now(),
        });
        let (_dir, query) = storage_with(&[failed_run]);

        let analysis = query.analyze_failure("r1").unwrap().unwrap();
        assert_eq!(analysis.root_cause, "tool timeout");
        // Chain stops at the failure: a then b, not c.
        assert_eq!(analysis.decision_chain.len(), 2);
        assert!(analysis.failure_point.contains("[b]"));
        assert!(analysis.problems[0].contains("critical"));
        // Problem-provided fix is carried into the suggestions.
        assert!(analysis.suggestions.iter().any(|s| s.contains("Raise the tool deadline")));
        // Alternative-option suggestion is raised for the failed decision.
        assert!(analysis.suggestions.iter().any(|s| s.contains("fallback approach")));
    }

    #[test]
    fn analyze_failure_refuses_non_failed_runs() {
        let (_dir, query) = storage_with(&[run("r1", RunStatus::Completed, vec![])]);
        assert!(query.analyze_failure("r1").unwrap().is_none());
        assert!(query.analyze_failure("missing").unwrap().is_none());
    }

    #[test]
    fn find_patterns_counts_failures_and_problem_nodes() {
        let runs: Vec<Run> = vec![
            run(
                "r1",
                RunStatus::Completed,
                vec![decision("a", "Execute node: a", Some(true))],
            ),
            run(
                "r2",
                RunStatus::Failed,
                vec![
                    decision("a", "Execute node: a", Some(true)),
                    decision("b", "Execute node: b", Some(false)),
                ],
            ),
            run(
                "r3",
                RunStatus::Failed,
                vec![decision("b", "Execute node: b", Some(false))],
            ),
        ];
        let (_dir, query) = storage_with(&runs);

        let patterns = query.find_patterns("g1").unwrap().unwrap();
        assert_eq!(patterns.run_count, 3);
        assert!((patterns.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(patterns.common_failures[0], ("tool timeout".to_string(), 2));
        // Node b failed twice out of two decisions.
        assert_eq!(patterns.problematic_nodes[0].0, "b");
        assert!((patterns.problematic_nodes[0].1 - 1.0).abs() < 1e-9);
        // Node a never failed; not listed.
        assert!(!patterns.problematic_nodes.iter().any(|(n, _)| n == "a"));
        assert_eq!(
            patterns
                .decision_patterns
                .decision_type_distribution
                .get("node_execution"),
            Some(&4)
        );

        assert!(query.find_patterns("unknown-goal").unwrap().is_none());
    }

    #[test]
    fn compare_runs_reports_divergence_and_node_sets() {
        let r1 = run(
            "r1",
            RunStatus::Completed,
            vec![decision("a", "Execute node: a", Some(true))],
        );
        let mut d = decision("a", "Execute node: a", Some(true));
        d.chosen_option_id = "fallback".into();
        let r2 = {
            let mut r = run("r2", RunStatus::Failed, vec![d, decision("x", "Execute node: x", Some(true))]);
            r.metrics.nodes_executed = vec!["a".into(), "x".into()];
            r
        };
        let (_dir, query) = storage_with(&[r1, r2]);

        let diff = query.compare_runs("r1", "r2").unwrap();
        assert_eq!(diff.run_1.decisions, 1);
        assert_eq!(diff.run_2.decisions, 2);
        assert!(diff.differences.iter().any(|d| d.starts_with("Status:")));
        assert!(diff
            .differences
            .iter()
            .any(|d| d.contains("Diverged at decision 0")));
        assert!(diff.differences.iter().any(|d| d.contains("only in run 2: x")));
    }

    #[test]
    fn node_performance_aggregates_latency_and_tokens() {
        let runs = vec![
            run(
                "r1",
                RunStatus::Completed,
                vec![decision("a", "Execute node: a", Some(true))],
            ),
            run(
                "r2",
                RunStatus::Completed,
                vec![decision("a", "Execute node: a", Some(false))],
            ),
        ];
        let (_dir, query) = storage_with(&runs);

        let perf = query.get_node_performance("a").unwrap();
        assert_eq!(perf.total_decisions, 2);
        assert!((perf.success_rate - 0.5).abs() < 1e-9);
        assert!((perf.avg_latency_ms - 5.0).abs() < 1e-9);
        assert_eq!(perf.total_tokens, 10);
    }

    #[test]
    fn suggestions_cover_nodes_errors_and_low_success() {
        let runs: Vec<Run> = (0..3)
            .map(|i| {
                run(
                    &format!("r{i}"),
                    RunStatus::Failed,
                    vec![decision("b", "Execute node: b", Some(false))],
                )
            })
            .collect();
        let (_dir, query) = storage_with(&runs);

        let suggestions = query.suggest_improvements("g1").unwrap();
        assert!(suggestions.iter().any(|s| s.kind == "node_improvement" && s.target == "b" && s.priority == "high"));
        assert!(suggestions.iter().any(|s| s.kind == "error_handling" && s.reason.contains("3 times")));
        assert!(suggestions.iter().any(|s| s.kind == "architecture"));
    }
}
