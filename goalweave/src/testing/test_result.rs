//! Test results and suite aggregates.
//!
//! Every non-passing result carries exactly one `ErrorCategory`; the category
//! decides which stage of the build loop the failure sends the engineer back
//! to (goal, agent, or eval).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why a test failed, as far as the iteration loop is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The goal definition is wrong: revise success criteria / constraints.
    LogicError,
    /// The agent's code is wrong: revise nodes/edges.
    ImplementationError,
    /// A new scenario was discovered: add a test, change nothing else.
    EdgeCase,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::LogicError => "logic_error",
            ErrorCategory::ImplementationError => "implementation_error",
            ErrorCategory::EdgeCase => "edge_case",
        }
    }
}

/// Outcome of executing one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub passed: bool,
    pub duration_ms: u64,
    #[serde(default)]
    pub expected_output: Value,
    #[serde(default)]
    pub actual_output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    pub executed_at: DateTime<Utc>,
}

impl TestResult {
    /// Passing result.
    pub fn passed(test_id: impl Into<String>, duration_ms: u64, actual: Value) -> Self {
        Self {
            test_id: test_id.into(),
            passed: true,
            duration_ms,
            expected_output: Value::Null,
            actual_output: actual,
            error_message: None,
            stack_trace: None,
            error_category: None,
            executed_at: Utc::now(),
        }
    }

    /// Failing result; the category is filled in by the categoriser.
    pub fn failed(test_id: impl Into<String>, duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            passed: false,
            duration_ms,
            expected_output: Value::Null,
            actual_output: Value::Null,
            error_message: Some(error.into()),
            stack_trace: None,
            error_category: None,
            executed_at: Utc::now(),
        }
    }
}

/// Aggregate of one harness run over a goal's approved tests.
///
/// `duration_ms` sums per-test durations; wall clock across workers is not
/// meaningful to the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub goal_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    #[serde(default)]
    pub results: Vec<TestResult>,
    pub duration_ms: u64,
}

impl TestSuiteResult {
    /// Builds the aggregate from collected results.
    pub fn from_results(goal_id: impl Into<String>, results: Vec<TestResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        let duration_ms = results.iter().map(|r| r.duration_ms).sum();
        Self {
            goal_id: goal_id.into(),
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
            duration_ms,
        }
    }

    /// True when every test passed (vacuously true for an empty suite).
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}
