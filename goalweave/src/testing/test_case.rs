//! Test scenarios: generated checks awaiting human approval.
//!
//! A `Test` pairs an input payload with an expected output and the executable
//! body of the check. Tests flow through an approval pipeline (pending →
//! approved / modified / rejected); only approved (or modified) tests are run
//! by the harness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Human review status of a generated test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Generated, not yet reviewed.
    Pending,
    /// Approved as generated.
    Approved,
    /// Approved after human edits.
    Modified,
    /// Rejected; never run.
    Rejected,
}

impl ApprovalStatus {
    /// True when the harness may execute this test.
    pub fn is_runnable(&self) -> bool {
        matches!(self, ApprovalStatus::Approved | ApprovalStatus::Modified)
    }
}

/// One test scenario for a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: String,
    pub goal_id: String,
    /// Success criterion this test exercises.
    pub criterion_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Input payload fed to the agent.
    pub input: Value,
    /// Expected output (shape depends on the check body).
    pub expected_output: Value,
    /// Executable body of the check (sandbox expression over
    /// `{input, expected, actual}`; empty means plain equality on
    /// `expected_output`).
    #[serde(default)]
    pub check: String,
    pub approval: ApprovalStatus,
    /// Confidence assigned by the generating model, in [0, 1].
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub run_count: u64,
    #[serde(default)]
    pub pass_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_passed: Option<bool>,
}

impl Test {
    /// Records the result of one execution in the test's own bookkeeping.
    pub fn record_result(&mut self, passed: bool) {
        self.run_count += 1;
        if passed {
            self.pass_count += 1;
        }
        self.last_run = Some(Utc::now());
        self.last_passed = Some(passed);
    }
}
