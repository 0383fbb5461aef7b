//! Error categorisation for test failures.
//!
//! Categories guide the iteration loop: `logic_error` means the goal
//! definition is wrong (revise success criteria / constraints),
//! `implementation_error` means the agent's code is wrong (revise
//! nodes/edges), `edge_case` means a new scenario was discovered (add a test,
//! change nothing else). Classification is keyword patterns over the error
//! text and stack trace, checked in priority order; anything unmatched
//! defaults to `implementation_error`.

use once_cell::sync::Lazy;
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use super::test_result::{ErrorCategory, TestResult};

/// Patterns indicating the goal/criteria definition is wrong.
static LOGIC_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)goal not achieved",
        r"(?i)constraint violated",
        r"(?i)fundamental assumption",
        r"(?i)success criteria mismatch",
        r"(?i)criteria not met",
        r"(?i)expected behavior incorrect",
        r"(?i)specification error",
        r"(?i)requirement mismatch",
    ])
    .expect("logic patterns")
});

/// Patterns indicating a code/implementation bug.
static IMPLEMENTATION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)panicked",
        r"(?i)index out of bounds",
        r"(?i)called `Option::unwrap",
        r"(?i)called `Result::unwrap",
        r"(?i)assertion.*failed",
        r"(?i)expected.*but got",
        r"(?i)unexpected.*type",
        r"(?i)type mismatch",
        r"(?i)missing required",
        r"(?i)invalid.*argument",
        r"(?i)tool call failed",
        r"(?i)node execution error",
        r"(?i)agent execution failed",
        r"(?i)node_not_found",
        r"(?i)missing_function",
        r"(?i)missing_tool",
        r"(?i)permission denied",
        r"(?i)invalid graph",
        r"(?i)deserializ",
    ])
    .expect("implementation patterns")
});

/// Patterns indicating an edge case / new scenario.
static EDGE_CASE_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)boundary condition",
        r"(?i)time[d]? ?out",
        r"(?i)unexpected format",
        r"(?i)unexpected response",
        r"(?i)rare input",
        r"(?i)empty.*result",
        r"(?i)empty.*response",
        r"(?i)no.*results",
        r"(?i)null.*value",
        r"(?i)rate.?limit",
        r"(?i)quota.*exceeded",
        r"(?i)retry.*exhausted",
        r"(?i)unicode",
        r"(?i)encoding.*error",
        r"(?i)special.*character",
    ])
    .expect("edge case patterns")
});

/// Iteration guidance derived from a category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationGuidance {
    /// Which stage to return to: "Goal", "Agent", or "Eval".
    pub stage: &'static str,
    pub action: &'static str,
    /// Whether the full goal → agent → eval flow restarts.
    pub restart_required: bool,
    pub description: &'static str,
}

/// Keyword-based classifier for failed test results.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorCategorizer;

impl ErrorCategorizer {
    pub fn new() -> Self {
        Self
    }

    /// Categorises a failure. `None` for a passing result; a failure always
    /// gets exactly one category (default `implementation_error`).
    pub fn categorize(&self, result: &TestResult) -> Option<ErrorCategory> {
        if result.passed {
            return None;
        }
        let text = error_text(result);

        if LOGIC_PATTERNS.is_match(&text) {
            return Some(ErrorCategory::LogicError);
        }
        if IMPLEMENTATION_PATTERNS.is_match(&text) {
            return Some(ErrorCategory::ImplementationError);
        }
        if EDGE_CASE_PATTERNS.is_match(&text) {
            return Some(ErrorCategory::EdgeCase);
        }
        Some(ErrorCategory::ImplementationError)
    }

    /// Categorises with a confidence score in [0, 1], based on how much the
    /// winning category dominates the pattern matches.
    pub fn categorize_with_confidence(&self, result: &TestResult) -> (Option<ErrorCategory>, f64) {
        if result.passed {
            return (None, 1.0);
        }
        let text = error_text(result);
        let logic = LOGIC_PATTERNS.matches(&text).iter().count();
        let implementation = IMPLEMENTATION_PATTERNS.matches(&text).iter().count();
        let edge = EDGE_CASE_PATTERNS.matches(&text).iter().count();
        let total = logic + implementation + edge;

        if total == 0 {
            return (Some(ErrorCategory::ImplementationError), 0.3);
        }

        let (category, wins) = if logic >= implementation && logic >= edge {
            (ErrorCategory::LogicError, logic)
        } else if implementation >= edge {
            (ErrorCategory::ImplementationError, implementation)
        } else {
            (ErrorCategory::EdgeCase, edge)
        };
        let dominance = wins as f64 / total as f64;
        (Some(category), (0.5 + dominance * 0.4).min(0.9))
    }

    /// Human-readable fix suggestion for a category.
    pub fn fix_suggestion(&self, category: ErrorCategory) -> &'static str {
        match category {
            ErrorCategory::LogicError => {
                "Review and update success criteria or constraints in the goal definition. \
                 The goal specification may not accurately describe the desired behavior."
            }
            ErrorCategory::ImplementationError => {
                "Fix the code in agent nodes/edges. \
                 There's a bug in the implementation that needs to be corrected."
            }
            ErrorCategory::EdgeCase => {
                "Add a new test for this edge case scenario. \
                 This is a valid scenario that wasn't covered by existing tests."
            }
        }
    }

    /// Which stage of the build loop a category sends the engineer back to.
    pub fn iteration_guidance(&self, category: ErrorCategory) -> IterationGuidance {
        match category {
            ErrorCategory::LogicError => IterationGuidance {
                stage: "Goal",
                action: "Update success criteria or constraints",
                restart_required: true,
                description: "The goal definition is incorrect. Update the success criteria \
                              or constraints, then restart the full goal → agent → eval flow.",
            },
            ErrorCategory::ImplementationError => IterationGuidance {
                stage: "Agent",
                action: "Fix nodes/edges implementation",
                restart_required: false,
                description: "There's a code bug. Fix the agent implementation, \
                              then re-run eval (skip the goal stage).",
            },
            ErrorCategory::EdgeCase => IterationGuidance {
                stage: "Eval",
                action: "Add new test only",
                restart_required: false,
                description: "This is a new scenario. Add a test for it and continue \
                              in the eval stage.",
            },
        }
    }
}

fn error_text(result: &TestResult) -> String {
    let mut parts = Vec::new();
    if let Some(message) = &result.error_message {
        parts.push(message.as_str());
    }
    if let Some(trace) = &result.stack_trace {
        parts.push(trace.as_str());
    }
    parts.join(" ")
}
