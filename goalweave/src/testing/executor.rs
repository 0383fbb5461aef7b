//! Single-test executor: one test against one agent, with a deadline.
//!
//! The agent seam is deliberately narrow (`run(input) → output`) so the
//! harness can drive a full `AgentRunner`, a bare `GraphExecutor` wrapper, or
//! a stub in tests. Checks come in two shapes: a sandbox expression over
//! `{input, expected, actual}`, or (when the test carries no check body) a
//! structural match of the expected output against the actual one.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;
use crate::graph::CodeSandbox;

use super::categorizer::ErrorCategorizer;
use super::test_case::Test;
use super::test_result::TestResult;

/// An agent under test.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Runs the agent on an input payload and returns its output.
    async fn run(&self, input: Value) -> Result<Value, EngineError>;
}

/// Creates agent instances for harness workers (one per worker).
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Agent>, EngineError>;
}

/// Executes one test against one agent.
pub struct TestExecutor {
    categorizer: ErrorCategorizer,
    timeout: Duration,
    sandbox: CodeSandbox,
}

impl TestExecutor {
    /// Default per-test wall-clock budget.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(categorizer: ErrorCategorizer, timeout: Duration) -> Self {
        Self {
            categorizer,
            timeout,
            sandbox: CodeSandbox::new(),
        }
    }

    /// Runs the test. Failures are categorised; a missed deadline fails with
    /// the literal message "Test timed out".
    pub async fn execute(&self, test: &Test, agent: &dyn Agent) -> TestResult {
        let start = Instant::now();
        debug!(test = %test.id, "executing test");

        let outcome = tokio::time::timeout(self.timeout, agent.run(test.input.clone())).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Err(_) => {
                let mut result = TestResult::failed(&test.id, self.timeout.as_millis() as u64, "Test timed out");
                result.expected_output = test.expected_output.clone();
                result
            }
            Ok(Err(e)) => {
                let mut result =
                    TestResult::failed(&test.id, duration_ms, format!("agent execution failed: {e}"));
                result.expected_output = test.expected_output.clone();
                result.stack_trace = Some(format!("{e:?}"));
                result
            }
            Ok(Ok(actual)) => self.check(test, actual, duration_ms),
        };

        self.finalize(result)
    }

    fn check(&self, test: &Test, actual: Value, duration_ms: u64) -> TestResult {
        let verdict = if test.check.trim().is_empty() {
            matches_expected(&test.expected_output, &actual)
                .then_some(())
                .ok_or_else(|| {
                    format!(
                        "expected {} but got {}",
                        test.expected_output, actual
                    )
                })
        } else {
            let bindings: BTreeMap<String, Value> = [
                ("input".to_string(), test.input.clone()),
                ("expected".to_string(), test.expected_output.clone()),
                ("actual".to_string(), actual.clone()),
            ]
            .into_iter()
            .collect();
            match self.sandbox.eval_predicate(&test.check, &bindings) {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("check failed: {}", test.check)),
                Err(e) => Err(format!("check error: {e}")),
            }
        };

        match verdict {
            Ok(()) => {
                let mut result = TestResult::passed(&test.id, duration_ms, actual);
                result.expected_output = test.expected_output.clone();
                result
            }
            Err(message) => {
                let mut result = TestResult::failed(&test.id, duration_ms, message);
                result.expected_output = test.expected_output.clone();
                result.actual_output = actual;
                result
            }
        }
    }

    fn finalize(&self, mut result: TestResult) -> TestResult {
        if !result.passed {
            result.error_category = self.categorizer.categorize(&result);
        }
        result
    }
}

/// Structural match: an expected object requires each of its keys to match in
/// the actual output (extra actual keys are fine); anything else is equality.
/// A null expectation accepts any output.
fn matches_expected(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Null, _) => true,
        (Value::Object(expected_map), Value::Object(actual_map)) => expected_map
            .iter()
            .all(|(key, value)| actual_map.get(key).map(|a| matches_expected(value, a)).unwrap_or(false)),
        (e, a) => e == a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ApprovalStatus, ErrorCategory};
    use serde_json::json;

    struct FixedAgent {
        output: Value,
    }

    #[async_trait]
    impl Agent for FixedAgent {
        async fn run(&self, _input: Value) -> Result<Value, EngineError> {
            Ok(self.output.clone())
        }
    }

    struct SlowAgent;

    #[async_trait]
    impl Agent for SlowAgent {
        async fn run(&self, _input: Value) -> Result<Value, EngineError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    struct FailingAgent;

    #[async_trait]
    impl Agent for FailingAgent {
        async fn run(&self, _input: Value) -> Result<Value, EngineError> {
            Err(EngineError::NodeNotFound("ghost".into()))
        }
    }

    fn test_case(expected: Value, check: &str) -> Test {
        Test {
            id: "t1".into(),
            goal_id: "g1".into(),
            criterion_id: "c1".into(),
            name: "t".into(),
            description: String::new(),
            input: json!({"x": 3}),
            expected_output: expected,
            check: check.into(),
            approval: ApprovalStatus::Approved,
            confidence: 1.0,
            run_count: 0,
            pass_count: 0,
            last_run: None,
            last_passed: None,
        }
    }

    fn executor() -> TestExecutor {
        TestExecutor::new(ErrorCategorizer::new(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn structural_match_tolerates_extra_actual_keys() {
        let agent = FixedAgent {
            output: json!({"y": 4, "extra": true}),
        };
        let result = executor().execute(&test_case(json!({"y": 4}), ""), &agent).await;
        assert!(result.passed, "{:?}", result.error_message);
    }

    #[tokio::test]
    async fn mismatch_fails_with_expected_but_got() {
        let agent = FixedAgent {
            output: json!({"y": 5}),
        };
        let result = executor().execute(&test_case(json!({"y": 4}), ""), &agent).await;
        assert!(!result.passed);
        assert!(result.error_message.as_deref().unwrap().contains("expected"));
        assert_eq!(result.error_category, Some(ErrorCategory::ImplementationError));
        assert_eq!(result.actual_output, json!({"y": 5}));
    }

    #[tokio::test]
    async fn sandbox_check_runs_over_actual_output() {
        let agent = FixedAgent {
            output: json!({"count": 7}),
        };
        let pass = executor()
            .execute(&test_case(json!(null), "actual.count > 5"), &agent)
            .await;
        assert!(pass.passed);

        let fail = executor()
            .execute(&test_case(json!(null), "actual.count > 10"), &agent)
            .await;
        assert!(!fail.passed);
        assert!(fail.error_message.as_deref().unwrap().contains("check failed"));
    }

    /// **Scenario**: deadline expiry yields the literal "Test timed out".
    #[tokio::test]
    async fn timeout_produces_the_literal_message() {
        let result = executor().execute(&test_case(json!(null), ""), &SlowAgent).await;
        assert!(!result.passed);
        assert_eq!(result.error_message.as_deref(), Some("Test timed out"));
        assert_eq!(result.error_category, Some(ErrorCategory::EdgeCase));
    }

    #[tokio::test]
    async fn agent_errors_are_categorized_failures() {
        let result = executor().execute(&test_case(json!(null), ""), &FailingAgent).await;
        assert!(!result.passed);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("agent execution failed"));
        assert!(result.error_category.is_some());
    }
}
