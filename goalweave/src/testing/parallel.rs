//! Parallel test harness: worker-per-task, test-per-dispatch.
//!
//! A fixed pool of worker tasks is spawned; each worker constructs one agent
//! via the factory at initialisation and reuses it for every test it pulls
//! from the shared queue (per-test dispatch gives load balancing). Results
//! are collected in completion order. Fail-fast cancels outstanding work
//! best-effort through a cancellation token; tests already running may still
//! finish, but their results are discarded. With one worker (or fewer) the
//! harness runs sequentially on the caller's task with a single agent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::storage::FileStorage;

use super::categorizer::ErrorCategorizer;
use super::executor::{AgentFactory, TestExecutor};
use super::test_case::Test;
use super::test_result::{TestResult, TestSuiteResult};

/// Configuration for parallel test execution.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    pub num_workers: usize,
    pub timeout_per_test: Duration,
    pub fail_fast: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            timeout_per_test: TestExecutor::DEFAULT_TIMEOUT,
            fail_fast: false,
        }
    }
}

/// Callback invoked as each result lands (completion order).
pub type OnResult<'a> = &'a (dyn Fn(&TestResult) + Send + Sync);

/// The parallel test runner.
pub struct ParallelTestRunner {
    config: ParallelConfig,
    storage: Option<Arc<FileStorage>>,
    categorizer: ErrorCategorizer,
}

impl ParallelTestRunner {
    pub fn new(config: ParallelConfig) -> Self {
        Self {
            config,
            storage: None,
            categorizer: ErrorCategorizer::new(),
        }
    }

    /// Attach storage for test loading and result persistence (builder).
    pub fn with_storage(mut self, storage: Arc<FileStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Runs all approved tests for a goal (or the provided list) and returns
    /// the suite aggregate. Results are persisted when storage is attached.
    pub async fn run_all(
        &self,
        goal_id: &str,
        factory: Arc<dyn AgentFactory>,
        tests: Option<Vec<Test>>,
        on_result: Option<OnResult<'_>>,
    ) -> Result<TestSuiteResult, EngineError> {
        let tests = match tests {
            Some(tests) => tests,
            None => {
                let storage = self.storage.as_ref().ok_or_else(|| {
                    EngineError::Configuration("either tests or storage must be provided".into())
                })?;
                storage.get_approved_tests(goal_id)?
            }
        };

        if tests.is_empty() {
            return Ok(TestSuiteResult {
                goal_id: goal_id.to_string(),
                ..Default::default()
            });
        }

        info!(
            goal_id,
            tests = tests.len(),
            workers = self.config.num_workers,
            fail_fast = self.config.fail_fast,
            "running test suite"
        );

        let results = if self.config.num_workers <= 1 {
            self.run_sequential(&tests, factory, on_result).await?
        } else {
            self.run_parallel(&tests, factory, on_result).await?
        };

        if let Some(storage) = &self.storage {
            let mut test_map: std::collections::BTreeMap<&str, Test> =
                tests.iter().map(|t| (t.id.as_str(), t.clone())).collect();
            for result in &results {
                if let Some(test) = test_map.get_mut(result.test_id.as_str()) {
                    test.record_result(result.passed);
                    storage.update_test(test)?;
                }
                storage.save_result(&result.test_id, result)?;
            }
        }

        Ok(TestSuiteResult::from_results(goal_id, results))
    }

    async fn run_sequential(
        &self,
        tests: &[Test],
        factory: Arc<dyn AgentFactory>,
        on_result: Option<OnResult<'_>>,
    ) -> Result<Vec<TestResult>, EngineError> {
        let executor = TestExecutor::new(self.categorizer, self.config.timeout_per_test);
        let agent = factory.create().await?;

        let mut results = Vec::with_capacity(tests.len());
        for test in tests {
            let result = executor.execute(test, agent.as_ref()).await;
            let failed = !result.passed;
            if let Some(callback) = on_result {
                callback(&result);
            }
            results.push(result);
            if failed && self.config.fail_fast {
                debug!("fail-fast: stopping after first failure");
                break;
            }
        }
        Ok(results)
    }

    async fn run_parallel(
        &self,
        tests: &[Test],
        factory: Arc<dyn AgentFactory>,
        on_result: Option<OnResult<'_>>,
    ) -> Result<Vec<TestResult>, EngineError> {
        let queue = Arc::new(Mutex::new(tests.iter().cloned().collect::<VecDeque<Test>>()));
        let (tx, mut rx) = mpsc::unbounded_channel::<TestResult>();
        let token = CancellationToken::new();
        let fail_fast = self.config.fail_fast;
        let timeout = self.config.timeout_per_test;
        let categorizer = self.categorizer;

        let worker_count = self.config.num_workers.min(tests.len());
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let factory = Arc::clone(&factory);
            let tx = tx.clone();
            let token = token.clone();
            workers.push(tokio::spawn(async move {
                // One agent per worker, created at initialisation and reused
                // for every test this worker executes.
                let agent = match factory.create().await {
                    Ok(agent) => agent,
                    Err(e) => {
                        warn!(worker_id, error = %e, "agent factory failed, worker exiting");
                        return;
                    }
                };
                let executor = TestExecutor::new(categorizer, timeout);

                loop {
                    if token.is_cancelled() {
                        break;
                    }
                    let test = queue.lock().await.pop_front();
                    let Some(test) = test else { break };
                    debug!(worker_id, test = %test.id, "worker picked test");

                    let result = executor.execute(&test, agent.as_ref()).await;
                    let failed = !result.passed;
                    // Results from workers racing a cancellation are dropped
                    // by the closed channel, matching best-effort fail-fast.
                    if token.is_cancelled() || tx.send(result).is_err() {
                        break;
                    }
                    if failed && fail_fast {
                        token.cancel();
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let mut results = Vec::with_capacity(tests.len());
        while let Some(result) = rx.recv().await {
            if let Some(callback) = on_result {
                callback(&result);
            }
            results.push(result);
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "test worker panicked");
            }
        }
        Ok(results)
    }
}
