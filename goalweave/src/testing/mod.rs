//! Test harness: scenarios, approval, execution, categorisation.

mod categorizer;
mod executor;
mod parallel;
mod test_case;
mod test_result;

pub use categorizer::{ErrorCategorizer, IterationGuidance};
pub use executor::{Agent, AgentFactory, TestExecutor};
pub use parallel::{OnResult, ParallelConfig, ParallelTestRunner};
pub use test_case::{ApprovalStatus, Test};
pub use test_result::{ErrorCategory, TestResult, TestSuiteResult};
