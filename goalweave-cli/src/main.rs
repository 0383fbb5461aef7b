//! Goalweave command line: run exported agents, analyze stored runs, and
//! execute approved test suites.
//!
//! The engine reads only what the host passes in; this shell loads `.env`,
//! wires an OpenAI-backed provider when `OPENAI_API_KEY` is present, and
//! prints human-readable output. Exit code 1 signals a failed run or suite.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use goalweave::builder::BuilderQuery;
use goalweave::graph::SessionState;
use goalweave::llm::{ChatOpenAI, LlmProvider};
use goalweave::runner::{AgentRunner, AgentRunnerFactory};
use goalweave::storage::FileStorage;
use goalweave::testing::{ParallelConfig, ParallelTestRunner};

#[derive(Parser)]
#[command(name = "goalweave", version, about = "Goal-driven agent execution runtime")]
struct Cli {
    /// Storage root for runs and tests.
    #[arg(long, global = true, env = "GOALWEAVE_STORAGE", default_value = ".goalweave")]
    storage: PathBuf,

    /// Model name for the OpenAI-backed provider.
    #[arg(long, global = true, env = "GOALWEAVE_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute an exported agent against an input payload.
    Run {
        /// Agent export directory (contains agent.json).
        #[arg(long)]
        agent: PathBuf,
        /// Input payload as a JSON object.
        #[arg(long, default_value = "{}")]
        input: String,
        /// Resume from a session token file produced by a paused run.
        #[arg(long)]
        resume: Option<PathBuf>,
        /// Where to write the session token if the run pauses.
        #[arg(long, default_value = "session.json")]
        session_out: PathBuf,
    },
    /// Failure analysis for one stored run.
    Analyze { run_id: String },
    /// Cross-run pattern analysis for a goal.
    Patterns { goal_id: String },
    /// Run the approved test suite for a goal against an exported agent.
    Test {
        #[arg(long)]
        agent: PathBuf,
        #[arg(long)]
        goal: String,
        /// Worker count; 1 runs sequentially.
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Stop on the first failing test.
        #[arg(long)]
        fail_fast: bool,
    },
}

fn provider(model: &str) -> Option<Arc<dyn LlmProvider>> {
    if std::env::var("OPENAI_API_KEY").is_ok() {
        Some(Arc::new(ChatOpenAI::new(model)))
    } else {
        tracing::warn!("OPENAI_API_KEY not set; LLM nodes will fail");
        None
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(ok) => {
            if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let storage = Arc::new(FileStorage::new(&cli.storage)?);

    match cli.command {
        Command::Run {
            agent,
            input,
            resume,
            session_out,
        } => {
            let input: BTreeMap<String, serde_json::Value> = serde_json::from_str(&input)?;
            let runner =
                AgentRunner::load(agent, provider(&cli.model), Some(Arc::clone(&storage))).await?;

            let result = match resume {
                Some(path) => {
                    let session: SessionState =
                        serde_json::from_str(&std::fs::read_to_string(path)?)?;
                    runner.resume(session, input).await
                }
                None => runner.run(input).await,
            };

            if let Some(paused_at) = &result.paused_at {
                let session = result.session_state.as_ref().expect("session on pause");
                std::fs::write(&session_out, serde_json::to_string_pretty(session)?)?;
                println!("paused at {paused_at}; session written to {}", session_out.display());
            } else {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            runner.shutdown().await;
            Ok(result.success)
        }
        Command::Analyze { run_id } => {
            let query = BuilderQuery::new(storage);
            match query.analyze_failure(&run_id)? {
                Some(analysis) => println!("{analysis}"),
                None => println!("run '{run_id}' not found or did not fail"),
            }
            Ok(true)
        }
        Command::Patterns { goal_id } => {
            let query = BuilderQuery::new(storage);
            match query.find_patterns(&goal_id)? {
                Some(patterns) => {
                    println!("{patterns}");
                    for suggestion in query.suggest_improvements(&goal_id)? {
                        println!(
                            "[{}] {}: {}",
                            suggestion.priority, suggestion.kind, suggestion.recommendation
                        );
                    }
                }
                None => println!("no runs recorded for goal '{goal_id}'"),
            }
            Ok(true)
        }
        Command::Test {
            agent,
            goal,
            workers,
            fail_fast,
        } => {
            let factory = Arc::new(AgentRunnerFactory::new(
                agent,
                provider(&cli.model),
                Some(Arc::clone(&storage)),
            ));
            let runner = ParallelTestRunner::new(ParallelConfig {
                num_workers: workers,
                fail_fast,
                ..Default::default()
            })
            .with_storage(storage);

            let print_result = |result: &goalweave::testing::TestResult| {
                let marker = if result.passed { "ok" } else { "FAILED" };
                println!("{} {} ({} ms)", marker, result.test_id, result.duration_ms);
            };
            let suite = runner
                .run_all(&goal, factory, None, Some(&print_result))
                .await?;

            println!(
                "\n{} passed, {} failed of {} ({} ms)",
                suite.passed, suite.failed, suite.total, suite.duration_ms
            );
            for result in suite.results.iter().filter(|r| !r.passed) {
                println!(
                    "  {}: {} [{}]",
                    result.test_id,
                    result.error_message.as_deref().unwrap_or("unknown"),
                    result
                        .error_category
                        .map(|c| c.as_str())
                        .unwrap_or("uncategorized")
                );
            }
            Ok(suite.all_passed())
        }
    }
}
