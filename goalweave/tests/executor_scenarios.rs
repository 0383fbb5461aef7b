//! Executor integration tests: linear runs, retry, failure edges, budgets,
//! permissions, and the persisted decision trail.


use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Value};

use goalweave::goal::Goal;
use goalweave::graph::{
    EdgeCondition, EdgeSpec, GraphExecutor, GraphSpec, NodeSpec, NodeType,
};
use goalweave::runtime::{DecisionType, Runtime, RunStatus, Severity};
use goalweave::storage::FileStorage;

fn function_node(id: &str, inputs: &[&str], outputs: &[&str]) -> NodeSpec {
    NodeSpec {
        id: id.into(),
        name: id.into(),
        description: String::new(),
        node_type: NodeType::Function,
        input_keys: inputs.iter().map(|s| s.to_string()).collect(),
        output_keys: outputs.iter().map(|s| s.to_string()).collect(),
        system_prompt: None,
        tools: vec![],
        routes: BTreeMap::new(),
    }
}

fn graph(nodes: Vec<NodeSpec>, edges: Vec<EdgeSpec>, entry: &str, terminals: &[&str]) -> GraphSpec {
    GraphSpec {
        id: "graph".into(),
        goal_id: "g1".into(),
        version: "1".into(),
        entry_node: entry.into(),
        terminal_nodes: terminals.iter().map(|s| s.to_string()).collect(),
        pause_nodes: BTreeSet::new(),
        nodes,
        edges,
        max_steps: 20,
        max_retries_per_node: 2,
    }
}

fn goal() -> Goal {
    Goal::new("g1", "demo", "exercise the executor")
}

fn input(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// **Scenario S1**: trivial linear graph: `A` (y = x + 1) then `B`
/// (z = y * 2); success, path [A, B], output {x:3, y:4, z:8}, exactly two
/// decisions, both successful.
#[tokio::test]
async fn linear_graph_runs_to_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let runtime = Arc::new(Runtime::new(Arc::clone(&storage)));
    let mut executor = GraphExecutor::new(runtime);
    executor.register_function("a", |ctx| {
        let x = ctx.memory.read("x")?.and_then(|v| v.as_i64()).unwrap_or(0);
        Ok([("y".to_string(), json!(x + 1))].into_iter().collect())
    });
    executor.register_function("b", |ctx| {
        let y = ctx.memory.read("y")?.and_then(|v| v.as_i64()).unwrap_or(0);
        Ok([("z".to_string(), json!(y * 2))].into_iter().collect())
    });

    let spec = graph(
        vec![function_node("a", &["x"], &["y"]), function_node("b", &["y"], &["z"])],
        vec![EdgeSpec::always("e1", "a", "b")],
        "a",
        &["b"],
    );
    let result = executor.execute(&spec, &goal(), input(&[("x", json!(3))]), None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.path, vec!["a", "b"]);
    assert_eq!(result.output.get("x"), Some(&json!(3)));
    assert_eq!(result.output.get("y"), Some(&json!(4)));
    assert_eq!(result.output.get("z"), Some(&json!(8)));

    let run = storage
        .load_run(result.run_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.decisions.len(), 2);
    assert!(run.decisions.iter().all(|d| d.was_successful()));
    // Path consistency: the recorded metrics mirror the executor's path.
    assert_eq!(run.metrics.nodes_executed, result.path);
    assert_eq!(run.metrics.success_rate, 1.0);
}

/// **Scenario S2**: transient failure: `A` fails on attempt 1 with a rate
/// error and succeeds on attempt 2. One node in the path, a single decision
/// with the failed attempt in its audit trail, no critical problem.
#[tokio::test]
async fn transient_failure_retries_within_one_decision() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let runtime = Arc::new(Runtime::new(Arc::clone(&storage)));
    let mut executor = GraphExecutor::new(runtime);
    executor.register_function("a", |ctx| {
        if ctx.attempt == 1 {
            Err(goalweave::EngineError::RateLimit("rate_limit".into()))
        } else {
            Ok([("y".to_string(), json!(1))].into_iter().collect())
        }
    });

    let spec = graph(
        vec![function_node("a", &["x"], &["y"])],
        vec![],
        "a",
        &["a"],
    );
    let result = executor.execute(&spec, &goal(), input(&[("x", json!(0))]), None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.path, vec!["a"]);

    let run = storage
        .load_run(result.run_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(run.decisions.len(), 1);
    let decision = &run.decisions[0];
    // Audit trail: the first (failed) attempt plus the final outcome.
    assert_eq!(decision.attempts.len(), 1);
    assert!(decision.attempts[0].error.as_deref().unwrap().contains("rate_limit"));
    assert!(decision.was_successful());
    assert!(!run.problems.iter().any(|p| p.severity == Severity::Critical));
}

/// **Scenario S3**: definitive failure routed by an `on_failure` edge: path
/// [A, E], run completed, critical problem recorded.
#[tokio::test]
async fn on_failure_edge_handles_exhausted_node() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let runtime = Arc::new(Runtime::new(Arc::clone(&storage)));
    let mut executor = GraphExecutor::new(runtime);
    executor.register_function("a", |_ctx| {
        Err(goalweave::EngineError::ToolException("upstream broke".into()))
    });
    executor.register_function("b", |_ctx| Ok(BTreeMap::new()));
    executor.register_function("e", |_ctx| {
        Ok([("handled".to_string(), json!(true))].into_iter().collect())
    });

    let spec = graph(
        vec![
            function_node("a", &[], &[]),
            function_node("b", &[], &[]),
            function_node("e", &[], &["handled"]),
        ],
        vec![
            EdgeSpec::new("to_b", "a", "b", EdgeCondition::OnSuccess),
            EdgeSpec::new("to_e", "a", "e", EdgeCondition::OnFailure),
        ],
        "a",
        &["b", "e"],
    );
    let result = executor.execute(&spec, &goal(), BTreeMap::new(), None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.path, vec!["a", "e"]);

    let run = storage
        .load_run(result.run_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run
        .problems
        .iter()
        .any(|p| p.severity == Severity::Critical && p.description.contains("upstream broke")));
    // Taking the failure edge is logged as a recovery decision.
    assert!(run
        .decisions
        .iter()
        .any(|d| d.decision_type == DecisionType::Recovery && d.chosen_option_id == "to_e"));
}

/// **Property**: edge priority determinism: identical memory/result always
/// select the same next node, priority first, declaration order on ties.
#[tokio::test]
async fn edge_selection_is_deterministic() {
    for _ in 0..3 {
        let runtime = Arc::new(Runtime::unpersisted());
        let mut executor = GraphExecutor::new(runtime);
        executor.register_function("a", |_ctx| Ok(BTreeMap::new()));
        executor.register_function("b", |_ctx| Ok(BTreeMap::new()));
        executor.register_function("c", |_ctx| Ok(BTreeMap::new()));

        let spec = graph(
            vec![
                function_node("a", &[], &[]),
                function_node("b", &[], &[]),
                function_node("c", &[], &[]),
            ],
            vec![
                EdgeSpec::always("declared_first", "a", "b"),
                EdgeSpec::always("higher", "a", "c").with_priority(10),
            ],
            "a",
            &["b", "c"],
        );
        let result = executor.execute(&spec, &goal(), BTreeMap::new(), None).await;
        assert_eq!(result.path, vec!["a", "c"], "priority 10 edge must win every time");
    }
}

/// **Property**: permission honouring: reads outside the declared input
/// keys fail the node with `permission_denied`.
#[tokio::test]
async fn undeclared_reads_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let runtime = Arc::new(Runtime::new(Arc::clone(&storage)));
    let mut executor = GraphExecutor::new(runtime);
    executor.register_function("a", |ctx| {
        // Declared to read only "x"; peeking at "secret" must be refused.
        ctx.memory.read("secret")?;
        Ok(BTreeMap::new())
    });

    let spec = graph(
        vec![function_node("a", &["x"], &[])],
        vec![],
        "a",
        &["a"],
    );
    let result = executor
        .execute(
            &spec,
            &goal(),
            input(&[("x", json!(1)), ("secret", json!("hidden"))]),
            None,
        )
        .await;

    // The node fails (after retries) but the run still completes through the
    // normal terminal path; the violation is visible in the decision trail.
    let run = storage
        .load_run(result.run_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    let decision = &run.decisions[0];
    assert!(!decision.was_successful());
    assert!(decision
        .outcome
        .as_ref()
        .unwrap()
        .error
        .as_deref()
        .unwrap()
        .contains("permission denied"));
}

/// Conditional edges read `{memory, result}` through the sandbox.
#[tokio::test]
async fn conditional_edge_routes_on_memory() {
    let runtime = Arc::new(Runtime::unpersisted());
    let mut executor = GraphExecutor::new(runtime);
    executor.register_function("score", |ctx| {
        let x = ctx.memory.read("x")?.and_then(|v| v.as_i64()).unwrap_or(0);
        Ok([("score".to_string(), json!(x * 10))].into_iter().collect())
    });
    executor.register_function("high", |_ctx| Ok(BTreeMap::new()));
    executor.register_function("low", |_ctx| Ok(BTreeMap::new()));

    let spec = graph(
        vec![
            function_node("score", &["x"], &["score"]),
            function_node("high", &[], &[]),
            function_node("low", &[], &[]),
        ],
        vec![
            EdgeSpec::new("to_high", "score", "high", EdgeCondition::Always)
                .with_predicate("result.score >= 50")
                .with_priority(1),
            EdgeSpec::always("to_low", "score", "low"),
        ],
        "score",
        &["high", "low"],
    );

    let result = executor.execute(&spec, &goal(), input(&[("x", json!(7))]), None).await;
    assert_eq!(result.path, vec!["score", "high"]);

    let result = executor.execute(&spec, &goal(), input(&[("x", json!(2))]), None).await;
    assert_eq!(result.path, vec!["score", "low"]);
}

/// The step budget bounds the loop; budget exhaustion completes the run and
/// reports a warning problem.
#[tokio::test]
async fn step_budget_bounds_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let runtime = Arc::new(Runtime::new(Arc::clone(&storage)));
    let mut executor = GraphExecutor::new(runtime);
    executor.register_function("spin", |_ctx| Ok(BTreeMap::new()));

    let mut spec = graph(
        vec![function_node("spin", &[], &[])],
        vec![EdgeSpec::always("loop", "spin", "spin")],
        "spin",
        &[],
    );
    spec.max_steps = 5;

    let result = executor.execute(&spec, &goal(), BTreeMap::new(), None).await;
    assert!(result.success);
    assert_eq!(result.steps_executed, 5);
    assert_eq!(result.path.len(), 5);

    let run = storage
        .load_run(result.run_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert!(run
        .problems
        .iter()
        .any(|p| p.severity == Severity::Warning && p.description.contains("Step budget")));
}

/// Invalid graphs are refused before any side effect: no run is recorded.
#[tokio::test]
async fn invalid_graph_is_refused_without_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let runtime = Arc::new(Runtime::new(Arc::clone(&storage)));
    let executor = GraphExecutor::new(runtime);

    let spec = graph(vec![function_node("a", &[], &[])], vec![], "ghost", &["a"]);
    let result = executor.execute(&spec, &goal(), BTreeMap::new(), None).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("Invalid graph"));
    assert!(result.run_id.is_none());
    assert!(storage.get_runs_by_goal("g1").is_empty());
}

/// **Property**: round-trip persistence: a reloaded run equals itself on
/// repeated loads and every decision carries an outcome.
#[tokio::test]
async fn persisted_runs_reload_value_wise() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let runtime = Arc::new(Runtime::new(Arc::clone(&storage)));
    let mut executor = GraphExecutor::new(runtime);
    executor.register_function("a", |_ctx| {
        Ok([("y".to_string(), json!(1))].into_iter().collect())
    });

    let spec = graph(vec![function_node("a", &[], &["y"])], vec![], "a", &["a"]);
    let result = executor.execute(&spec, &goal(), BTreeMap::new(), None).await;
    let run_id = result.run_id.as_deref().unwrap();

    let first = storage.load_run(run_id).unwrap().unwrap();
    let second = storage.load_run(run_id).unwrap().unwrap();
    assert_eq!(first, second);
    assert!(first.decisions.iter().all(|d| d.has_outcome()));
    assert!(spec.terminal_nodes.contains(first.metrics.nodes_executed.last().unwrap()));
}
