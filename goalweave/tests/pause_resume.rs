//! Pause/resume integration tests: the session token round trip.


use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Value};

use goalweave::goal::Goal;
use goalweave::graph::{EdgeSpec, GraphExecutor, GraphSpec, NodeSpec, NodeType};
use goalweave::runtime::{Runtime, RunStatus};
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

/// `a` → pause `p` → `b` (terminal).
fn pausing_graph() -> GraphSpec {
    GraphSpec {
        id: "graph".into(),
        goal_id: "g1".into(),
        version: "1".into(),
        entry_node: "a".into(),
        terminal_nodes: ["b".to_string()].into_iter().collect(),
        pause_nodes: ["p".to_string()].into_iter().collect(),
        nodes: vec![
            function_node("a", &["x"], &["prepared"]),
            function_node("p", &["prepared"], &["question"]),
            function_node("b", &["answer"], &["done"]),
        ],
        edges: vec![
            EdgeSpec::always("e1", "a", "p"),
            EdgeSpec::always("e2", "p", "b"),
        ],
        max_steps: 10,
        max_retries_per_node: 2,
    }
}

fn executor(storage: Arc<FileStorage>) -> GraphExecutor {
    let runtime = Arc::new(Runtime::new(storage));
    let mut executor = GraphExecutor::new(runtime);
    executor.register_function("a", |ctx| {
        let x = ctx.memory.read("x")?.and_then(|v| v.as_i64()).unwrap_or(0);
        Ok([("prepared".to_string(), json!(x + 100))].into_iter().collect())
    });
    executor.register_function("p", |_ctx| {
        Ok([("question".to_string(), json!("proceed?"))].into_iter().collect())
    });
    executor.register_function("b", |ctx| {
        let answer = ctx.memory.read("answer")?.unwrap_or(Value::Null);
        Ok([("done".to_string(), answer)].into_iter().collect())
    });
    executor
}

fn input(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// **Scenario S4**: first call pauses at `p` with the memory snapshot in the
/// session token; the second call resumes with the user's answer and
/// completes with both the original and the new inputs in the output.
#[tokio::test]
async fn pause_then_resume_completes_with_merged_memory() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let exec = executor(Arc::clone(&storage));
    let goal = Goal::new("g1", "hitl", "pause for approval");

    let first = exec
        .execute(&pausing_graph(), &goal, input(&[("x", json!(1))]), None)
        .await;
    assert!(first.success, "{:?}", first.error);
    assert_eq!(first.paused_at.as_deref(), Some("p"));
    assert_eq!(first.path, vec!["a", "p"]);

    let session = first.session_state.clone().expect("session state on pause");
    assert_eq!(session.paused_at, "p");
    assert_eq!(session.resume_from, "p_resume");
    assert_eq!(session.memory.get("x"), Some(&json!(1)));
    assert_eq!(session.memory.get("prepared"), Some(&json!(101)));
    assert_eq!(session.next_node, None);

    // The paused run is stored with the distinct paused status.
    let paused_run = storage
        .load_run(first.run_id.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(paused_run.status, RunStatus::Paused);

    let second = exec
        .execute(
            &pausing_graph(),
            &goal,
            input(&[("answer", json!("yes"))]),
            Some(session),
        )
        .await;
    assert!(second.success, "{:?}", second.error);
    // No dedicated resume entry in this graph, so execution re-enters at `p`.
    assert_eq!(second.path.first().map(String::as_str), Some("p"));
    assert_eq!(second.output.get("x"), Some(&json!(1)));
    assert_eq!(second.output.get("answer"), Some(&json!("yes")));
    assert_eq!(second.output.get("done"), Some(&json!("yes")));
}

/// **Property**: resume idempotence: the same session token yields the same
/// resumed path and output every time.
#[tokio::test]
async fn resuming_the_same_token_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let exec = executor(Arc::clone(&storage));
    let goal = Goal::new("g1", "hitl", "pause for approval");

    let paused = exec
        .execute(&pausing_graph(), &goal, input(&[("x", json!(5))]), None)
        .await;
    let session = paused.session_state.expect("session state");

    let resume_a = exec
        .execute(
            &pausing_graph(),
            &goal,
            input(&[("answer", json!("ok"))]),
            Some(session.clone()),
        )
        .await;
    let resume_b = exec
        .execute(
            &pausing_graph(),
            &goal,
            input(&[("answer", json!("ok"))]),
            Some(session),
        )
        .await;

    assert_eq!(resume_a.path, resume_b.path);
    assert_eq!(resume_a.output, resume_b.output);
}

/// A dedicated `<pause>_resume` node, when the graph declares one, becomes
/// the resume entry point.
#[tokio::test]
async fn dedicated_resume_entry_is_preferred() {
    let mut graph = pausing_graph();
    graph.nodes.push(function_node("p_resume", &["answer"], &["checked"]));
    graph.edges.push(EdgeSpec::always("e3", "p_resume", "b"));

    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FileStorage::new(dir.path()).unwrap());
    let mut exec = executor(Arc::clone(&storage));
    exec.register_function("p_resume", |ctx| {
        let answer = ctx.memory.read("answer")?.unwrap_or(Value::Null);
        Ok([("checked".to_string(), answer)].into_iter().collect())
    });
    let goal = Goal::new("g1", "hitl", "pause for approval");

    let paused = exec
        .execute(&graph, &goal, input(&[("x", json!(1))]), None)
        .await;
    let session = paused.session_state.expect("session state");

    let resumed = exec
        .execute(&graph, &goal, input(&[("answer", json!("go"))]), Some(session))
        .await;
    assert!(resumed.success, "{:?}", resumed.error);
    assert_eq!(resumed.path.first().map(String::as_str), Some("p_resume"));
    assert_eq!(resumed.output.get("checked"), Some(&json!("go")));
}
