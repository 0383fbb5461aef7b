//! File-backed storage: append-only run files plus rebuildable indices.
//!
//! Layout under the root directory:
//!
//! ```text
//! runs/<run_id>.jsonl        header line, one decision per line, problem lines
//! index/by_goal.json         goal_id -> [run_id]
//! index/by_status.json       status  -> [run_id]
//! index/by_node.json         node_id -> [run_id]
//! tests/<goal_id>/<test_id>.json
//! results/<test_id>.jsonl    append-only result history; last line is latest
//! ```
//!
//! Writes are atomic at run granularity: the run file is written to a `.tmp`
//! sibling and renamed into place, so a crashed write leaves either the prior
//! version or a complete new one. Index files are rewritten after each save
//! and rebuilt from the canonical run files when missing or unparsable.
//!
//! **Interaction**: `Runtime::end_run` flushes here; `BuilderQuery` and the
//! test harness read from here after the fact.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::runtime::{Decision, Problem, Run, RunStatus, RunSummary};
use crate::testing::{ApprovalStatus, Test, TestResult};

/// One line of a run file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RunRecord {
    /// Run fields with `decisions`/`problems` emptied.
    Header { run: Run },
    Decision { decision: Decision },
    Problem { problem: Problem },
}

type IndexMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default)]
struct Indices {
    by_goal: IndexMap,
    by_status: IndexMap,
    by_node: IndexMap,
}

/// File storage with secondary indices by goal, status, and node.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    indices: Mutex<Indices>,
}

impl FileStorage {
    /// Opens (or creates) a storage root. Indices are loaded from disk, or
    /// rebuilt by scanning `runs/` when missing or inconsistent.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let root = root.into();
        for sub in ["runs", "index", "tests", "results"] {
            fs::create_dir_all(root.join(sub))?;
        }
        let storage = Self {
            root,
            indices: Mutex::new(Indices::default()),
        };
        storage.load_or_rebuild_indices()?;
        Ok(storage)
    }

    /// Storage root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // === Runs ===

    /// Persists a run atomically (tmp + rename) and updates the indices.
    pub fn save_run(&self, run: &Run) -> Result<(), EngineError> {
        let mut lines = Vec::with_capacity(run.decisions.len() + run.problems.len() + 1);

        let mut header = run.clone();
        header.decisions = Vec::new();
        header.problems = Vec::new();
        lines.push(serde_json::to_string(&RunRecord::Header { run: header })?);
        for decision in &run.decisions {
            lines.push(serde_json::to_string(&RunRecord::Decision {
                decision: decision.clone(),
            })?);
        }
        for problem in &run.problems {
            lines.push(serde_json::to_string(&RunRecord::Problem {
                problem: problem.clone(),
            })?);
        }

        let path = self.run_path(&run.id);
        write_atomic(&path, &(lines.join("\n") + "\n"))?;
        debug!(run_id = %run.id, lines = lines.len(), "saved run");

        self.index_run(run);
        self.flush_indices()?;
        Ok(())
    }

    /// Loads a run with its full decision trail. `None` when absent.
    pub fn load_run(&self, run_id: &str) -> Result<Option<Run>, EngineError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let mut run: Option<Run> = None;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<RunRecord>(line)? {
                RunRecord::Header { run: header } => run = Some(header),
                RunRecord::Decision { decision } => {
                    if let Some(r) = run.as_mut() {
                        r.decisions.push(decision);
                    }
                }
                RunRecord::Problem { problem } => {
                    if let Some(r) = run.as_mut() {
                        r.problems.push(problem);
                    }
                }
            }
        }
        Ok(run)
    }

    /// Loads the listing projection of a run. `None` when absent.
    pub fn load_summary(&self, run_id: &str) -> Result<Option<RunSummary>, EngineError> {
        Ok(self.load_run(run_id)?.map(|r| r.summary()))
    }

    /// Run ids recorded for a goal, in save order.
    pub fn get_runs_by_goal(&self, goal_id: &str) -> Vec<String> {
        self.indices
            .lock()
            .expect("index lock")
            .by_goal
            .get(goal_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Run ids with the given final status.
    pub fn get_runs_by_status(&self, status: RunStatus) -> Vec<String> {
        self.indices
            .lock()
            .expect("index lock")
            .by_status
            .get(status.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Run ids whose path visited the given node.
    pub fn get_runs_by_node(&self, node_id: &str) -> Vec<String> {
        self.indices
            .lock()
            .expect("index lock")
            .by_node
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }

    // === Tests ===

    /// Persists a test under its goal.
    pub fn save_test(&self, test: &Test) -> Result<(), EngineError> {
        let dir = self.root.join("tests").join(&test.goal_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", test.id));
        write_atomic(&path, &serde_json::to_string_pretty(test)?)?;
        Ok(())
    }

    /// Overwrites a stored test (approval changes, result bookkeeping).
    pub fn update_test(&self, test: &Test) -> Result<(), EngineError> {
        self.save_test(test)
    }

    /// Loads one test. `None` when absent.
    pub fn load_test(&self, goal_id: &str, test_id: &str) -> Result<Option<Test>, EngineError> {
        let path = self
            .root
            .join("tests")
            .join(goal_id)
            .join(format!("{test_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let test = serde_json::from_str(&fs::read_to_string(&path)?)?;
        Ok(Some(test))
    }

    /// All runnable (approved or modified) tests for a goal, id-ordered.
    pub fn get_approved_tests(&self, goal_id: &str) -> Result<Vec<Test>, EngineError> {
        Ok(self
            .load_goal_tests(goal_id)?
            .into_iter()
            .filter(|t| t.approval.is_runnable())
            .collect())
    }

    /// All tests for a goal still awaiting review, id-ordered.
    pub fn get_pending_tests(&self, goal_id: &str) -> Result<Vec<Test>, EngineError> {
        Ok(self
            .load_goal_tests(goal_id)?
            .into_iter()
            .filter(|t| t.approval == ApprovalStatus::Pending)
            .collect())
    }

    /// Appends a result to the test's history file.
    pub fn save_result(&self, test_id: &str, result: &TestResult) -> Result<(), EngineError> {
        let path = self.root.join("results").join(format!("{test_id}.jsonl"));
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(result)?)?;
        Ok(())
    }

    /// The most recent result for a test. `None` when never run.
    pub fn get_latest_result(&self, test_id: &str) -> Result<Option<TestResult>, EngineError> {
        let path = self.root.join("results").join(format!("{test_id}.jsonl"));
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        match text.lines().filter(|l| !l.trim().is_empty()).last() {
            Some(line) => Ok(Some(serde_json::from_str(line)?)),
            None => Ok(None),
        }
    }

    // === Internals ===

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.jsonl"))
    }

    fn load_goal_tests(&self, goal_id: &str) -> Result<Vec<Test>, EngineError> {
        let dir = self.root.join("tests").join(goal_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut tests = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match serde_json::from_str::<Test>(&fs::read_to_string(&path)?) {
                Ok(test) => tests.push(test),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable test"),
            }
        }
        tests.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tests)
    }

    fn index_run(&self, run: &Run) {
        let mut indices = self.indices.lock().expect("index lock");
        push_unique(indices.by_goal.entry(run.goal_id.clone()).or_default(), &run.id);
        // A run appears under exactly one status: drop it from the others first.
        for ids in indices.by_status.values_mut() {
            ids.retain(|id| id != &run.id);
        }
        push_unique(
            indices
                .by_status
                .entry(run.status.as_str().to_string())
                .or_default(),
            &run.id,
        );
        for node_id in &run.metrics.nodes_executed {
            push_unique(indices.by_node.entry(node_id.clone()).or_default(), &run.id);
        }
    }

    fn flush_indices(&self) -> Result<(), EngineError> {
        let indices = self.indices.lock().expect("index lock");
        let dir = self.root.join("index");
        write_atomic(&dir.join("by_goal.json"), &serde_json::to_string(&indices.by_goal)?)?;
        write_atomic(
            &dir.join("by_status.json"),
            &serde_json::to_string(&indices.by_status)?,
        )?;
        write_atomic(&dir.join("by_node.json"), &serde_json::to_string(&indices.by_node)?)?;
        Ok(())
    }

    fn load_or_rebuild_indices(&self) -> Result<(), EngineError> {
        let dir = self.root.join("index");
        let loaded = (
            read_index(&dir.join("by_goal.json")),
            read_index(&dir.join("by_status.json")),
            read_index(&dir.join("by_node.json")),
        );
        if let (Some(by_goal), Some(by_status), Some(by_node)) = loaded {
            let mut indices = self.indices.lock().expect("index lock");
            indices.by_goal = by_goal;
            indices.by_status = by_status;
            indices.by_node = by_node;
            return Ok(());
        }

        warn!(root = %self.root.display(), "index files missing or unreadable, rebuilding from runs");
        self.rebuild_indices()
    }

    /// Rebuilds all indices by scanning the canonical run files.
    pub fn rebuild_indices(&self) -> Result<(), EngineError> {
        {
            let mut indices = self.indices.lock().expect("index lock");
            *indices = Indices::default();
        }
        let runs_dir = self.root.join("runs");
        let mut paths: Vec<PathBuf> = fs::read_dir(&runs_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jsonl"))
            .collect();
        paths.sort();
        for path in paths {
            let run_id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            match self.load_run(&run_id) {
                Ok(Some(run)) => self.index_run(&run),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable run"),
            }
        }
        self.flush_indices()
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

fn read_index(path: &Path) -> Option<IndexMap> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), EngineError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
