//! Shared memory: the per-run blackboard and its permission-scoped views.
//!
//! One `SharedMemory` exists per run, owned by the executor. Nodes never see
//! it directly; they receive a `MemoryView` restricted to the node's declared
//! input keys (reads) and output keys (writes). A view is a short-lived
//! capability tied to one `NodeSpec`; violations surface as
//! `EngineError::PermissionDenied` rather than silently returning nothing.
//!
//! A run is strictly sequential, so the inner map is behind a plain `Mutex`
//! only to let views share it; there is never concurrent mutation.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::EngineError;

/// Key→value blackboard for one run.
///
/// **Interaction**: created and owned by `GraphExecutor::execute`; snapshotted
/// into the session token on pause; handed to edges via `read_all`.
#[derive(Debug, Clone, Default)]
pub struct SharedMemory {
    inner: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl SharedMemory {
    /// Empty blackboard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blackboard pre-populated from a snapshot (session resume).
    pub fn from_snapshot(snapshot: BTreeMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(snapshot)),
        }
    }

    /// Reads one key. `None` when absent.
    pub fn read(&self, key: &str) -> Option<Value> {
        self.inner.lock().expect("memory lock").get(key).cloned()
    }

    /// Full snapshot of the blackboard, key-ordered.
    pub fn read_all(&self) -> BTreeMap<String, Value> {
        self.inner.lock().expect("memory lock").clone()
    }

    /// Writes one key, replacing any previous value.
    pub fn write(&self, key: impl Into<String>, value: Value) {
        self.inner
            .lock()
            .expect("memory lock")
            .insert(key.into(), value);
    }

    /// Builds a permission-scoped view over this blackboard.
    ///
    /// The view may read only `read_keys` and write only `write_keys`.
    pub fn with_permissions<I, J, S, T>(&self, read_keys: I, write_keys: J) -> MemoryView
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        MemoryView {
            memory: self.clone(),
            read_keys: read_keys.into_iter().map(Into::into).collect(),
            write_keys: write_keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Permission-scoped view over a `SharedMemory`.
///
/// **Interaction**: built by the executor per node visit from the node's
/// declared `input_keys`/`output_keys`; passed to the node inside
/// `NodeContext`.
#[derive(Debug, Clone)]
pub struct MemoryView {
    memory: SharedMemory,
    read_keys: HashSet<String>,
    write_keys: HashSet<String>,
}

impl MemoryView {
    /// Reads a key the view is permitted to read.
    pub fn read(&self, key: &str) -> Result<Option<Value>, EngineError> {
        if !self.read_keys.contains(key) {
            return Err(EngineError::PermissionDenied {
                key: key.to_string(),
                write: false,
            });
        }
        Ok(self.memory.read(key))
    }

    /// Reads every permitted key that is present, key-ordered.
    pub fn read_permitted(&self) -> BTreeMap<String, Value> {
        let all = self.memory.read_all();
        all.into_iter()
            .filter(|(k, _)| self.read_keys.contains(k))
            .collect()
    }

    /// Writes a key the view is permitted to write.
    pub fn write(&self, key: &str, value: Value) -> Result<(), EngineError> {
        if !self.write_keys.contains(key) {
            return Err(EngineError::PermissionDenied {
                key: key.to_string(),
                write: true,
            });
        }
        self.memory.write(key, value);
        Ok(())
    }

    /// The keys this view may read.
    pub fn read_keys(&self) -> impl Iterator<Item = &str> {
        self.read_keys.iter().map(String::as_str)
    }

    /// The keys this view may write.
    pub fn write_keys(&self) -> impl Iterator<Item = &str> {
        self.write_keys.iter().map(String::as_str)
    }
}
