//! Per-run session state.
//!
//! A `Session` is created before a coordinator run, threaded explicitly
//! through every step, and dropped afterwards. Nothing is shared between
//! runs.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

/// Read-only view handed to concurrently running branches.
pub type StateSnapshot = Arc<HashMap<String, String>>;

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    state: HashMap<String, String>,
}

impl Session {
    /// New session with a unique id, e.g. `tool_session_<uuid>`.
    pub fn new(scope: &str) -> Self {
        Self {
            id: format!("{}_session_{}", scope, Uuid::new_v4()),
            state: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.state.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    /// Later writes of the same key overwrite; the previous value is returned.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.state.insert(key.into(), value.into())
    }

    /// Apply a batch of branch outputs at once.
    pub fn merge<I>(&mut self, writes: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.state.extend(writes);
    }

    pub fn state(&self) -> &HashMap<String, String> {
        &self.state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        Arc::new(self.state.clone())
    }

    pub fn into_state(self) -> HashMap<String, String> {
        self.state
    }
}
