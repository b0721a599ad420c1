//! Session state and its on-disk store.
//!
//! A [`SessionState`] is an id plus a JSON key/value map. Both engines keep
//! their bookkeeping in it under reserved keys (see [`keys`]), so the whole
//! session survives a save/load round trip through [`SessionStore`] without
//! either engine having to know about persistence. Live handles such as
//! storage backends and child agents are never stored here; they live in the
//! process-local [registries](crate::agent::registry).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::warn;

/// Reserved state keys.
pub mod keys {
    /// Files a child shares with its parent.
    pub const FILES: &str = "files";
    /// Todo list a child shares with its parent.
    pub const TODOS: &str = "todos";
    /// [`SummarizationState`](crate::context::engine::SummarizationState).
    pub const SUMMARIZATION: &str = "_summarization_state";
    /// Session-scoped context window override (tokens).
    pub const CONTEXT_WINDOW: &str = "_context_window";
    /// Map of task id to [`DelegatedTask`](crate::agent::sub_agent::DelegatedTask).
    pub const DELEGATION_TASKS: &str = "_delegation_tasks";
    /// Task ids currently executing.
    pub const RUNNING_TASKS: &str = "_delegation_running_tasks";
    /// Counter behind generated `task_N` ids.
    pub const TASK_COUNTER: &str = "_delegation_task_counter";
    /// Delegation depth of this session; 0 for a top-level session.
    pub const DELEGATION_DEPTH: &str = "_delegation_depth";
    /// Stable id this session uses as a delegation parent.
    pub const LOGICAL_PARENT_ID: &str = "_delegation_parent_id";
}

/// Generate a unique session id.
pub fn generate_session_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ss-{ts:x}-{count:04x}")
}

// ── SessionState ───────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionState {
    id: String,
    #[serde(default)]
    values: Map<String, Value>,
}

/// Session state shared between a host turn loop and the delegation scheduler.
pub type SharedSession = Arc<tokio::sync::Mutex<SessionState>>;

impl SessionState {
    /// A fresh session with a generated id.
    pub fn new() -> Self {
        Self::with_id(generate_session_id())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: Map::new(),
        }
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed read. A value that does not deserialize as `T` reads as `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Session {}: ignoring malformed value at '{key}': {e}", self.id);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), String> {
        let value = serde_json::to_value(value)
            .map_err(|e| format!("Failed to serialize session value '{key}': {e}"))?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn set_raw(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    // ── Typed accessors ────────────────────────────────────────────

    pub fn delegation_depth(&self) -> u32 {
        self.get(keys::DELEGATION_DEPTH).unwrap_or(0)
    }

    pub fn context_window_override(&self) -> Option<usize> {
        self.get(keys::CONTEXT_WINDOW)
    }

    pub fn set_context_window_override(&mut self, window: Option<usize>) {
        match window {
            Some(w) => self.set_raw(keys::CONTEXT_WINDOW, Value::from(w)),
            None => {
                self.remove(keys::CONTEXT_WINDOW);
            }
        }
    }

    // ── Sharing between parent and child ───────────────────────────

    /// Copy of the values at `keys`, skipping absent ones.
    pub fn subset(&self, keys: &[String]) -> Map<String, Value> {
        keys.iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Merge `values` into this state. When both sides hold an object the
    /// incoming entries are merged into it key by key; otherwise the incoming
    /// value replaces the existing one. A `null`, as a value or as an entry,
    /// removes what it names. Returns the keys touched.
    pub fn merge(&mut self, values: Map<String, Value>) -> Vec<String> {
        let mut touched = Vec::with_capacity(values.len());
        for (key, incoming) in values {
            if incoming.is_null() {
                self.values.remove(&key);
                touched.push(key);
                continue;
            }
            match (self.values.get_mut(&key), incoming) {
                (Some(Value::Object(existing)), Value::Object(entries)) => {
                    for (entry, value) in entries {
                        if value.is_null() {
                            existing.remove(&entry);
                        } else {
                            existing.insert(entry, value);
                        }
                    }
                }
                (Some(slot), incoming) => *slot = without_nulls(incoming),
                (None, incoming) => {
                    self.values.insert(key.clone(), without_nulls(incoming));
                }
            }
            touched.push(key);
        }
        touched
    }
}

/// Drop `null` entries from an object; other values pass through.
fn without_nulls(value: Value) -> Value {
    match value {
        Value::Object(entries) => Value::Object(
            entries.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        ),
        other => other,
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

// ── SessionStore ───────────────────────────────────────────────────

/// One JSON file per session under a directory.
///
/// ```text
/// sessions_dir/
///   ss-18c2f0a1b2c3d4e5-0000.json
///   ss-18c2f0a1b2c3d4e5-0001.json
/// ```
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Create a store, ensuring the directory exists.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, String> {
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(format!("Invalid session id: '{id}'"));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// Atomic write: serialize to a temp file, then rename into place.
    pub fn save(&self, state: &SessionState) -> Result<PathBuf, String> {
        let final_path = self.path_for(state.id())?;
        let tmp_path = self.dir.join(format!(".{}.json.tmp", state.id()));

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| format!("Failed to serialize session: {e}"))?;
        std::fs::write(&tmp_path, json).map_err(|e| format!("Failed to write temp session: {e}"))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| format!("Failed to rename session file: {e}"))?;
        Ok(final_path)
    }

    /// Load a session. Returns `None` if it was never saved.
    pub fn load(&self, id: &str) -> Result<Option<SessionState>, String> {
        let path = self.path_for(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let json =
            std::fs::read_to_string(&path).map_err(|e| format!("Failed to read session: {e}"))?;
        let state = serde_json::from_str(&json).map_err(|e| format!("Failed to parse session: {e}"))?;
        Ok(Some(state))
    }

    /// Ids of all saved sessions, sorted.
    pub fn list(&self) -> Result<Vec<String>, String> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| format!("Failed to read sessions dir: {e}"))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| format!("Failed to read entry: {e}"))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Returns whether a file was removed.
    pub fn delete(&self, id: &str) -> Result<bool, String> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(format!("Failed to delete session: {e}")),
        }
    }
}
