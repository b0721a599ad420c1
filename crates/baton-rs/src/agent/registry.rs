//! Process-local registries for handles that cannot live in session state.
//!
//! Session state is plain JSON and may be saved, restored, or moved between
//! processes. Storage backends and live child agents cannot, so they are kept
//! here, keyed by ids that the state does carry:
//!
//! - [`BackendRegistry`] maps a session id to the [`BackendFactory`] that
//!   builds its storage backend.
//! - [`TaskRegistry`] maps `(logical parent id, task id)` to the child
//!   runtime that serves the task.
//!
//! Both are owned through an `Arc` by the [`AgentRuntime`](super::runtime::AgentRuntime)
//! and guarded by a mutex. Entries are removed only through the explicit
//! cleanup calls; there is no automatic expiry.

use crate::agent::session::SessionState;
use crate::agent::sub_agent::ChildRuntime;
use crate::backend::{Backend, BackendFactory};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

// ── BackendRegistry ────────────────────────────────────────────────

#[derive(Default)]
pub struct BackendRegistry {
    factories: Mutex<HashMap<String, BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn factories(&self) -> MutexGuard<'_, HashMap<String, BackendFactory>> {
        self.factories.lock().expect("backend registry lock poisoned")
    }

    /// Register (or replace) the factory for a session.
    pub fn register(&self, session_id: impl Into<String>, factory: BackendFactory) {
        self.factories().insert(session_id.into(), factory);
    }

    pub fn factory_for(&self, session_id: &str) -> Option<BackendFactory> {
        self.factories().get(session_id).cloned()
    }

    /// Build the backend for `session`. The lock is released before the
    /// factory runs.
    pub fn backend_for(&self, session: &SessionState) -> Option<Arc<dyn Backend>> {
        let factory = self.factory_for(session.id())?;
        Some(factory(session))
    }

    /// Returns whether a registration was removed.
    pub fn clear(&self, session_id: &str) -> bool {
        self.factories().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.factories().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

// ── TaskRegistry ───────────────────────────────────────────────────

/// Identifies a delegated task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub parent_id: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(parent_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.parent_id, self.task_id)
    }
}

/// Shared handle to a live child. The async mutex serializes turns on the
/// same task.
pub type ChildHandle = Arc<tokio::sync::Mutex<ChildRuntime>>;

#[derive(Default)]
pub struct TaskRegistry {
    entries: Mutex<HashMap<TaskKey, ChildHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TaskKey, ChildHandle>> {
        self.entries.lock().expect("task registry lock poisoned")
    }

    /// Insert a child, returning the one it replaced.
    pub fn insert(&self, key: TaskKey, handle: ChildHandle) -> Option<ChildHandle> {
        self.entries().insert(key, handle)
    }

    pub fn get(&self, key: &TaskKey) -> Option<ChildHandle> {
        self.entries().get(key).cloned()
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.entries().contains_key(key)
    }

    pub fn remove(&self, key: &TaskKey) -> Option<ChildHandle> {
        self.entries().remove(key)
    }

    /// Remove every child of `parent_id`.
    pub fn remove_parent(&self, parent_id: &str) -> Vec<(TaskKey, ChildHandle)> {
        let mut entries = self.entries();
        let keys: Vec<TaskKey> = entries
            .keys()
            .filter(|k| k.parent_id == parent_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| entries.remove(&k).map(|h| (k, h)))
            .collect()
    }

    /// Task ids registered under `parent_id`, sorted.
    pub fn task_ids(&self, parent_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries()
            .keys()
            .filter(|k| k.parent_id == parent_id)
            .map(|k| k.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::sub_agent::{ChildAgent, TurnFuture, TurnRecorder};
    use crate::backend::MemoryBackend;

    struct Idle;

    impl ChildAgent for Idle {
        fn run_turn<'a>(
            &'a mut self,
            _session: &'a mut SessionState,
            _prompt: &'a str,
            _recorder: &'a TurnRecorder,
        ) -> TurnFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    fn child(task: &str) -> ChildHandle {
        Arc::new(tokio::sync::Mutex::new(ChildRuntime::new(
            Box::new(Idle),
            SessionState::with_id(format!("child-{task}")),
            "general_purpose",
        )))
    }

    #[test]
    fn backend_registration_lifecycle() {
        let registry = BackendRegistry::new();
        let backend = MemoryBackend::new();
        let session = SessionState::with_id("s1");

        assert!(registry.backend_for(&session).is_none());
        registry.register("s1", backend.factory());
        let built = registry.backend_for(&session).unwrap();
        built.write("/x.md", "x").unwrap();
        assert_eq!(backend.read("/x.md").unwrap(), "x");

        assert!(registry.clear("s1"));
        assert!(!registry.clear("s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn task_key_display() {
        assert_eq!(TaskKey::new("p1", "task_1").to_string(), "p1:task_1");
    }

    #[test]
    fn task_registry_scopes_by_parent() {
        let registry = TaskRegistry::new();
        registry.insert(TaskKey::new("p1", "task_1"), child("a"));
        registry.insert(TaskKey::new("p1", "task_2"), child("b"));
        registry.insert(TaskKey::new("p2", "task_1"), child("c"));

        assert!(registry.contains(&TaskKey::new("p2", "task_1")));
        assert!(registry.get(&TaskKey::new("p3", "task_1")).is_none());
        assert_eq!(registry.task_ids("p1"), vec!["task_1", "task_2"]);

        let removed = registry.remove_parent("p1");
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&TaskKey::new("p2", "task_1")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn insert_returns_replaced_handle() {
        let registry = TaskRegistry::new();
        let key = TaskKey::new("p", "t");
        assert!(registry.insert(key.clone(), child("a")).is_none());
        assert!(registry.insert(key, child("b")).is_some());
    }
}
