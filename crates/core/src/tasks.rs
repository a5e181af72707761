//! Shared store for long-running background actions (searches, fetches).
//!
//! The store is constructor-injected into whatever component needs it —
//! there is no global registry — so tests can substitute a fresh store per
//! case. A task is created on dispatch, mutated only by its owning worker
//! and by an explicit cancel, and garbage-collected once a terminal state
//! has been queried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Succeeded,
    NotFound,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: String,
    pub status: TaskStatus,
    /// Completion percentage, 0..=100.
    pub progress: u8,
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Cloneable handle to the shared task map.
#[derive(Clone, Default)]
pub struct TaskStore {
    inner: Arc<Mutex<HashMap<String, TaskState>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new running task under the given id.
    pub fn begin(&self, id: impl Into<String>) -> TaskState {
        let state = TaskState {
            id: id.into(),
            status: TaskStatus::Running,
            progress: 0,
            result: None,
            started_at: Utc::now(),
        };
        self.inner
            .lock()
            .expect("task store poisoned")
            .insert(state.id.clone(), state.clone());
        state
    }

    pub fn update_progress(&self, id: &str, progress: u8) {
        let mut map = self.inner.lock().expect("task store poisoned");
        if let Some(state) = map.get_mut(id)
            && state.status == TaskStatus::Running
        {
            state.progress = progress.min(100);
        }
    }

    /// Moves a task to a terminal state with its result text.
    pub fn finish(&self, id: &str, status: TaskStatus, result: Option<String>) {
        let mut map = self.inner.lock().expect("task store poisoned");
        if let Some(state) = map.get_mut(id)
            && state.status == TaskStatus::Running
        {
            state.status = status;
            state.result = result;
            if status == TaskStatus::Succeeded {
                state.progress = 100;
            }
        }
    }

    /// Cancels a running task. Terminal tasks are left untouched.
    pub fn cancel(&self, id: &str) -> bool {
        let mut map = self.inner.lock().expect("task store poisoned");
        match map.get_mut(id) {
            Some(state) if state.status == TaskStatus::Running => {
                state.status = TaskStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Queries a task. A terminal task is removed on query; a running task
    /// stays registered so its worker can keep updating it.
    pub fn take(&self, id: &str) -> Option<TaskState> {
        let mut map = self.inner.lock().expect("task store poisoned");
        let terminal = map.get(id).map(|s| s.status.is_terminal())?;
        if terminal {
            map.remove(id)
        } else {
            map.get(id).cloned()
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("task store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_take_cycle() {
        let store = TaskStore::new();
        store.begin("t1");

        // Running tasks survive a query.
        let running = store.take("t1").unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(store.len(), 1);

        // Terminal tasks are garbage-collected on query.
        store.finish("t1", TaskStatus::Succeeded, Some("done".into()));
        let finished = store.take("t1").unwrap();
        assert_eq!(finished.status, TaskStatus::Succeeded);
        assert_eq!(finished.progress, 100);
        assert_eq!(finished.result.as_deref(), Some("done"));
        assert!(store.is_empty());
        assert!(store.take("t1").is_none());
    }

    #[test]
    fn cancel_only_affects_running_tasks() {
        let store = TaskStore::new();
        store.begin("t1");
        assert!(store.cancel("t1"));
        assert!(!store.cancel("t1"), "already cancelled");
        assert!(!store.cancel("missing"));

        let state = store.take("t1").unwrap();
        assert_eq!(state.status, TaskStatus::Cancelled);
    }

    #[test]
    fn progress_is_clamped_and_frozen_after_finish() {
        let store = TaskStore::new();
        store.begin("t1");
        store.update_progress("t1", 250);
        assert_eq!(store.take("t1").unwrap().progress, 100);

        store.finish("t1", TaskStatus::Failed, None);
        store.update_progress("t1", 10);
        assert_eq!(store.take("t1").unwrap().progress, 100);
    }

    #[test]
    fn stores_are_independent() {
        let a = TaskStore::new();
        let b = TaskStore::new();
        a.begin("t1");
        assert!(b.is_empty());
    }
}
