//! Lookup table for tasks, owned by whoever embeds the engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::task::{DownloadTask, TaskState};

/// Identifier handed out by [`TaskRegistry::insert`].
pub type TaskId = String;

/// Tasks keyed by a generated id.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, Arc<DownloadTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<DownloadTask>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task and return its new id.
    pub fn insert(&self, task: Arc<DownloadTask>) -> TaskId {
        let id = uuid::Uuid::new_v4().to_string();
        self.tasks().insert(id.clone(), task);
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<DownloadTask>> {
        self.tasks().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<DownloadTask>> {
        self.tasks().remove(id)
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// Pause every running task. Returns how many were paused.
    pub async fn pause_running(&self) -> usize {
        let running: Vec<_> = self
            .tasks()
            .iter()
            .filter(|(_, task)| task.state() == TaskState::Running)
            .map(|(id, task)| (id.clone(), task.clone()))
            .collect();

        let mut paused = 0;
        for (id, task) in running {
            match task.pause().await {
                Ok(()) => paused += 1,
                Err(err) => warn!(task = %id, error = %err, "failed to pause task"),
            }
        }
        paused
    }
}
