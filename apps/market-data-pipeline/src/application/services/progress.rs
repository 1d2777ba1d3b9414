//! Progress tracking for long-running tasks such as backfills.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

/// Message recorded on tasks interrupted by process shutdown.
pub const TERMINATED_MESSAGE: &str = "program terminated";

/// Lifecycle of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Still running.
    InProgress,
    /// Finished successfully.
    Success,
    /// Finished with an error or was interrupted.
    Failed,
}

/// Snapshot of one tracked task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    /// Task id.
    pub id: Uuid,
    /// Human-readable name, e.g. `backfill crypto:BTCUSDT`.
    pub name: String,
    /// Units of work expected.
    pub total: u64,
    /// Units of work done.
    pub done: u64,
    /// Current status.
    pub status: TaskStatus,
    /// Final or failure message.
    pub message: Option<String>,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl TaskProgress {
    /// Completion ratio in `[0, 1]`. A task with no expected work is done
    /// once it leaves `InProgress`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return if self.status == TaskStatus::InProgress { 0.0 } else { 1.0 };
        }
        (self.done as f64 / self.total as f64).min(1.0)
    }
}

/// Registry of tracked tasks.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    tasks: RwLock<HashMap<Uuid, TaskProgress>>,
}

impl ProgressTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and return its id.
    pub fn create(&self, name: impl Into<String>, total: u64) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.tasks.write().insert(
            id,
            TaskProgress {
                id,
                name: name.into(),
                total,
                done: 0,
                status: TaskStatus::InProgress,
                message: None,
                started_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Add `by` units of done work. Ignored for unknown or finished tasks.
    pub fn increment(&self, id: Uuid, by: u64) {
        if let Some(task) = self.tasks.write().get_mut(&id) {
            if task.status == TaskStatus::InProgress {
                task.done = task.done.saturating_add(by);
                task.updated_at = Utc::now();
            }
        }
    }

    /// Set the expected total once it is known.
    pub fn set_total(&self, id: Uuid, total: u64) {
        if let Some(task) = self.tasks.write().get_mut(&id) {
            task.total = total;
            task.updated_at = Utc::now();
        }
    }

    /// Finish a task.
    pub fn complete(&self, id: Uuid, status: TaskStatus, message: Option<String>) {
        if let Some(task) = self.tasks.write().get_mut(&id) {
            task.status = status;
            task.message = message;
            task.updated_at = Utc::now();
        }
    }

    /// Forget a task.
    pub fn remove(&self, id: Uuid) -> Option<TaskProgress> {
        self.tasks.write().remove(&id)
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<TaskProgress> {
        self.tasks.read().get(&id).cloned()
    }

    /// Snapshot of every task, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<TaskProgress> {
        let mut tasks: Vec<_> = self.tasks.read().values().cloned().collect();
        tasks.sort_by_key(|task| task.started_at);
        tasks
    }

    /// Number of tasks still in progress.
    #[must_use]
    pub fn in_progress(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|task| task.status == TaskStatus::InProgress)
            .count()
    }

    /// Mark every in-progress task failed. Returns how many were marked.
    pub fn fail_in_progress(&self) -> usize {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let mut marked = 0;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Failed;
                task.message = Some(TERMINATED_MESSAGE.to_string());
                task.updated_at = now;
                marked += 1;
            }
        }
        if marked > 0 {
            tracing::warn!(count = marked, "Marked unfinished tasks as failed");
        }
        marked
    }
}
