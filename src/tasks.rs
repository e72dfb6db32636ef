// In-memory task registry — the only component with concurrent readers and
// writers. Readers always get whole-record snapshots; the worker that owns
// a task is the only writer to its progress fields.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::CancelError;
use crate::model::{DownloadTask, TaskStatus};

struct TaskEntry {
    record: DownloadTask,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct TaskTracker {
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending task and return its id.
    pub fn create(&self, total_units: u32) -> String {
        let id = Uuid::new_v4().to_string();
        let record = DownloadTask {
            id: id.clone(),
            status: TaskStatus::Pending,
            progress: 0.0,
            current_unit: None,
            total_units,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };
        self.tasks.write().insert(
            id.clone(),
            TaskEntry {
                record,
                cancel: CancellationToken::new(),
            },
        );
        debug!("task {} created ({} units)", id, total_units);
        id
    }

    pub fn get(&self, id: &str) -> Option<DownloadTask> {
        self.tasks.read().get(id).map(|e| e.record.clone())
    }

    pub fn list(&self) -> Vec<DownloadTask> {
        self.tasks.read().values().map(|e| e.record.clone()).collect()
    }

    /// The task's cancellation token, for the worker that owns it.
    pub fn token(&self, id: &str) -> Option<CancellationToken> {
        self.tasks.read().get(id).map(|e| e.cancel.clone())
    }

    /// Cancel a pending or running task. Cancelling a terminal task is a
    /// conflict and leaves its record unchanged.
    pub fn cancel(&self, id: &str) -> Result<(), CancelError> {
        let mut tasks = self.tasks.write();
        let entry = tasks.get_mut(id).ok_or(CancelError::NotFound)?;
        if entry.record.status.is_terminal() {
            return Err(CancelError::Conflict(entry.record.status.as_str()));
        }
        entry.record.status = TaskStatus::Cancelled;
        entry.record.completed_at = Some(Utc::now());
        entry.cancel.cancel();
        debug!("task {} cancelled", id);
        Ok(())
    }

    pub fn mark_running(&self, id: &str) {
        self.mutate(id, |record| {
            record.status = TaskStatus::Running;
        });
    }

    pub fn set_current_unit(&self, id: &str, unit: u32) {
        self.mutate(id, |record| {
            record.current_unit = Some(unit);
        });
    }

    /// Advance progress. Monotonic and clamped below 100; only `complete`
    /// sets exactly 100.
    pub fn set_progress(&self, id: &str, percent: f64) {
        self.mutate(id, |record| {
            let capped = percent.clamp(0.0, 99.9);
            if capped > record.progress {
                record.progress = capped;
            }
        });
    }

    pub fn complete(&self, id: &str) {
        self.mutate(id, |record| {
            record.status = TaskStatus::Completed;
            record.progress = 100.0;
            record.completed_at = Some(Utc::now());
        });
    }

    pub fn fail(&self, id: &str, message: impl Into<String>) {
        self.mutate(id, |record| {
            record.status = TaskStatus::Failed;
            record.error_message = Some(message.into());
            record.completed_at = Some(Utc::now());
        });
    }

    /// Terminal states are one-way; mutations against them are dropped.
    fn mutate(&self, id: &str, apply: impl FnOnce(&mut DownloadTask)) {
        let mut tasks = self.tasks.write();
        if let Some(entry) = tasks.get_mut(id) {
            if !entry.record.status.is_terminal() {
                apply(&mut entry.record);
            }
        }
    }
}
