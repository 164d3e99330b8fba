//! In-memory task lifecycle store.
//!
//! [`TaskTracker`] is the single source of truth for task state. Each
//! task lives behind its own mutex inside a read-mostly map, so writes to
//! one task are serialized while different tasks never contend. All
//! operations are synchronous.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{CoreError, CoreResult};
use crate::task::{ProgressEvent, Task, TaskError, TaskResult, TaskState};
use crate::types::{new_task_id, TaskId, Timestamp};
use crate::validation::ResolvedParameters;

#[derive(Default)]
pub struct TaskTracker {
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<Task>>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `queued` task with a freshly allocated id.
    pub fn create(&self, workflow: &str, parameters: ResolvedParameters) -> Task {
        let task = Task::new(new_task_id(), workflow, parameters);
        self.tasks
            .write()
            .insert(task.id, Arc::new(Mutex::new(task.clone())));
        tracing::debug!(task_id = %task.id, workflow, "Task created");
        task
    }

    /// Current snapshot of a task.
    pub fn get(&self, id: TaskId) -> CoreResult<Task> {
        Ok(self.entry(id)?.lock().clone())
    }

    /// Move a `queued` task to `running`.
    pub fn transition_to_running(&self, id: TaskId) -> CoreResult<Task> {
        let entry = self.entry(id)?;
        let mut task = entry.lock();
        if task.state != TaskState::Queued {
            return Err(CoreError::InvalidTransition {
                id,
                from: task.state,
                to: TaskState::Running,
            });
        }
        let now = chrono::Utc::now();
        task.state = TaskState::Running;
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(task.clone())
    }

    /// Record a progress update.
    ///
    /// Applied only while the task is `running` and the (clamped)
    /// fraction is not below the stored one. Returns the resulting event
    /// when applied, `None` when the update was ignored.
    pub fn record_progress(
        &self,
        id: TaskId,
        fraction: f64,
        stage: Option<&str>,
    ) -> CoreResult<Option<ProgressEvent>> {
        let entry = self.entry(id)?;
        let mut task = entry.lock();
        if task.state != TaskState::Running || fraction.is_nan() {
            return Ok(None);
        }
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction < task.progress {
            tracing::trace!(task_id = %id, fraction, stored = task.progress, "Ignoring regressing progress");
            return Ok(None);
        }
        task.progress = fraction;
        if let Some(stage) = stage {
            task.stage = Some(stage.to_string());
        }
        task.updated_at = chrono::Utc::now();
        Ok(Some(task.to_event()))
    }

    /// Mark a `running` task `succeeded`.
    ///
    /// Returns the terminal snapshot if this call won, `None` if the task
    /// had already reached a terminal state.
    pub fn complete(&self, id: TaskId, result: TaskResult) -> CoreResult<Option<Task>> {
        self.finish(id, TaskState::Succeeded, |task| {
            task.progress = 1.0;
            task.result = Some(result);
        })
    }

    /// Mark a `running` task `failed`. Same first-wins rules as
    /// [`complete`](Self::complete).
    pub fn fail(&self, id: TaskId, error: TaskError) -> CoreResult<Option<Task>> {
        self.finish(id, TaskState::Failed, |task| {
            task.error = Some(error);
        })
    }

    /// Snapshots of every retained task, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let entries: Vec<_> = self.tasks.read().values().cloned().collect();
        let mut tasks: Vec<Task> = entries.iter().map(|e| e.lock().clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Number of tasks that have not reached a terminal state.
    pub fn active_count(&self) -> usize {
        let entries: Vec<_> = self.tasks.read().values().cloned().collect();
        entries.iter().filter(|e| !e.lock().is_terminal()).count()
    }

    /// Ids of tasks that are currently `running`.
    pub fn running_ids(&self) -> Vec<TaskId> {
        let entries: Vec<_> = self.tasks.read().values().cloned().collect();
        entries
            .iter()
            .filter_map(|e| {
                let task = e.lock();
                (task.state == TaskState::Running).then_some(task.id)
            })
            .collect()
    }

    /// Remove terminal tasks that finished before `cutoff`.
    ///
    /// Non-terminal tasks are never evicted. Returns the number removed.
    pub fn evict_finished_before(&self, cutoff: Timestamp) -> usize {
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, entry| {
            let task = entry.lock();
            !matches!(task.finished_at, Some(finished) if task.is_terminal() && finished < cutoff)
        });
        before - tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- private helpers ----

    fn entry(&self, id: TaskId) -> CoreResult<Arc<Mutex<Task>>> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::task_not_found(id))
    }

    fn finish(
        &self,
        id: TaskId,
        to: TaskState,
        apply: impl FnOnce(&mut Task),
    ) -> CoreResult<Option<Task>> {
        let entry = self.entry(id)?;
        let mut task = entry.lock();
        match task.state {
            TaskState::Running => {
                let now = chrono::Utc::now();
                apply(&mut *task);
                task.state = to;
                task.finished_at = Some(now);
                task.updated_at = now;
                tracing::debug!(task_id = %id, state = %to, "Task finished");
                Ok(Some(task.clone()))
            }
            state if state.is_terminal() => {
                tracing::debug!(task_id = %id, current = %state, attempted = %to, "Ignoring duplicate terminal write");
                Ok(None)
            }
            from => Err(CoreError::InvalidTransition { id, from, to }),
        }
    }
}
