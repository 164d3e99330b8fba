//! Task lifecycle model.
//!
//! A [`Task`] is one execution instance of a workflow. Its state only
//! moves forward: `queued -> running -> {succeeded | failed}`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{TaskId, Timestamp};
use crate::validation::ResolvedParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    /// `succeeded` and `failed` are terminal; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The generation backend could not be reached.
    ServiceUnavailable,
    /// The backend did not answer or finish within the configured bounds.
    Timeout,
    /// Explicit cancellation.
    Cancelled,
    /// The backend ran but the generation itself failed.
    ExecutionFailed,
    /// Internal-consistency failure inside the bridge.
    Internal,
}

impl FailureKind {
    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ServiceUnavailable | Self::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: FailureKind,
    /// Never empty.
    pub message: String,
}

impl TaskError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            format!("{kind:?}")
        } else {
            message
        };
        Self { kind, message }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Task was cancelled")
    }
}

/// Reference to one generated artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRef {
    /// File name or path as reported by the executor.
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_type: Option<String>,
    /// Backend node that produced the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfolder: Option<String>,
}

/// Structured output of a successful execution.
///
/// Every executor variant produces this same shape so downstream
/// consumers never need to know which one ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub outputs: Vec<OutputRef>,
    /// Backend-side identifiers (e.g. ComfyUI prompt ids).
    #[serde(default)]
    pub backend_refs: Vec<String>,
    /// Generation metadata (prompt, size, seed, model, ...).
    pub metadata: serde_json::Value,
    pub execution_ms: u64,
}

/// Snapshot of a task's lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workflow: String,
    pub parameters: ResolvedParameters,
    pub state: TaskState,
    /// Fraction in `[0.0, 1.0]`, never decreasing.
    pub progress: f64,
    /// Label of the most recent progress stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Present only when `succeeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    /// Present only when `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl Task {
    pub fn new(id: TaskId, workflow: impl Into<String>, parameters: ResolvedParameters) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            workflow: workflow.into(),
            parameters,
            state: TaskState::Queued,
            progress: 0.0,
            stage: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The event a subscriber sees for this task's current state.
    pub fn to_event(&self) -> ProgressEvent {
        ProgressEvent {
            task_id: self.id,
            state: self.state,
            progress: self.progress,
            stage: self.stage.clone(),
            error: self.error.clone(),
            timestamp: self.updated_at,
        }
    }
}

/// Incremental progress signal for one task.
///
/// The last event of every subscription is a synthetic one whose
/// `state` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub state: TaskState,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&TaskState::Succeeded).unwrap(), "\"succeeded\"");
        assert_eq!(
            serde_json::to_string(&FailureKind::ServiceUnavailable).unwrap(),
            "\"service_unavailable\""
        );
    }

    #[test]
    fn task_error_message_is_never_empty() {
        let err = TaskError::new(FailureKind::ExecutionFailed, "  ");
        assert!(!err.message.trim().is_empty());
    }

    #[test]
    fn retryable_kinds() {
        assert!(FailureKind::ServiceUnavailable.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
        assert!(!FailureKind::ExecutionFailed.is_retryable());
    }

    #[test]
    fn new_task_is_queued_with_zero_progress() {
        let task = Task::new(crate::types::new_task_id(), "basic_texture", Default::default());
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.progress, 0.0);
        assert!(task.result.is_none() && task.error.is_none());

        let event = task.to_event();
        assert_eq!(event.task_id, task.id);
        assert!(!event.is_terminal());
    }
}
