//! Unified execution interface and shared types.
//!
//! Defines [`Executor`], the trait every execution backend implements,
//! along with [`ExecutionJob`], [`ProgressSink`], and [`ExecutionError`].

pub mod comfyui;
pub mod standalone;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use miktos_core::task::{FailureKind, TaskError, TaskResult};
use miktos_core::types::TaskId;
use miktos_core::validation::ResolvedParameters;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use comfyui::{ComfyUIExecutor, ComfyUIExecutorConfig};
pub use standalone::StandaloneExecutor;

/// Which backend variant an executor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[serde(rename = "comfyui")]
    ComfyUI,
    Standalone,
}

impl ExecutorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ComfyUI => "comfyui",
            Self::Standalone => "standalone",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "comfyui" => Ok(Self::ComfyUI),
            "standalone" => Ok(Self::Standalone),
            other => Err(format!("unknown executor kind '{other}'")),
        }
    }
}

/// Everything an executor needs to run one task.
#[derive(Debug, Clone)]
pub struct ExecutionJob {
    pub task_id: TaskId,
    pub workflow: String,
    /// Validated and frozen at submission.
    pub parameters: ResolvedParameters,
}

/// Receiver of incremental progress reports.
///
/// Reports from one execution arrive in emission order on the
/// executor's own task. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64, stage: Option<&str>);
}

/// Errors that end an execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The backend could not be reached.
    #[error("Generation service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A connect, request, or overall execution deadline elapsed.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The cancellation token fired.
    #[error("Execution cancelled")]
    Cancelled,

    /// The backend ran but the generation failed, or answered with
    /// something unusable.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The job itself was inconsistent (e.g. parameters missing after
    /// validation).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ServiceUnavailable(_) => FailureKind::ServiceUnavailable,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            Self::ExecutionFailed(_) => FailureKind::ExecutionFailed,
            Self::Internal(_) => FailureKind::Internal,
        }
    }
}

impl From<ExecutionError> for TaskError {
    fn from(err: ExecutionError) -> Self {
        TaskError::new(err.kind(), err.to_string())
    }
}

/// An execution backend.
///
/// `execute` emits zero or more strictly increasing progress reports
/// through `sink`, returns exactly once, and stops emitting as soon as
/// `cancel` fires. A cancelled execution never returns `Ok`.
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Whether the backend is reachable right now.
    async fn check_connection(&self) -> bool;

    /// Model checkpoints the backend can use.
    async fn available_models(&self) -> Result<Vec<String>, ExecutionError>;

    async fn execute(
        &self,
        job: ExecutionJob,
        sink: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TaskResult, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_kind_parses_case_insensitively() {
        assert_eq!("ComfyUI".parse::<ExecutorKind>().unwrap(), ExecutorKind::ComfyUI);
        assert_eq!(" standalone ".parse::<ExecutorKind>().unwrap(), ExecutorKind::Standalone);
        assert!("mock".parse::<ExecutorKind>().is_err());
    }

    #[test]
    fn executor_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ExecutorKind::ComfyUI).unwrap(), "\"comfyui\"");
    }

    #[test]
    fn errors_map_to_failure_kinds() {
        let cases = [
            (ExecutionError::ServiceUnavailable("down".into()), FailureKind::ServiceUnavailable),
            (ExecutionError::Timeout("slow".into()), FailureKind::Timeout),
            (ExecutionError::Cancelled, FailureKind::Cancelled),
            (ExecutionError::ExecutionFailed("oom".into()), FailureKind::ExecutionFailed),
            (ExecutionError::Internal("bug".into()), FailureKind::Internal),
        ];
        for (err, kind) in cases {
            let task_error = TaskError::from(err);
            assert_eq!(task_error.kind, kind);
            assert!(!task_error.message.is_empty());
        }
    }
}
