use crate::task::TaskState;
use crate::types::TaskId;
use crate::validation::ValidationErrors;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Invalid transition for task {id}: {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn workflow_not_found(name: &str) -> Self {
        Self::NotFound {
            entity: "Workflow",
            id: name.to_string(),
        }
    }

    pub fn task_not_found(id: TaskId) -> Self {
        Self::NotFound {
            entity: "Task",
            id: id.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
