use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Machine not found: {0}")]
    MachineNotFound(Uuid),

    #[error("Target not found: {0}")]
    TargetNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Series not found: {0}")]
    SeriesNotFound(Uuid),

    #[error("Series already exists: {0}")]
    SeriesExists(Uuid),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: Uuid,
        from: &'static str,
        to: &'static str,
    },

    #[error("Task not active: {0}")]
    TaskNotActive(Uuid),

    #[error("Machine {machine} is at its task limit of {limit}")]
    CapacityExceeded { machine: Uuid, limit: usize },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Coarse taxonomy bucket, used by the HTTP layer for status mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::MachineNotFound(_)
            | HubError::TargetNotFound(_)
            | HubError::TaskNotFound(_)
            | HubError::SeriesNotFound(_) => ErrorKind::NotFound,
            HubError::SeriesExists(_)
            | HubError::InvalidTransition { .. }
            | HubError::TaskNotActive(_) => ErrorKind::Conflict,
            HubError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            HubError::InvalidValue(_) => ErrorKind::InvalidValue,
            HubError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    CapacityExceeded,
    InvalidValue,
    Internal,
}

pub type Result<T> = std::result::Result<T, HubError>;
