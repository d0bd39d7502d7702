use thiserror::Error;
use uuid::Uuid;
use wfcore::{ExecutionStatus, StoreError};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Execution not found: {0}")]
    NotFound(Uuid),

    #[error("Execution {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("Execution {execution_id} is {status}")]
    InvalidState {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Checkpoint error: {0}")]
    Serialization(#[from] serde_json::Error),
}
