use thiserror::Error;
use uuid::Uuid;
use wfcore::NodeError;

/// Failures reported by services the node executors call out to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Unknown request: {0}")]
    UnknownRequest(Uuid),
}

impl From<CollaboratorError> for NodeError {
    fn from(e: CollaboratorError) -> Self {
        NodeError::ExecutionFailed(e.to_string())
    }
}
