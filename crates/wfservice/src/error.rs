use thiserror::Error;
use uuid::Uuid;
use wfcore::{CompilationError, DefinitionStatus, ExecutionStatus, StoreError};

#[derive(Error, Debug)]
pub enum WorkflowDefinitionError {
    #[error("Definition {id} is {status}, not DRAFT")]
    NotDraft { id: Uuid, status: DefinitionStatus },

    #[error("Definition {0} has no graph")]
    NoGraph(Uuid),

    #[error("Validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    #[error("Definition not found: {0}")]
    NotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkflowDefinitionError {
    /// Stable code a transport maps to its own error shape.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowDefinitionError::NotDraft { .. } => "NOT_DRAFT",
            WorkflowDefinitionError::NoGraph(_) => "NO_GRAPH",
            WorkflowDefinitionError::ValidationFailed(_) => "VALIDATION_FAILED",
            WorkflowDefinitionError::NotFound(_) => "NOT_FOUND",
            WorkflowDefinitionError::Store(_) => "STORE_ERROR",
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowExecutionError {
    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("Definition {definition_id} is {status}, not ACTIVE")]
    NotActive {
        definition_id: Uuid,
        status: DefinitionStatus,
    },

    #[error("Definition {definition_id} already has {limit} active executions")]
    ConcurrentLimit { definition_id: Uuid, limit: u32 },

    #[error("Definition {0} has no graph")]
    NoGraph(Uuid),

    #[error("Execution {execution_id} is {status}")]
    InvalidStatus {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("Compilation failed: {0}")]
    Compilation(#[from] CompilationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl WorkflowExecutionError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowExecutionError::NotFound(_) => "NOT_FOUND",
            WorkflowExecutionError::NotActive { .. } => "NOT_ACTIVE",
            WorkflowExecutionError::ConcurrentLimit { .. } => "CONCURRENT_LIMIT",
            WorkflowExecutionError::NoGraph(_) => "NO_GRAPH",
            WorkflowExecutionError::InvalidStatus { .. } => "INVALID_STATUS",
            WorkflowExecutionError::Compilation(_) => "COMPILATION_FAILED",
            WorkflowExecutionError::Store(_) => "STORE_ERROR",
        }
    }
}
