use thiserror::Error;

/// Raised only by the graph compiler. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompilationError {
    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("Cycle detected: only {sorted} of {total} nodes could be ordered")]
    CycleDetected { sorted: usize, total: usize },

    #[error("Connection '{connection}' references unknown node '{node}'")]
    DanglingReference { connection: String, node: String },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Missing config: {0}")]
    MissingConfig(String),

    #[error("Invalid config for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        NodeError::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Timeouts and cancellations end the execution; they are never routed
    /// down an `error` port or retried.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, NodeError::Timeout { .. } | NodeError::Cancelled)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Store backend failure: {0}")]
    Backend(String),
}
