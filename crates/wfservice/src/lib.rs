//! Workflow services
//!
//! Definition lifecycle (draft, publish, archive, versions) and execution
//! orchestration (start, cancel, retry) on top of the stores and the
//! execution runtime. A transport layer maps the error codes.

mod definition;
mod error;
mod execution;

pub use definition::WorkflowDefinitionService;
pub use error::{WorkflowDefinitionError, WorkflowExecutionError};
pub use execution::{StartExecution, WorkflowExecutionService};
