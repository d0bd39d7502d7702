//! Core abstractions for the workflow engine
//!
//! Graph model, compiler, execution plan, node executor capability,
//! persisted records and store seams. Every other crate depends on this
//! one; it knows nothing about how plans are driven.

pub mod compiler;
mod error;
pub mod events;
pub mod graph;
mod node;
pub mod plan;
pub mod records;
pub mod store;

pub use compiler::compile;
pub use error::{CompilationError, NodeError, StoreError};
pub use events::*;
pub use graph::{node_types, ports, ConfigMap, Connection, Graph, Node, RetryPolicy};
pub use node::{lookup_path, NodeContext, NodeExecutor, NodeOutput};
pub use plan::{ExecutionPlan, ExecutionStep, InboundEdge};
pub use records::{
    DefinitionPatch, DefinitionStatus, ExecutionFilter, ExecutionStatus, NewDefinition,
    NodeExecutionStatus, WorkflowDefinition, WorkflowExecution, WorkflowNodeExecution,
};
pub use store::{DefinitionStore, ExecutionStore, InMemoryStore};

