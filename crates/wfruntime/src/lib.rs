//! Workflow execution runtime
//!
//! Node type registry, publish-time graph validation and the durable
//! runtime that drives compiled plans: dependency gating, dead-path
//! elimination, parallel groups, loops, retries and checkpoint replay.

mod error;
mod executor;
mod journal;
mod registry;
mod runtime;
mod schema;
mod validator;

pub use error::RuntimeError;
pub use executor::{PlanExecutor, RunControl, RunOutcome};
pub use journal::{Checkpoint, Journal, StepRecord};
pub use registry::{
    NodeCategory, NodeRegistryBuilder, NodeTypeDefinition, NodeTypeRegistry, PortDefinition,
    PortDirection, PortType,
};
pub use runtime::{
    ExecutionHandle, ExecutionRuntime, RuntimeConfig, RuntimeSignal, StartRequest,
    WorkflowRuntime,
};
pub use schema::{ConfigField, ConfigSchema, FieldKind};
pub use validator::{GraphValidator, ValidationIssue};
