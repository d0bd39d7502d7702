//! Standard node library
//!
//! Built-in node executors for workflow graphs, plus the contracts of the
//! activity and approval services some of them call.

mod activity;
mod approval;
mod branch;
mod condition;
mod delay;
mod error;
mod log;
mod loops;
mod markers;

pub use activity::{
    ActivityNode, ActivityRequest, ActivityResult, ActivityService, ActivityStatus,
    EchoActivityService,
};
pub use approval::{
    resolve, ApprovalChain, ApprovalGateNode, ApprovalMode, Decision, InMemoryApprovalChain,
    NewApprovalRequest, Resolution, StepStatus,
};
pub use branch::{ConditionNode, SwitchNode};
pub use condition::{Condition, Operator};
pub use delay::DelayNode;
pub use error::CollaboratorError;
pub use log::LogNode;
pub use loops::{ForEachNode, WhileNode};
pub use markers::{EndNode, PassthroughNode, StartNode};

use std::sync::Arc;
use std::time::Duration;
use wfruntime::{NodeRegistryBuilder, NodeTypeRegistry, RuntimeConfig};

/// External services the built-in nodes call into.
#[derive(Clone)]
pub struct Collaborators {
    pub activities: Arc<dyn ActivityService>,
    pub approvals: Arc<dyn ApprovalChain>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            activities: Arc::new(EchoActivityService),
            approvals: Arc::new(InMemoryApprovalChain::new()),
        }
    }
}

/// Register all standard nodes with a registry
pub fn register_all(
    builder: &mut NodeRegistryBuilder,
    collaborators: &Collaborators,
    config: &RuntimeConfig,
) {
    let poll_interval = Duration::from_millis(config.approval_poll_interval_ms);
    builder
        .register(StartNode::definition())
        .register(EndNode::definition())
        .register(ActivityNode::definition(Arc::clone(&collaborators.activities)))
        .register(PassthroughNode::parallel())
        .register(PassthroughNode::merge())
        .register(ConditionNode::definition())
        .register(SwitchNode::definition())
        .register(ForEachNode::definition())
        .register(WhileNode::definition(config.default_max_loop_iterations))
        .register(ApprovalGateNode::definition(
            Arc::clone(&collaborators.approvals),
            poll_interval,
        ))
        .register(DelayNode::definition())
        .register(LogNode::definition());
}

/// A registry holding every standard node type.
pub fn standard_registry(collaborators: &Collaborators, config: &RuntimeConfig) -> NodeTypeRegistry {
    let mut builder = NodeTypeRegistry::builder();
    register_all(&mut builder, collaborators, config);
    builder.build()
}
