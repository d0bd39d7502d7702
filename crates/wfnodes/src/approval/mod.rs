//! Approval chain contract, the resolution rules, an in-memory chain and
//! the `approvalGate` node that waits on it.

mod gate;
mod memory;

pub use gate::ApprovalGateNode;
pub use memory::InMemoryApprovalChain;

use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wfcore::ports;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalMode {
    #[default]
    Sequential,
    Parallel,
    Quorum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Delegated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Approved,
    Rejected,
    Expired,
}

impl Resolution {
    /// Port the gate emits for this outcome.
    pub fn port(self) -> &'static str {
        match self {
            Resolution::Approved => ports::APPROVED,
            Resolution::Rejected => ports::REJECTED,
            Resolution::Expired => ports::EXPIRED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApprovalRequest {
    pub tenant_id: Uuid,
    pub requester: Option<String>,
    pub approver_ids: Vec<String>,
    pub mode: ApprovalMode,
    pub quorum_required: u32,
    pub timeout_minutes: Option<u64>,
}

/// External service that collects approver decisions.
#[async_trait]
pub trait ApprovalChain: Send + Sync {
    async fn create_request(&self, request: NewApprovalRequest) -> Result<Uuid, CollaboratorError>;

    /// `None` while the request is unresolved.
    async fn status(&self, request_id: Uuid) -> Result<Option<Resolution>, CollaboratorError>;
}

/// Resolve a chain from its step statuses. Delegated steps are ignored;
/// the step that replaced them carries the vote.
pub fn resolve(mode: ApprovalMode, quorum_required: u32, steps: &[StepStatus]) -> Option<Resolution> {
    let counted: Vec<StepStatus> = steps
        .iter()
        .copied()
        .filter(|s| *s != StepStatus::Delegated)
        .collect();
    let count = |status: StepStatus| counted.iter().filter(|s| **s == status).count();

    let total = counted.len();
    let approved = count(StepStatus::Approved);
    let rejected = count(StepStatus::Rejected);
    let expired = count(StepStatus::Expired);
    let pending = count(StepStatus::Pending);

    if total == 0 {
        return None;
    }

    match mode {
        ApprovalMode::Sequential => {
            if rejected > 0 {
                Some(Resolution::Rejected)
            } else if approved == total {
                Some(Resolution::Approved)
            } else if expired > 0 && pending == 0 {
                Some(Resolution::Expired)
            } else {
                None
            }
        }
        ApprovalMode::Parallel => {
            if rejected > 0 {
                Some(Resolution::Rejected)
            } else if approved == total {
                Some(Resolution::Approved)
            } else if pending > 0 {
                None
            } else {
                Some(Resolution::Expired)
            }
        }
        ApprovalMode::Quorum => {
            let needed = quorum_required as usize;
            if approved >= needed {
                Some(Resolution::Approved)
            } else if total - rejected < needed {
                Some(Resolution::Rejected)
            } else if pending == 0 {
                Some(Resolution::Expired)
            } else {
                None
            }
        }
    }
}
