use super::{resolve, ApprovalChain, ApprovalMode, Decision, NewApprovalRequest, Resolution, StepStatus};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ApprovalStep {
    approver_id: String,
    status: StepStatus,
}

#[derive(Debug, Clone)]
struct ApprovalRequest {
    mode: ApprovalMode,
    quorum_required: u32,
    steps: Vec<ApprovalStep>,
    expires_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    fn expire_if_due(&mut self, now: DateTime<Utc>) {
        if self.expires_at.is_some_and(|at| now >= at) {
            for step in &mut self.steps {
                if step.status == StepStatus::Pending {
                    step.status = StepStatus::Expired;
                }
            }
        }
    }

    fn resolution(&self) -> Option<Resolution> {
        let statuses: Vec<StepStatus> = self.steps.iter().map(|s| s.status).collect();
        resolve(self.mode, self.quorum_required, &statuses)
    }

    /// Index of the pending step `approver_id` may act on.
    fn actionable_step(&self, approver_id: &str) -> Result<usize, CollaboratorError> {
        let position = self
            .steps
            .iter()
            .position(|s| s.approver_id == approver_id && s.status == StepStatus::Pending)
            .ok_or_else(|| {
                CollaboratorError::Rejected(format!("no pending step for approver '{}'", approver_id))
            })?;

        if self.mode == ApprovalMode::Sequential {
            let first_pending = self.steps.iter().position(|s| s.status == StepStatus::Pending);
            if first_pending != Some(position) {
                return Err(CollaboratorError::Rejected(format!(
                    "approver '{}' is not next in sequence",
                    approver_id
                )));
            }
        }
        Ok(position)
    }
}

/// Approval chain held in process memory.
#[derive(Default)]
pub struct InMemoryApprovalChain {
    requests: RwLock<HashMap<Uuid, ApprovalRequest>>,
}

impl InMemoryApprovalChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of requests that have not resolved yet.
    pub async fn pending_requests(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let mut requests = self.requests.write().await;
        let mut pending: Vec<Uuid> = requests
            .iter_mut()
            .filter_map(|(id, request)| {
                request.expire_if_due(now);
                request.resolution().is_none().then_some(*id)
            })
            .collect();
        pending.sort();
        pending
    }

    /// Record an approver's decision and return the resolution it produces.
    pub async fn decide(
        &self,
        request_id: Uuid,
        approver_id: &str,
        decision: Decision,
    ) -> Result<Option<Resolution>, CollaboratorError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&request_id)
            .ok_or(CollaboratorError::UnknownRequest(request_id))?;
        request.expire_if_due(Utc::now());
        if let Some(resolution) = request.resolution() {
            return Err(CollaboratorError::Rejected(format!(
                "request already resolved: {:?}",
                resolution
            )));
        }

        let index = request.actionable_step(approver_id)?;
        request.steps[index].status = match decision {
            Decision::Approve => StepStatus::Approved,
            Decision::Reject => StepStatus::Rejected,
        };
        tracing::info!("Approver {} decided {:?} on {}", approver_id, decision, request_id);
        Ok(request.resolution())
    }

    /// Hand a pending step to another approver. The new step takes the
    /// original's place in the sequence.
    pub async fn delegate(
        &self,
        request_id: Uuid,
        from: &str,
        to: &str,
    ) -> Result<(), CollaboratorError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&request_id)
            .ok_or(CollaboratorError::UnknownRequest(request_id))?;
        request.expire_if_due(Utc::now());

        let index = request.actionable_step(from)?;
        request.steps[index].status = StepStatus::Delegated;
        request.steps.insert(
            index + 1,
            ApprovalStep {
                approver_id: to.to_string(),
                status: StepStatus::Pending,
            },
        );
        tracing::info!("Approver {} delegated {} to {}", from, request_id, to);
        Ok(())
    }
}

#[async_trait]
impl ApprovalChain for InMemoryApprovalChain {
    async fn create_request(&self, request: NewApprovalRequest) -> Result<Uuid, CollaboratorError> {
        if request.approver_ids.is_empty() {
            return Err(CollaboratorError::Rejected("no approvers given".to_string()));
        }
        let id = Uuid::new_v4();
        let expires_at = request
            .timeout_minutes
            .map(|minutes| Utc::now() + Duration::minutes(minutes as i64));
        let steps = request
            .approver_ids
            .into_iter()
            .map(|approver_id| ApprovalStep {
                approver_id,
                status: StepStatus::Pending,
            })
            .collect();

        self.requests.write().await.insert(
            id,
            ApprovalRequest {
                mode: request.mode,
                quorum_required: request.quorum_required,
                steps,
                expires_at,
            },
        );
        tracing::info!("Created approval request {} ({:?})", id, request.mode);
        Ok(id)
    }

    async fn status(&self, request_id: Uuid) -> Result<Option<Resolution>, CollaboratorError> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&request_id)
            .ok_or(CollaboratorError::UnknownRequest(request_id))?;
        request.expire_if_due(Utc::now());
        Ok(request.resolution())
    }
}
