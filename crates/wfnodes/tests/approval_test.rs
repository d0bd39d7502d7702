use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wfcore::{EventBus, NodeContext, NodeError, NodeExecutor};
use wfnodes::{
    resolve, ApprovalChain, ApprovalGateNode, ApprovalMode, Decision, InMemoryApprovalChain,
    NewApprovalRequest, Resolution, StepStatus,
};

use StepStatus::{Approved, Delegated, Expired, Pending, Rejected};

#[test]
fn test_quorum_truth_table() {
    let quorum = |steps: &[StepStatus]| resolve(ApprovalMode::Quorum, 2, steps);

    assert_eq!(quorum(&[Approved, Approved, Pending]), Some(Resolution::Approved));
    assert_eq!(quorum(&[Approved, Rejected, Rejected]), Some(Resolution::Rejected));
    assert_eq!(quorum(&[Approved, Rejected, Pending]), None);
    assert_eq!(quorum(&[Expired, Expired, Expired]), Some(Resolution::Expired));
}

#[test]
fn test_sequential_resolution() {
    let sequential = |steps: &[StepStatus]| resolve(ApprovalMode::Sequential, 0, steps);

    assert_eq!(sequential(&[Approved, Rejected, Pending]), Some(Resolution::Rejected));
    assert_eq!(sequential(&[Approved, Approved]), Some(Resolution::Approved));
    assert_eq!(sequential(&[Approved, Expired]), Some(Resolution::Expired));
    assert_eq!(sequential(&[Approved, Pending]), None);
    // Delegated steps do not count toward completion.
    assert_eq!(sequential(&[Delegated, Approved, Approved]), Some(Resolution::Approved));
}

#[test]
fn test_parallel_resolution() {
    let parallel = |steps: &[StepStatus]| resolve(ApprovalMode::Parallel, 0, steps);

    assert_eq!(parallel(&[Pending, Rejected]), Some(Resolution::Rejected));
    assert_eq!(parallel(&[Approved, Approved]), Some(Resolution::Approved));
    assert_eq!(parallel(&[Approved, Pending]), None);
    assert_eq!(parallel(&[Approved, Expired]), Some(Resolution::Expired));
}

fn request(mode: ApprovalMode, approvers: &[&str], quorum: u32) -> NewApprovalRequest {
    NewApprovalRequest {
        tenant_id: Uuid::new_v4(),
        requester: Some("alice".to_string()),
        approver_ids: approvers.iter().map(|a| a.to_string()).collect(),
        mode,
        quorum_required: quorum,
        timeout_minutes: None,
    }
}

#[tokio::test]
async fn test_sequential_chain_enforces_order() {
    let chain = InMemoryApprovalChain::new();
    let id = chain
        .create_request(request(ApprovalMode::Sequential, &["bob", "carol"], 0))
        .await
        .unwrap();

    assert!(chain.decide(id, "carol", Decision::Approve).await.is_err());
    assert_eq!(chain.decide(id, "bob", Decision::Approve).await.unwrap(), None);
    assert_eq!(
        chain.decide(id, "carol", Decision::Approve).await.unwrap(),
        Some(Resolution::Approved)
    );
    assert_eq!(chain.status(id).await.unwrap(), Some(Resolution::Approved));
}

#[tokio::test]
async fn test_delegation_passes_the_vote() {
    let chain = InMemoryApprovalChain::new();
    let id = chain
        .create_request(request(ApprovalMode::Sequential, &["bob"], 0))
        .await
        .unwrap();

    chain.delegate(id, "bob", "dave").await.unwrap();
    assert!(chain.decide(id, "bob", Decision::Approve).await.is_err());
    assert_eq!(
        chain.decide(id, "dave", Decision::Reject).await.unwrap(),
        Some(Resolution::Rejected)
    );
}

fn context(chain_node: &str) -> NodeContext {
    let bus = EventBus::new(16);
    let execution_id = Uuid::new_v4();
    NodeContext::new(chain_node, "approvalGate", execution_id, bus.create_emitter(execution_id, chain_node))
}

#[tokio::test]
async fn test_gate_emits_resolution_port() {
    let chain = Arc::new(InMemoryApprovalChain::new());
    let gate = ApprovalGateNode::new(chain.clone(), Duration::from_millis(5));

    let mut ctx = context("gate");
    ctx.config = serde_json::from_value(serde_json::json!({
        "approvers": ["bob", "carol", "erin"],
        "mode": "QUORUM",
        "quorum": 2
    }))
    .unwrap();

    let decider = {
        let chain = chain.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if let Some(id) = chain.pending_requests().await.first().copied() {
                    chain.decide(id, "bob", Decision::Approve).await.unwrap();
                    chain.decide(id, "erin", Decision::Approve).await.unwrap();
                    break;
                }
            }
        })
    };

    let output = gate.execute(ctx).await.unwrap();
    decider.await.unwrap();
    assert_eq!(output.next_port, "approved");
}

#[tokio::test]
async fn test_gate_observes_cancellation() {
    let chain = Arc::new(InMemoryApprovalChain::new());
    let gate = ApprovalGateNode::new(chain, Duration::from_millis(5));

    let mut ctx = context("gate");
    ctx.config = serde_json::from_value(serde_json::json!({"approvers": ["bob"]})).unwrap();
    let token = ctx.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let result = gate.execute(ctx).await;
    assert!(matches!(result, Err(NodeError::Cancelled)));
}

#[test]
fn test_gate_rejects_unreachable_quorum() {
    let gate = ApprovalGateNode::new(Arc::new(InMemoryApprovalChain::new()), Duration::from_millis(5));
    let config = serde_json::from_value(serde_json::json!({
        "approvers": ["bob"],
        "mode": "QUORUM",
        "quorum": 2
    }))
    .unwrap();
    assert!(gate.validate_config(&config).is_err());
}

#[test]
fn test_gate_rejects_quorum_beyond_u32() {
    let gate = ApprovalGateNode::new(Arc::new(InMemoryApprovalChain::new()), Duration::from_millis(5));
    let config = serde_json::from_value(serde_json::json!({
        "approvers": ["bob", "carol"],
        "mode": "QUORUM",
        "quorum": 4_294_967_297u64
    }))
    .unwrap();
    assert_eq!(
        gate.validate_config(&config),
        Err(NodeError::invalid_config("quorum", "out of range"))
    );
}
