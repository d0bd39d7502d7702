use super::{ApprovalChain, ApprovalMode, NewApprovalRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use wfcore::{node_types, ports, ConfigMap, NodeContext, NodeError, NodeExecutor, NodeOutput};
use wfruntime::{ConfigSchema, FieldKind, NodeCategory, NodeTypeDefinition, PortDefinition};

/// Opens an approval request and suspends until the chain resolves it.
pub struct ApprovalGateNode {
    chain: Arc<dyn ApprovalChain>,
    poll_interval: Duration,
}

impl ApprovalGateNode {
    pub fn new(chain: Arc<dyn ApprovalChain>, poll_interval: Duration) -> Self {
        Self {
            chain,
            poll_interval,
        }
    }

    pub fn definition(chain: Arc<dyn ApprovalChain>, poll_interval: Duration) -> NodeTypeDefinition {
        NodeTypeDefinition::new(
            node_types::APPROVAL_GATE,
            "Approval Gate",
            NodeCategory::ControlFlow,
            Arc::new(ApprovalGateNode::new(chain, poll_interval)),
        )
        .with_port(PortDefinition::flow_in(true))
        .with_port(PortDefinition::flow_out(ports::APPROVED))
        .with_port(PortDefinition::flow_out(ports::REJECTED))
        .with_port(PortDefinition::flow_out(ports::EXPIRED))
        .with_schema(
            ConfigSchema::new()
                .required("approvers", FieldKind::Array)
                .optional("mode", FieldKind::String)
                .optional("quorum", FieldKind::Number)
                .optional("timeout_minutes", FieldKind::Number),
        )
    }

    fn parse(config: &ConfigMap) -> Result<(Vec<String>, ApprovalMode, u32), NodeError> {
        let approvers: Vec<String> = config
            .get("approvers")
            .and_then(Value::as_array)
            .ok_or_else(|| NodeError::MissingConfig("approvers".to_string()))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| NodeError::invalid_config("approvers", "must be strings"))
            })
            .collect::<Result<_, _>>()?;
        if approvers.is_empty() {
            return Err(NodeError::invalid_config("approvers", "must not be empty"));
        }

        let mode = match config.get("mode") {
            Some(mode) => serde_json::from_value(mode.clone())
                .map_err(|e| NodeError::invalid_config("mode", e.to_string()))?,
            None => ApprovalMode::default(),
        };
        let quorum = match config.get("quorum").and_then(Value::as_u64) {
            Some(q) => u32::try_from(q)
                .map_err(|_| NodeError::invalid_config("quorum", "out of range"))?,
            None => 1,
        };
        if mode == ApprovalMode::Quorum && (quorum == 0 || quorum as usize > approvers.len()) {
            return Err(NodeError::invalid_config(
                "quorum",
                format!("must be between 1 and {}", approvers.len()),
            ));
        }
        Ok((approvers, mode, quorum))
    }
}

#[async_trait]
impl NodeExecutor for ApprovalGateNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(mock) = ctx.mock_output() {
            return Ok(mock);
        }

        let (approver_ids, mode, quorum_required) = Self::parse(&ctx.config)?;
        let request_id = self
            .chain
            .create_request(NewApprovalRequest {
                tenant_id: ctx.tenant_id,
                requester: ctx.started_by.clone(),
                approver_ids,
                mode,
                quorum_required,
                timeout_minutes: ctx.config_u64("timeout_minutes"),
            })
            .await?;
        ctx.events.info(format!("Waiting on approval request {}", request_id));

        loop {
            if let Some(resolution) = self.chain.status(request_id).await? {
                tracing::info!("Approval {} resolved {:?}", request_id, resolution);
                return Ok(NodeOutput::on_port(resolution.port())
                    .with_data("request_id", request_id.to_string())
                    .with_data("decision", resolution.port()));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            }
        }
    }

    fn validate_config(&self, config: &ConfigMap) -> Result<(), NodeError> {
        Self::parse(config).map(|_| ())
    }
}
