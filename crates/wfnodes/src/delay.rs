use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use wfcore::{node_types, ports, NodeContext, NodeError, NodeExecutor, NodeOutput};
use wfruntime::{ConfigSchema, FieldKind, NodeCategory, NodeTypeDefinition, PortDefinition};

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl NodeExecutor for DelayNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(mock) = ctx.mock_output() {
            return Ok(mock);
        }

        // Default to 1 second if not specified
        let delay_ms = ctx.config_u64("delay_ms").unwrap_or(1000);
        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        Ok(NodeOutput::new().with_data("delayed_ms", delay_ms))
    }
}

impl DelayNode {
    pub fn definition() -> NodeTypeDefinition {
        NodeTypeDefinition::new(node_types::DELAY, "Delay", NodeCategory::Action, Arc::new(DelayNode))
            .with_port(PortDefinition::flow_in(true))
            .with_port(PortDefinition::flow_out(ports::OUT))
            .with_schema(ConfigSchema::new().optional("delay_ms", FieldKind::Number))
    }
}
