use async_trait::async_trait;
use std::sync::Arc;
use wfcore::{node_types, ports, NodeContext, NodeError, NodeExecutor, NodeOutput};
use wfruntime::{ConfigSchema, FieldKind, NodeCategory, NodeTypeDefinition, PortDefinition};

/// Logs a message, plus the value at `path` when one is configured.
pub struct LogNode;

#[async_trait]
impl NodeExecutor for LogNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx.config_str("message").unwrap_or("(no message)").to_string();
        let value = ctx.config_str("path").and_then(|p| ctx.resolve(p));

        let line = match &value {
            Some(value) => format!("{}: {}", message, value),
            None => message.clone(),
        };
        match ctx.config_str("level") {
            Some("warn") => {
                tracing::warn!("[{}] {}", ctx.node_id, line);
                ctx.events.warn(line);
            }
            _ => {
                tracing::info!("[{}] {}", ctx.node_id, line);
                ctx.events.info(line);
            }
        }

        let mut output = NodeOutput::new().with_data("message", message);
        if let Some(value) = value {
            output = output.with_data("value", value);
        }
        Ok(output)
    }
}

impl LogNode {
    pub fn definition() -> NodeTypeDefinition {
        NodeTypeDefinition::new(node_types::LOG, "Log", NodeCategory::Action, Arc::new(LogNode))
            .with_port(PortDefinition::flow_in(true))
            .with_port(PortDefinition::flow_out(ports::OUT))
            .with_schema(
                ConfigSchema::new()
                    .optional("message", FieldKind::String)
                    .optional("path", FieldKind::String)
                    .optional("level", FieldKind::String),
            )
    }
}
