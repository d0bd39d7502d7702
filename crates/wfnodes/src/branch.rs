use crate::condition::{loose_eq, Condition};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use wfcore::{node_types, ports, ConfigMap, NodeContext, NodeError, NodeExecutor, NodeOutput};
use wfruntime::{ConfigSchema, FieldKind, NodeCategory, NodeTypeDefinition, PortDefinition};

/// Two-way branch on a `{field, operator, value}` test.
pub struct ConditionNode;

#[async_trait]
impl NodeExecutor for ConditionNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let condition = Condition::from_config(&ctx.config)?;
        let result = condition.evaluate(&ctx.scope());
        tracing::debug!("Condition {} on '{}' is {}", ctx.node_id, condition.field, result);

        let port = if result { ports::TRUE } else { ports::FALSE };
        Ok(NodeOutput::on_port(port).with_data("result", result))
    }

    fn validate_config(&self, config: &ConfigMap) -> Result<(), NodeError> {
        Condition::from_config(config).map(|_| ())
    }
}

impl ConditionNode {
    pub fn definition() -> NodeTypeDefinition {
        NodeTypeDefinition::new(
            node_types::CONDITION,
            "Condition",
            NodeCategory::ControlFlow,
            Arc::new(ConditionNode),
        )
        .with_port(PortDefinition::flow_in(true))
        .with_port(PortDefinition::flow_out(ports::TRUE))
        .with_port(PortDefinition::flow_out(ports::FALSE))
        .with_schema(
            ConfigSchema::new()
                .required("field", FieldKind::String)
                .optional("operator", FieldKind::String)
                .optional("value", FieldKind::Any),
        )
    }
}

/// Multi-way branch: `cases` is a list of `{value, port}`; the first case
/// whose value equals the resolved `field` picks the port, else `default`.
pub struct SwitchNode;

impl SwitchNode {
    fn cases(config: &ConfigMap) -> Result<Vec<(Value, String)>, NodeError> {
        let Some(cases) = config.get("cases") else {
            return Ok(Vec::new());
        };
        let cases = cases
            .as_array()
            .ok_or_else(|| NodeError::invalid_config("cases", "must be an array"))?;
        cases
            .iter()
            .enumerate()
            .map(|(i, case)| {
                let port = case
                    .get("port")
                    .and_then(Value::as_str)
                    .ok_or_else(|| NodeError::invalid_config(format!("cases.{}.port", i), "missing port"))?;
                let value = case.get("value").cloned().unwrap_or(Value::Null);
                Ok((value, port.to_string()))
            })
            .collect()
    }

    pub fn definition() -> NodeTypeDefinition {
        // Case ports are named by config, so no out ports are declared.
        NodeTypeDefinition::new(node_types::SWITCH, "Switch", NodeCategory::ControlFlow, Arc::new(SwitchNode))
            .with_port(PortDefinition::flow_in(true))
            .with_schema(
                ConfigSchema::new()
                    .required("field", FieldKind::String)
                    .optional("cases", FieldKind::Array),
            )
    }
}

#[async_trait]
impl NodeExecutor for SwitchNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let field = ctx
            .config_str("field")
            .ok_or_else(|| NodeError::MissingConfig("field".to_string()))?;
        let actual = ctx.resolve(field).unwrap_or(Value::Null);

        let port = Self::cases(&ctx.config)?
            .into_iter()
            .find(|(value, _)| loose_eq(&actual, value))
            .map(|(_, port)| port)
            .unwrap_or_else(|| ports::DEFAULT.to_string());
        tracing::debug!("Switch {} took port '{}'", ctx.node_id, port);

        Ok(NodeOutput::on_port(port).with_data("value", actual))
    }

    fn validate_config(&self, config: &ConfigMap) -> Result<(), NodeError> {
        Self::cases(config).map(|_| ())
    }
}
