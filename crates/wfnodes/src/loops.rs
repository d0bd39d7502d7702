//! `forEach` and `while`. The runtime re-dispatches the loop node after
//! every pass of its body; `ctx.iteration` counts completed passes.

use crate::condition::Condition;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use wfcore::{node_types, ports, ConfigMap, NodeContext, NodeError, NodeExecutor, NodeOutput};
use wfruntime::{ConfigSchema, FieldKind, NodeCategory, NodeTypeDefinition, PortDefinition};

fn max_iterations(config: &ConfigMap, fallback: Option<u32>) -> Result<Option<u32>, NodeError> {
    match config.get("max_iterations") {
        None | Some(Value::Null) => Ok(fallback),
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| NodeError::invalid_config("max_iterations", "must be a positive integer")),
    }
}

fn loop_definition(type_id: &str, label: &str, executor: Arc<dyn NodeExecutor>) -> NodeTypeDefinition {
    NodeTypeDefinition::new(type_id, label, NodeCategory::ControlFlow, executor)
        .with_port(PortDefinition::flow_in(true))
        .with_port(PortDefinition::flow_out(ports::BODY))
        .with_port(PortDefinition::flow_out(ports::DONE))
}

/// Iterates `items`: a path string resolved against the context, or a
/// literal array.
pub struct ForEachNode;

impl ForEachNode {
    fn items(ctx: &NodeContext) -> Result<Vec<Value>, NodeError> {
        let items = match ctx.require_config("items")? {
            Value::String(path) => ctx.resolve(path).unwrap_or(Value::Null),
            literal => literal.clone(),
        };
        match items {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            _ => Err(NodeError::invalid_config("items", "does not resolve to an array")),
        }
    }

    pub fn definition() -> NodeTypeDefinition {
        loop_definition(node_types::FOR_EACH, "For Each", Arc::new(ForEachNode)).with_schema(
            ConfigSchema::new()
                .required("items", FieldKind::Any)
                .optional("max_iterations", FieldKind::Number),
        )
    }
}

#[async_trait]
impl NodeExecutor for ForEachNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = Self::items(&ctx)?;
        let total = items.len();
        if let Some(max) = max_iterations(&ctx.config, None)? {
            if total > max as usize {
                return Err(NodeError::ExecutionFailed(format!(
                    "{} items exceed max_iterations {}",
                    total, max
                )));
            }
        }

        let index = ctx.iteration as usize;
        match items.into_iter().nth(index) {
            Some(item) => {
                ctx.events.progress(
                    index as f64 * 100.0 / total as f64,
                    Some(format!("item {} of {}", index + 1, total)),
                );
                Ok(NodeOutput::on_port(ports::BODY)
                    .with_data("item", item)
                    .with_data("index", index)
                    .with_data("total", total))
            }
            None => Ok(NodeOutput::on_port(ports::DONE).with_data("count", total)),
        }
    }

    fn validate_config(&self, config: &ConfigMap) -> Result<(), NodeError> {
        match config.get("items") {
            Some(Value::String(_)) | Some(Value::Array(_)) => {}
            Some(_) => return Err(NodeError::invalid_config("items", "must be a path or an array")),
            None => return Err(NodeError::MissingConfig("items".to_string())),
        }
        max_iterations(config, None).map(|_| ())
    }
}

/// Repeats its body while a `{field, operator, value}` test holds.
pub struct WhileNode {
    default_max_iterations: u32,
}

impl WhileNode {
    pub fn new(default_max_iterations: u32) -> Self {
        Self {
            default_max_iterations,
        }
    }

    pub fn definition(default_max_iterations: u32) -> NodeTypeDefinition {
        loop_definition(
            node_types::WHILE,
            "While",
            Arc::new(WhileNode::new(default_max_iterations)),
        )
        .with_schema(
            ConfigSchema::new()
                .required("field", FieldKind::String)
                .optional("operator", FieldKind::String)
                .optional("value", FieldKind::Any)
                .optional("max_iterations", FieldKind::Number),
        )
    }
}

#[async_trait]
impl NodeExecutor for WhileNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let condition = Condition::from_config(&ctx.config)?;
        if !condition.evaluate(&ctx.scope()) {
            return Ok(NodeOutput::on_port(ports::DONE).with_data("iterations", ctx.iteration));
        }

        let max = max_iterations(&ctx.config, Some(self.default_max_iterations))?
            .unwrap_or(self.default_max_iterations);
        if ctx.iteration >= max {
            return Err(NodeError::ExecutionFailed(format!(
                "Loop exceeded max_iterations {}",
                max
            )));
        }
        Ok(NodeOutput::on_port(ports::BODY).with_data("index", ctx.iteration))
    }

    fn validate_config(&self, config: &ConfigMap) -> Result<(), NodeError> {
        Condition::from_config(config)?;
        max_iterations(config, None).map(|_| ())
    }
}
