use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use wfcore::{node_types, ports, NodeContext, NodeError, NodeExecutor, NodeOutput};
use wfruntime::{
    ConfigSchema, FieldKind, NodeCategory, NodeTypeDefinition, PortDefinition,
};

/// Entry point; emits the workflow input.
pub struct StartNode;

#[async_trait]
impl NodeExecutor for StartNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let output = match ctx.input {
            Value::Object(map) => NodeOutput::new().with_map(map),
            Value::Null => NodeOutput::new(),
            other => NodeOutput::new().with_data("input", other),
        };
        Ok(output)
    }
}

impl StartNode {
    pub fn definition() -> NodeTypeDefinition {
        NodeTypeDefinition::new(node_types::START, "Start", NodeCategory::Trigger, Arc::new(StartNode))
            .with_port(PortDefinition::flow_out(ports::OUT))
    }
}

/// Terminal marker. `config.output` maps result keys to paths.
pub struct EndNode;

#[async_trait]
impl NodeExecutor for EndNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut output = NodeOutput::new();
        if let Some(Value::Object(mapping)) = ctx.config.get("output") {
            let scope = ctx.scope();
            for (key, path) in mapping {
                let value = path
                    .as_str()
                    .and_then(|p| wfcore::lookup_path(&scope, p))
                    .cloned()
                    .unwrap_or(Value::Null);
                output = output.with_data(key.clone(), value);
            }
        }
        Ok(output)
    }

    fn validate_config(&self, config: &wfcore::ConfigMap) -> Result<(), NodeError> {
        if let Some(Value::Object(mapping)) = config.get("output") {
            if let Some((key, _)) = mapping.iter().find(|(_, path)| !path.is_string()) {
                return Err(NodeError::invalid_config(
                    format!("output.{}", key),
                    "must be a path string",
                ));
            }
        }
        Ok(())
    }
}

impl EndNode {
    pub fn definition() -> NodeTypeDefinition {
        NodeTypeDefinition::new(node_types::END, "End", NodeCategory::Marker, Arc::new(EndNode))
            .with_port(PortDefinition::flow_in(true))
            .with_schema(ConfigSchema::new().optional("output", FieldKind::Object))
    }
}

/// Fan-out and join markers. The runtime does the scheduling; the nodes
/// only pass control along.
pub struct PassthroughNode;

#[async_trait]
impl NodeExecutor for PassthroughNode {
    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new())
    }
}

impl PassthroughNode {
    pub fn parallel() -> NodeTypeDefinition {
        Self::definition(node_types::PARALLEL, "Parallel")
    }

    pub fn merge() -> NodeTypeDefinition {
        Self::definition(node_types::MERGE, "Merge")
    }

    fn definition(type_id: &str, label: &str) -> NodeTypeDefinition {
        NodeTypeDefinition::new(type_id, label, NodeCategory::ControlFlow, Arc::new(PassthroughNode))
            .with_port(PortDefinition::flow_in(true))
            .with_port(PortDefinition::flow_out(ports::OUT))
    }
}
