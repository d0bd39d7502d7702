use crate::schema::ConfigSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use wfcore::NodeExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeCategory {
    Action,
    ControlFlow,
    Trigger,
    Marker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortType {
    Flow,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    pub direction: PortDirection,
    pub port_type: PortType,
    pub required: bool,
    pub multiple: bool,
}

impl PortDefinition {
    /// Flow input accepting any number of connections.
    pub fn flow_in(required: bool) -> Self {
        Self {
            name: wfcore::ports::IN.to_string(),
            direction: PortDirection::In,
            port_type: PortType::Flow,
            required,
            multiple: true,
        }
    }

    pub fn flow_out(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Out,
            port_type: PortType::Flow,
            required: false,
            multiple: true,
        }
    }
}

/// Everything the engine knows about one node type.
#[derive(Clone)]
pub struct NodeTypeDefinition {
    pub type_id: String,
    pub label: String,
    pub category: NodeCategory,
    pub ports: Vec<PortDefinition>,
    pub config_schema: ConfigSchema,
    pub executor: Arc<dyn NodeExecutor>,
}

impl NodeTypeDefinition {
    pub fn new(
        type_id: impl Into<String>,
        label: impl Into<String>,
        category: NodeCategory,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        Self {
            type_id: type_id.into(),
            label: label.into(),
            category,
            ports: Vec::new(),
            config_schema: ConfigSchema::default(),
            executor,
        }
    }

    pub fn with_port(mut self, port: PortDefinition) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_schema(mut self, schema: ConfigSchema) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn out_ports(&self) -> impl Iterator<Item = &PortDefinition> {
        self.ports.iter().filter(|p| p.direction == PortDirection::Out)
    }

    /// True when the type declares `port` as an output, or declares no
    /// outputs at all (open port set, e.g. `switch` cases).
    pub fn accepts_out_port(&self, port: &str) -> bool {
        let mut outs = self.out_ports().peekable();
        outs.peek().is_none() || self.out_ports().any(|p| p.name == port)
    }
}

impl std::fmt::Debug for NodeTypeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTypeDefinition")
            .field("type_id", &self.type_id)
            .field("category", &self.category)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

/// Collects node type definitions at startup.
#[derive(Default)]
pub struct NodeRegistryBuilder {
    types: HashMap<String, NodeTypeDefinition>,
}

impl NodeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node type; a later registration of the same id replaces
    /// the earlier one.
    pub fn register(&mut self, definition: NodeTypeDefinition) -> &mut Self {
        tracing::info!("Registering node type: {}", definition.type_id);
        self.types.insert(definition.type_id.clone(), definition);
        self
    }

    pub fn build(self) -> NodeTypeRegistry {
        NodeTypeRegistry { types: self.types }
    }
}

/// Read-only catalog of node types, shared across executions.
pub struct NodeTypeRegistry {
    types: HashMap<String, NodeTypeDefinition>,
}

impl NodeTypeRegistry {
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder::new()
    }

    pub fn get(&self, type_id: &str) -> Option<&NodeTypeDefinition> {
        self.types.get(type_id)
    }

    pub fn executor(&self, type_id: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.types.get(type_id).map(|d| Arc::clone(&d.executor))
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.types.contains_key(type_id)
    }

    /// Registered type ids, sorted.
    pub fn list_node_types(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.types.keys().cloned().collect();
        ids.sort();
        ids
    }
}
