use crate::events::EventEmitter;
use crate::graph::{ports, ConfigMap};
use crate::NodeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capability bound to a node type. The runtime calls it once per dispatch.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Validate configuration at publish time
    fn validate_config(&self, _config: &ConfigMap) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub node_type: String,

    /// Static configuration for this node
    pub config: ConfigMap,

    /// Workflow input supplied at start
    pub input: Value,

    /// Data produced so far, keyed by node id
    pub node_outputs: HashMap<String, Value>,

    /// Declared workflow variables
    pub variables: ConfigMap,

    pub tenant_id: Uuid,
    pub execution_id: Uuid,
    pub started_by: Option<String>,
    pub is_test: bool,

    /// Mock outputs keyed by node id, only consulted in test mode
    pub mock_outputs: Option<ConfigMap>,

    /// Passes completed by this node in its current activation (loop nodes)
    pub iteration: u32,

    pub attempt: u32,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token for cooperative shutdown
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        execution_id: Uuid,
        events: EventEmitter,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            config: ConfigMap::new(),
            input: Value::Null,
            node_outputs: HashMap::new(),
            variables: ConfigMap::new(),
            tenant_id: Uuid::nil(),
            execution_id,
            started_by: None,
            is_test: false,
            mock_outputs: None,
            iteration: 0,
            attempt: 1,
            events,
            cancellation: CancellationToken::new(),
        }
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::MissingConfig(name.to_string()))
    }

    pub fn config_str(&self, name: &str) -> Option<&str> {
        self.config.get(name).and_then(Value::as_str)
    }

    pub fn config_u64(&self, name: &str) -> Option<u64> {
        self.config.get(name).and_then(Value::as_u64)
    }

    /// The lookup scope paths resolve against: `input`, `nodes`, `variables`.
    pub fn scope(&self) -> Value {
        let nodes: serde_json::Map<String, Value> = self
            .node_outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::json!({
            "input": self.input,
            "nodes": nodes,
            "variables": self.variables,
        })
    }

    /// Resolve a dotted path such as `nodes.a1.status` or `input.items.0`.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        lookup_path(&self.scope(), path).cloned()
    }

    /// Mock output for this node when running in test mode.
    ///
    /// A mock entry is either `{"data": {...}, "port": "..."}` or a plain
    /// object used as data on the `out` port.
    pub fn mock_output(&self) -> Option<NodeOutput> {
        if !self.is_test {
            return None;
        }
        let entry = self.mock_outputs.as_ref()?.get(&self.node_id)?;
        let port = entry
            .get("port")
            .and_then(Value::as_str)
            .unwrap_or(ports::OUT);
        let data = match entry.get("data") {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                let mut map = ConfigMap::new();
                map.insert("value".to_string(), other.clone());
                map
            }
            None => match entry {
                Value::Object(map) if !map.contains_key("port") => map.clone(),
                _ => ConfigMap::new(),
            },
        };
        Some(NodeOutput {
            data,
            error: None,
            next_port: port.to_string(),
        })
    }
}

/// Walk a dotted path through objects and arrays.
pub fn lookup_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Output from node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub data: ConfigMap,
    pub error: Option<String>,
    /// Which outgoing connections the runtime follows
    pub next_port: String,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::on_port(ports::OUT)
    }

    pub fn on_port(port: impl Into<String>) -> Self {
        Self {
            data: ConfigMap::new(),
            error: None,
            next_port: port.into(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_map(mut self, map: ConfigMap) -> Self {
        self.data.extend(map);
        self
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new()
    }
}
