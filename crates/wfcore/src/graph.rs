use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque per-node configuration, validated against the node type's schema.
pub type ConfigMap = serde_json::Map<String, Value>;

/// Built-in node type identifiers the compiler and runtime know about.
pub mod node_types {
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const ACTIVITY: &str = "activity";
    pub const PARALLEL: &str = "parallel";
    pub const MERGE: &str = "merge";
    pub const FOR_EACH: &str = "forEach";
    pub const WHILE: &str = "while";
    pub const CONDITION: &str = "condition";
    pub const SWITCH: &str = "switch";
    pub const APPROVAL_GATE: &str = "approvalGate";
    pub const DELAY: &str = "delay";
    pub const LOG: &str = "log";

    pub fn is_loop(node_type: &str) -> bool {
        node_type == FOR_EACH || node_type == WHILE
    }

    pub fn is_branching(node_type: &str) -> bool {
        node_type == CONDITION || node_type == SWITCH
    }
}

/// Well-known port names.
pub mod ports {
    pub const IN: &str = "in";
    pub const OUT: &str = "out";
    pub const ERROR: &str = "error";
    pub const BODY: &str = "body";
    pub const DONE: &str = "done";
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const DEFAULT: &str = "default";
    pub const APPROVED: &str = "approved";
    pub const REJECTED: &str = "rejected";
    pub const EXPIRED: &str = "expired";
}

/// User-drawn workflow graph. This is the persisted wire format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> String {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Connect `source` to `target` on the default `out` port.
    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.connect_port(source, ports::OUT, target);
    }

    pub fn connect_port(
        &mut self,
        source: impl Into<String>,
        source_port: impl Into<String>,
        target: impl Into<String>,
    ) {
        let source = source.into();
        let target = target.into();
        let source_port = source_port.into();
        self.connections.push(Connection {
            id: format!("{}-{}-{}", source, source_port, target),
            source,
            target,
            source_port,
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: ConfigMap,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: ConfigMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        let policy = RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        };
        if let Ok(value) = serde_json::to_value(policy) {
            self.config.insert("retry".to_string(), value);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default = "default_port")]
    pub source_port: String,
}

fn default_port() -> String {
    ports::OUT.to_string()
}

/// Retry policy for a single step, read from `config.retry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Delay before attempt number `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        std::time::Duration::from_millis(ms as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}
