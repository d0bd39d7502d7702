use crate::graph::{ConfigMap, RetryPolicy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Compiled, ordered form of a workflow graph.
///
/// Plans are immutable once compiled and are serialized into the runtime
/// checkpoint so a resumed execution walks exactly the same steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub definition_id: Uuid,
    pub definition_version: u32,
    pub steps: Vec<ExecutionStep>,
    pub timeout_seconds: u64,
}

impl ExecutionPlan {
    pub fn step(&self, node_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }

    /// Node ids in compiled order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.node_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub node_id: String,
    pub node_type: String,
    pub config: ConfigMap,
    /// Direct predecessors, loop-back edges excluded.
    pub dependencies: Vec<String>,
    pub parallel_group: Option<String>,
    pub loop_parent: Option<String>,
    pub branch_key: Option<String>,
    /// Incoming edges with the port they leave their source on.
    #[serde(default)]
    pub inbound: Vec<InboundEdge>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEdge {
    pub source: String,
    pub port: String,
}
