//! Structural graph validation run as a publish-time gate.

use crate::registry::{NodeCategory, NodeTypeRegistry, PortDirection};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use wfcore::Graph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub node_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn node(node_id: &str, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            message: message.into(),
        }
    }

    fn graph(message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "node '{}': {}", id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

pub struct GraphValidator {
    registry: Arc<NodeTypeRegistry>,
}

impl GraphValidator {
    pub fn new(registry: Arc<NodeTypeRegistry>) -> Self {
        Self { registry }
    }

    /// Collect every issue in the graph; an empty list means valid.
    pub fn validate(&self, graph: &Graph) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if graph.nodes.is_empty() {
            issues.push(ValidationIssue::graph("graph has no nodes"));
            return issues;
        }

        let mut seen = HashSet::new();
        for node in &graph.nodes {
            if !seen.insert(node.id.as_str()) {
                issues.push(ValidationIssue::node(&node.id, "duplicate node id"));
            }
        }

        let types: HashMap<&str, &str> = graph
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.node_type.as_str()))
            .collect();

        for conn in &graph.connections {
            for endpoint in [&conn.source, &conn.target] {
                if !types.contains_key(endpoint.as_str()) {
                    issues.push(ValidationIssue::graph(format!(
                        "connection '{}' references unknown node '{}'",
                        conn.id, endpoint
                    )));
                }
            }
            let source_def = types
                .get(conn.source.as_str())
                .and_then(|t| self.registry.get(t));
            if let Some(def) = source_def {
                if !def.accepts_out_port(&conn.source_port) {
                    issues.push(ValidationIssue::node(
                        &conn.source,
                        format!("'{}' has no output port '{}'", def.type_id, conn.source_port),
                    ));
                }
            }
        }

        for node in &graph.nodes {
            let Some(def) = self.registry.get(&node.node_type) else {
                issues.push(ValidationIssue::node(
                    &node.id,
                    format!("unknown node type '{}'", node.node_type),
                ));
                continue;
            };

            for problem in def.config_schema.validate(&node.config) {
                issues.push(ValidationIssue::node(&node.id, problem));
            }
            if let Err(e) = def.executor.validate_config(&node.config) {
                issues.push(ValidationIssue::node(&node.id, e.to_string()));
            }

            let has_inbound = graph.connections.iter().any(|c| c.target == node.id);
            let requires_inbound = def
                .ports
                .iter()
                .any(|p| p.direction == PortDirection::In && p.required);
            if requires_inbound && !has_inbound {
                issues.push(ValidationIssue::node(&node.id, "required input is not connected"));
            }
        }

        issues.extend(self.unreachable(graph));
        issues
    }

    /// Nodes no trigger node can reach. Skipped when the graph has no
    /// trigger nodes.
    fn unreachable(&self, graph: &Graph) -> Vec<ValidationIssue> {
        let triggers: Vec<&str> = graph
            .nodes
            .iter()
            .filter(|n| {
                self.registry
                    .get(&n.node_type)
                    .is_some_and(|d| d.category == NodeCategory::Trigger)
            })
            .map(|n| n.id.as_str())
            .collect();
        if triggers.is_empty() {
            return Vec::new();
        }

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for conn in &graph.connections {
            adjacency
                .entry(conn.source.as_str())
                .or_default()
                .push(conn.target.as_str());
        }

        let mut reached: HashSet<&str> = triggers.iter().copied().collect();
        let mut queue: VecDeque<&str> = triggers.into_iter().collect();
        while let Some(current) = queue.pop_front() {
            for next in adjacency.get(current).into_iter().flatten() {
                if reached.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }

        graph
            .nodes
            .iter()
            .filter(|n| !reached.contains(n.id.as_str()))
            .map(|n| ValidationIssue::node(&n.id, "not reachable from a start node"))
            .collect()
    }
}
