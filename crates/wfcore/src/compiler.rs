//! Graph compiler: turns a [`Graph`] into a deterministic [`ExecutionPlan`].
//!
//! Compilation is a pure function of the graph. Compiling the same graph
//! twice yields the same step order, parallel groups, loop bodies and
//! branch keys.

use crate::error::CompilationError;
use crate::graph::{node_types, ports, Graph, RetryPolicy};
use crate::plan::{ExecutionPlan, ExecutionStep, InboundEdge};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Compile a graph into an execution plan.
///
/// Fails when the graph is empty, references unknown nodes, repeats a node
/// id, or contains a cycle other than a loop-back edge into a `forEach` or
/// `while` node from its own body.
pub fn compile(
    definition_id: Uuid,
    version: u32,
    graph: &Graph,
    timeout_seconds: u64,
) -> Result<ExecutionPlan, CompilationError> {
    if graph.is_empty() {
        return Err(CompilationError::EmptyGraph);
    }

    let index = GraphIndex::build(graph)?;
    let loop_bodies = index.loop_bodies();
    let back_edges = index.back_edges(&loop_bodies);
    let order = index.topological_order(&back_edges)?;
    let groups = index.parallel_groups();
    let loop_parents = index.loop_parents(&order, &loop_bodies);
    let branch_keys = index.branch_keys();

    let mut steps = Vec::with_capacity(order.len());
    for node_id in &order {
        let node = index.node(node_id);

        let inbound: Vec<InboundEdge> = graph
            .connections
            .iter()
            .filter(|c| c.target == *node_id)
            .filter(|c| !back_edges.contains(&(c.source.as_str(), c.target.as_str())))
            .map(|c| InboundEdge {
                source: c.source.clone(),
                port: c.source_port.clone(),
            })
            .collect();

        let mut dependencies: Vec<String> = inbound.iter().map(|e| e.source.clone()).collect();
        dependencies.sort();
        dependencies.dedup();

        let retry = node
            .config
            .get("retry")
            .and_then(|v| serde_json::from_value::<RetryPolicy>(v.clone()).ok());

        steps.push(ExecutionStep {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            config: node.config.clone(),
            dependencies,
            parallel_group: groups.get(node_id.as_str()).cloned(),
            loop_parent: loop_parents.get(node_id.as_str()).map(|l| l.to_string()),
            branch_key: branch_keys.get(node_id.as_str()).cloned(),
            inbound,
            retry,
        });
    }

    tracing::debug!(
        definition_id = %definition_id,
        version,
        steps = steps.len(),
        "Compiled execution plan"
    );

    Ok(ExecutionPlan {
        definition_id,
        definition_version: version,
        steps,
        timeout_seconds,
    })
}

/// Petgraph view over a [`Graph`]; edge weights are source ports.
struct GraphIndex<'a> {
    source: &'a Graph,
    graph: DiGraph<&'a str, &'a str>,
    node_to_index: HashMap<&'a str, NodeIndex>,
    positions: HashMap<&'a str, usize>,
}

impl<'a> GraphIndex<'a> {
    fn build(source: &'a Graph) -> Result<Self, CompilationError> {
        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();
        let mut positions = HashMap::new();

        for (pos, node) in source.nodes.iter().enumerate() {
            if node_to_index.contains_key(node.id.as_str()) {
                return Err(CompilationError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(node.id.as_str());
            node_to_index.insert(node.id.as_str(), idx);
            positions.insert(node.id.as_str(), pos);
        }

        for conn in &source.connections {
            let endpoints = [conn.source.as_str(), conn.target.as_str()];
            for endpoint in endpoints {
                if !node_to_index.contains_key(endpoint) {
                    return Err(CompilationError::DanglingReference {
                        connection: conn.id.clone(),
                        node: endpoint.to_string(),
                    });
                }
            }
            graph.add_edge(
                node_to_index[conn.source.as_str()],
                node_to_index[conn.target.as_str()],
                conn.source_port.as_str(),
            );
        }

        Ok(Self {
            source,
            graph,
            node_to_index,
            positions,
        })
    }

    fn node(&self, id: &str) -> &'a crate::graph::Node {
        &self.source.nodes[self.positions[id]]
    }

    fn node_type(&self, id: &str) -> &'a str {
        self.node(id).node_type.as_str()
    }

    /// Node ids of a given kind, sorted.
    fn sorted_ids(&self, predicate: impl Fn(&str) -> bool) -> Vec<&'a str> {
        let mut ids: Vec<&'a str> = self
            .source
            .nodes
            .iter()
            .filter(|n| predicate(&n.node_type))
            .map(|n| n.id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Outgoing `(target, port)` pairs of a node.
    fn outgoing(&self, id: &str) -> Vec<(&'a str, &'a str)> {
        self.graph
            .edges_directed(self.node_to_index[id], Direction::Outgoing)
            .map(|e| (self.graph[e.target()], *e.weight()))
            .collect()
    }

    /// Body of every loop node: everything reachable from its `body` port
    /// without passing back through the loop node.
    fn loop_bodies(&self) -> BTreeMap<&'a str, Vec<&'a str>> {
        let mut bodies = BTreeMap::new();

        for loop_id in self.sorted_ids(node_types::is_loop) {
            let mut body = Vec::new();
            let mut visited: HashSet<&str> = HashSet::new();
            let mut queue: VecDeque<&str> = VecDeque::new();

            for (target, port) in self.outgoing(loop_id) {
                if port == ports::BODY && target != loop_id && visited.insert(target) {
                    queue.push_back(target);
                }
            }

            while let Some(current) = queue.pop_front() {
                body.push(current);
                for (target, _) in self.outgoing(current) {
                    if target != loop_id && visited.insert(target) {
                        queue.push_back(target);
                    }
                }
            }

            bodies.insert(loop_id, body);
        }

        bodies
    }

    /// Edges from a loop body member back into its own loop node.
    fn back_edges(&self, bodies: &BTreeMap<&'a str, Vec<&'a str>>) -> HashSet<(&'a str, &'a str)> {
        let mut edges = HashSet::new();
        for conn in &self.source.connections {
            if let Some(body) = bodies.get(conn.target.as_str()) {
                if body.contains(&conn.source.as_str()) {
                    edges.insert((conn.source.as_str(), conn.target.as_str()));
                }
            }
        }
        edges
    }

    /// Kahn's algorithm with lexicographic tie-breaking.
    fn topological_order(
        &self,
        back_edges: &HashSet<(&'a str, &'a str)>,
    ) -> Result<Vec<String>, CompilationError> {
        let total = self.source.nodes.len();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for node in &self.source.nodes {
            let id = node.id.as_str();
            let degree = self
                .graph
                .edges_directed(self.node_to_index[id], Direction::Incoming)
                .filter(|e| !back_edges.contains(&(self.graph[e.source()], id)))
                .count();
            in_degree.insert(id, degree);
        }

        let mut seeds: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        seeds.sort_unstable();
        let mut queue: VecDeque<&str> = seeds.into_iter().collect();

        let mut order = Vec::with_capacity(total);
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());

            let mut targets: Vec<&str> = self
                .outgoing(current)
                .into_iter()
                .map(|(target, _)| target)
                .filter(|target| !back_edges.contains(&(current, *target)))
                .collect();
            targets.sort_unstable();

            for target in targets {
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }

        if order.len() < total {
            return Err(CompilationError::CycleDetected {
                sorted: order.len(),
                total,
            });
        }

        Ok(order)
    }

    /// Tag everything between a `parallel` node and its `merge` with
    /// `pg_<parallel_id>`. Overlapping regions keep the last walk's tag.
    fn parallel_groups(&self) -> HashMap<&'a str, String> {
        let mut groups = HashMap::new();

        for parallel_id in self.sorted_ids(|t| t == node_types::PARALLEL) {
            let group = format!("pg_{}", parallel_id);
            let mut visited: HashSet<&str> = HashSet::from([parallel_id]);
            let mut queue: VecDeque<&str> = VecDeque::from([parallel_id]);
            groups.insert(parallel_id, group.clone());

            while let Some(current) = queue.pop_front() {
                if current != parallel_id && self.node_type(current) == node_types::MERGE {
                    continue;
                }
                for (target, _) in self.outgoing(current) {
                    if visited.insert(target) {
                        groups.insert(target, group.clone());
                        queue.push_back(target);
                    }
                }
            }
        }

        groups
    }

    /// Loop parents assigned in topological order, so nested loops leave
    /// their body members tagged with the innermost loop.
    fn loop_parents(
        &self,
        order: &[String],
        bodies: &BTreeMap<&'a str, Vec<&'a str>>,
    ) -> HashMap<&'a str, &'a str> {
        let mut parents = HashMap::new();
        for node_id in order {
            if let Some((loop_id, body)) = bodies.get_key_value(node_id.as_str()) {
                for member in body {
                    parents.insert(*member, *loop_id);
                }
            }
        }
        parents
    }

    /// `<source>:<port>` for targets of conditional connections. A target
    /// fed by several conditional ports keeps the last connection's key.
    fn branch_keys(&self) -> HashMap<&'a str, String> {
        let mut keys = HashMap::new();
        for conn in &self.source.connections {
            if node_types::is_branching(self.node_type(&conn.source)) && !conn.source_port.is_empty() {
                keys.insert(
                    conn.target.as_str(),
                    format!("{}:{}", conn.source, conn.source_port),
                );
            }
        }
        keys
    }
}
