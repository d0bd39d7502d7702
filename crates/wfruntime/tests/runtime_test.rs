use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use wfcore::{
    compile, ExecutionEvent, ExecutionStatus, ExecutionStore, Graph, InMemoryStore,
    NewDefinition, Node, NodeContext, NodeError, NodeExecutionStatus, NodeExecutor, NodeOutput,
    WorkflowDefinition, WorkflowExecution,
};
use wfruntime::{
    Checkpoint, ConfigSchema, ExecutionRuntime, FieldKind, GraphValidator, Journal, NodeCategory,
    NodeTypeDefinition, NodeTypeRegistry, PortDefinition, RuntimeConfig, RuntimeError,
    RuntimeSignal, StartRequest, StepRecord, WorkflowRuntime,
};

type Calls = Arc<Mutex<Vec<String>>>;

/// Emits on `config.port` (default `out`), or fails when `config.fail` is set.
struct Scripted {
    calls: Calls,
}

#[async_trait]
impl NodeExecutor for Scripted {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.calls.lock().unwrap().push(ctx.node_id.clone());
        if let Some(reason) = ctx.config_str("fail") {
            return Err(NodeError::ExecutionFailed(reason.to_string()));
        }
        let port = ctx.config_str("port").unwrap_or("out").to_string();
        Ok(NodeOutput::on_port(port).with_data("node", ctx.node_id.clone()))
    }
}

/// Takes the body `config.times` times, then exits on `done`.
struct CountedLoop {
    calls: Calls,
}

#[async_trait]
impl NodeExecutor for CountedLoop {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.calls.lock().unwrap().push(ctx.node_id.clone());
        let times = ctx.config_u64("times").unwrap_or(0) as u32;
        if ctx.iteration < times {
            Ok(NodeOutput::on_port("body").with_data("index", ctx.iteration))
        } else {
            Ok(NodeOutput::on_port("done").with_data("iterations", ctx.iteration))
        }
    }
}

/// Fails until attempt `config.succeed_on`.
struct Flaky {
    calls: Calls,
}

#[async_trait]
impl NodeExecutor for Flaky {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        self.calls.lock().unwrap().push(ctx.node_id.clone());
        let succeed_on = ctx.config_u64("succeed_on").unwrap_or(1) as u32;
        if ctx.attempt < succeed_on {
            return Err(NodeError::ExecutionFailed(format!("attempt {}", ctx.attempt)));
        }
        Ok(NodeOutput::new().with_data("attempt", ctx.attempt))
    }
}

/// Sleeps `config.ms` while tracking how many instances run at once and
/// how many ran to the end.
struct Slow {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

#[async_trait]
impl NodeExecutor for Slow {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(ctx.config_u64("ms").unwrap_or(50))).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(NodeOutput::new())
    }
}

struct Harness {
    store: InMemoryStore,
    runtime: WorkflowRuntime,
    registry: Arc<NodeTypeRegistry>,
    calls: Calls,
    peak: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    fn with_config(config: RuntimeConfig) -> Self {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let scripted: Arc<dyn NodeExecutor> = Arc::new(Scripted {
            calls: Arc::clone(&calls),
        });

        let mut builder = NodeTypeRegistry::builder();
        builder.register(
            NodeTypeDefinition::new("start", "Start", NodeCategory::Trigger, scripted.clone())
                .with_port(PortDefinition::flow_out("out")),
        );
        for type_id in ["end", "log", "parallel", "merge"] {
            builder.register(
                NodeTypeDefinition::new(type_id, type_id, NodeCategory::Marker, scripted.clone())
                    .with_port(PortDefinition::flow_in(true)),
            );
        }
        builder.register(
            NodeTypeDefinition::new("activity", "Activity", NodeCategory::Action, scripted.clone())
                .with_port(PortDefinition::flow_in(true))
                .with_port(PortDefinition::flow_out("out"))
                .with_port(PortDefinition::flow_out("error"))
                .with_schema(ConfigSchema::new().required("activity_id", FieldKind::String)),
        );
        builder.register(
            NodeTypeDefinition::new("condition", "Condition", NodeCategory::ControlFlow, scripted)
                .with_port(PortDefinition::flow_in(true))
                .with_port(PortDefinition::flow_out("true"))
                .with_port(PortDefinition::flow_out("false")),
        );
        builder.register(NodeTypeDefinition::new(
            "forEach",
            "For Each",
            NodeCategory::ControlFlow,
            Arc::new(CountedLoop {
                calls: Arc::clone(&calls),
            }),
        ));
        builder.register(NodeTypeDefinition::new(
            "flaky",
            "Flaky",
            NodeCategory::Action,
            Arc::new(Flaky {
                calls: Arc::clone(&calls),
            }),
        ));
        builder.register(NodeTypeDefinition::new(
            "slow",
            "Slow",
            NodeCategory::Action,
            Arc::new(Slow {
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::clone(&peak),
                finished: Arc::clone(&finished),
            }),
        ));

        let registry = Arc::new(builder.build());
        let store = InMemoryStore::new();
        let runtime = WorkflowRuntime::new(Arc::clone(&registry), Arc::new(store.clone()), config);
        Self {
            store,
            runtime,
            registry,
            calls,
            peak,
            finished,
        }
    }

    /// Insert a PENDING execution row and build the matching start request.
    async fn prepare(&self, graph: Graph, input: Value, timeout_seconds: u64) -> StartRequest {
        let tenant = Uuid::new_v4();
        let definition = WorkflowDefinition::draft(tenant, NewDefinition::new("test").with_graph(graph.clone()));
        let execution = WorkflowExecution::pending(&definition, input.clone());
        self.store.insert_execution(execution.clone()).await.unwrap();

        StartRequest {
            execution_id: execution.id,
            tenant_id: tenant,
            plan: compile(definition.id, 1, &graph, timeout_seconds).unwrap(),
            input,
            variables: Default::default(),
            started_by: Some("tester".to_string()),
            is_test: false,
            mock_outputs: None,
        }
    }

    async fn run(&self, graph: Graph, timeout_seconds: u64) -> WorkflowExecution {
        let request = self.prepare(graph, json!({}), timeout_seconds).await;
        let id = request.execution_id;
        self.runtime.start(request).await.unwrap();
        self.runtime.wait(id).await;
        self.execution(id).await
    }

    async fn execution(&self, id: Uuid) -> WorkflowExecution {
        self.store.get_execution(id).await.unwrap().unwrap()
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, node_id: &str) -> usize {
        self.calls().iter().filter(|c| *c == node_id).count()
    }
}

fn linear() -> Graph {
    let mut graph = Graph::new();
    graph.add_node(Node::new("start", "start"));
    graph.add_node(Node::new("a1", "activity").with_config("activity_id", "noop"));
    graph.add_node(Node::new("end", "end"));
    graph.connect("start", "a1");
    graph.connect("a1", "end");
    graph
}

#[tokio::test]
async fn test_linear_execution_succeeds_with_node_records() {
    let harness = Harness::new();
    let execution = harness.run(linear(), 60).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert!(execution.started_at.is_some());
    assert!(execution.completed_at.is_some());
    assert_eq!(execution.output, Some(json!({"end": {"node": "end"}})));
    assert_eq!(harness.calls(), vec!["start", "a1", "end"]);

    let records = harness.store.list_node_executions(execution.id).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == NodeExecutionStatus::Succeeded));
    assert!(records.iter().all(|r| r.attempt == 1));

    let checkpoint = harness.store.load_checkpoint(execution.id).await.unwrap().unwrap();
    let checkpoint: Checkpoint = serde_json::from_value(checkpoint).unwrap();
    assert_eq!(checkpoint.journal.len(), 3);
}

#[tokio::test]
async fn test_untaken_branch_is_skipped() {
    let harness = Harness::new();
    let mut events = harness.runtime.subscribe_events();

    let mut graph = Graph::new();
    graph.add_node(Node::new("start", "start"));
    graph.add_node(Node::new("check", "condition").with_config("port", "false"));
    graph.add_node(Node::new("yes", "log"));
    graph.add_node(Node::new("after_yes", "log"));
    graph.add_node(Node::new("no", "log"));
    graph.connect("start", "check");
    graph.connect_port("check", "true", "yes");
    graph.connect("yes", "after_yes");
    graph.connect_port("check", "false", "no");

    let execution = harness.run(graph, 0).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(harness.calls(), vec!["start", "check", "no"]);

    let records = harness.store.list_node_executions(execution.id).await.unwrap();
    assert!(records.iter().all(|r| r.node_id != "yes" && r.node_id != "after_yes"));

    let mut skipped = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::NodeSkipped { node_id, .. } = event {
            skipped.push(node_id);
        }
    }
    skipped.sort();
    assert_eq!(skipped, vec!["after_yes", "yes"]);
}

#[tokio::test]
async fn test_failure_follows_error_port() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(Node::new("start", "start"));
    graph.add_node(
        Node::new("risky", "activity")
            .with_config("activity_id", "x")
            .with_config("fail", "boom"),
    );
    graph.add_node(Node::new("happy", "log"));
    graph.add_node(Node::new("handler", "log"));
    graph.connect("start", "risky");
    graph.connect("risky", "happy");
    graph.connect_port("risky", "error", "handler");

    let execution = harness.run(graph, 0).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(harness.count("handler"), 1);
    assert_eq!(harness.count("happy"), 0);

    let records = harness.store.list_node_executions(execution.id).await.unwrap();
    let risky = records.iter().find(|r| r.node_id == "risky").unwrap();
    assert_eq!(risky.status, NodeExecutionStatus::Failed);
    assert_eq!(risky.error.as_deref(), Some("Execution failed: boom"));
}

#[tokio::test]
async fn test_unhandled_failure_fails_execution() {
    let harness = Harness::new();

    let mut graph = linear();
    graph.nodes[1] = Node::new("a1", "activity")
        .with_config("activity_id", "x")
        .with_config("fail", "boom");

    let execution = harness.run(graph, 0).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.error.as_deref(),
        Some("Node a1 failed: Execution failed: boom")
    );
    assert_eq!(execution.output, None);
    assert_eq!(harness.count("end"), 0);
}

fn fan_out() -> Graph {
    let mut graph = Graph::new();
    graph.add_node(Node::new("start", "start"));
    graph.add_node(Node::new("split", "parallel"));
    graph.add_node(Node::new("x", "slow").with_config("ms", 100));
    graph.add_node(Node::new("y", "slow").with_config("ms", 100));
    graph.add_node(Node::new("join", "merge"));
    graph.add_node(Node::new("end", "end"));
    graph.connect("start", "split");
    graph.connect("split", "x");
    graph.connect("split", "y");
    graph.connect("x", "join");
    graph.connect("y", "join");
    graph.connect("join", "end");
    graph
}

#[tokio::test]
async fn test_parallel_siblings_run_concurrently_then_merge() {
    let harness = Harness::new();
    let execution = harness.run(fan_out(), 0).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(harness.peak.load(Ordering::SeqCst), 2);
    assert_eq!(harness.count("join"), 1);
    assert_eq!(harness.count("end"), 1);
}

#[tokio::test]
async fn test_max_parallel_caps_batches() {
    let harness = Harness::with_config(RuntimeConfig {
        max_parallel_nodes: 1,
        ..RuntimeConfig::default()
    });
    let execution = harness.run(fan_out(), 0).await;

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(harness.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_loop_body_runs_once_per_pass() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(Node::new("start", "start"));
    graph.add_node(Node::new("each", "forEach").with_config("times", 3));
    graph.add_node(Node::new("work", "log"));
    graph.add_node(Node::new("end", "end"));
    graph.connect("start", "each");
    graph.connect_port("each", "body", "work");
    graph.connect("work", "each");
    graph.connect_port("each", "done", "end");

    let execution = harness.run(graph, 0).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(harness.count("each"), 4);
    assert_eq!(harness.count("work"), 3);
    assert_eq!(harness.count("end"), 1);

    let records = harness.store.list_node_executions(execution.id).await.unwrap();
    assert_eq!(records.iter().filter(|r| r.node_id == "work").count(), 3);
}

#[tokio::test]
async fn test_loop_without_passes_skips_body() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(Node::new("each", "forEach").with_config("times", 0));
    graph.add_node(Node::new("work", "log"));
    graph.add_node(Node::new("end", "end"));
    graph.connect_port("each", "body", "work");
    graph.connect("work", "each");
    graph.connect_port("each", "done", "end");

    let execution = harness.run(graph, 0).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(harness.count("work"), 0);
    assert_eq!(harness.count("end"), 1);
}

#[tokio::test]
async fn test_retry_policy_reruns_failed_attempts() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(
        Node::new("shaky", "flaky")
            .with_config("succeed_on", 3)
            .with_retry(3, 10),
    );

    let execution = harness.run(graph, 0).await;
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(harness.count("shaky"), 3);

    let records = harness.store.list_node_executions(execution.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt, 3);
    assert_eq!(records[0].status, NodeExecutionStatus::Succeeded);
}

#[tokio::test]
async fn test_retries_exhausted_fail_execution() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(
        Node::new("shaky", "flaky")
            .with_config("succeed_on", 5)
            .with_retry(2, 10),
    );

    let execution = harness.run(graph, 0).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(harness.count("shaky"), 2);
    assert_eq!(
        execution.error.as_deref(),
        Some("Node shaky failed: Execution failed: attempt 2")
    );
}

#[tokio::test]
async fn test_deadline_fails_execution() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(Node::new("sleepy", "slow").with_config("ms", 5_000));

    let execution = harness.run(graph, 1).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.error.as_deref(),
        Some("Execution timed out after 1s")
    );
}

#[tokio::test]
async fn test_extended_deadline_lets_execution_finish() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(Node::new("sleepy", "slow").with_config("ms", 1_500));

    let request = harness.prepare(graph, json!({}), 1).await;
    let id = request.execution_id;
    harness.runtime.start(request).await.unwrap();
    harness
        .runtime
        .signal(id, RuntimeSignal::ExtendDeadline { seconds: 5 })
        .await
        .unwrap();

    assert_eq!(harness.runtime.wait(id).await, Some(ExecutionStatus::Succeeded));
}

#[tokio::test]
async fn test_cancel_lets_in_flight_step_finish() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(Node::new("sleepy", "slow").with_config("ms", 300));
    graph.add_node(Node::new("end", "end"));
    graph.connect("sleepy", "end");

    let request = harness.prepare(graph, json!({}), 0).await;
    let id = request.execution_id;
    harness.runtime.start(request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.runtime.signal(id, RuntimeSignal::Cancel).await.unwrap();

    assert_eq!(harness.runtime.wait(id).await, Some(ExecutionStatus::Cancelled));
    assert_eq!(harness.finished.load(Ordering::SeqCst), 1);
    assert_eq!(harness.count("end"), 0);
    assert!(harness.runtime.handle(id).await.is_none());

    let records = harness.store.list_node_executions(id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node_id, "sleepy");
    assert_eq!(records[0].status, NodeExecutionStatus::Succeeded);

    let checkpoint = harness.store.load_checkpoint(id).await.unwrap().unwrap();
    let checkpoint: Checkpoint = serde_json::from_value(checkpoint).unwrap();
    assert!(checkpoint.journal.get(&Journal::key("sleepy", 0)).is_some());
}

#[tokio::test]
async fn test_finished_run_keeps_recorded_cancellation() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(Node::new("sleepy", "slow").with_config("ms", 200));

    let request = harness.prepare(graph, json!({}), 0).await;
    let id = request.execution_id;
    harness.runtime.start(request).await.unwrap();
    assert!(harness
        .store
        .finish_execution(id, ExecutionStatus::Cancelled, None, None)
        .await
        .unwrap());

    assert_eq!(harness.runtime.wait(id).await, Some(ExecutionStatus::Cancelled));
    let execution = harness.execution(id).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.output, None);
}

#[tokio::test]
async fn test_deadline_interrupts_retry_backoff() {
    let harness = Harness::new();

    let mut graph = Graph::new();
    graph.add_node(
        Node::new("shaky", "flaky")
            .with_config("succeed_on", 3)
            .with_retry(3, 30_000),
    );

    let execution = tokio::time::timeout(Duration::from_secs(5), harness.run(graph, 1))
        .await
        .expect("deadline should cut the backoff short");
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.error.as_deref(),
        Some("Execution timed out after 1s")
    );
    assert_eq!(harness.count("shaky"), 1);
}

#[tokio::test]
async fn test_start_requires_pending_execution() {
    let harness = Harness::new();
    let request = harness.prepare(linear(), json!({}), 0).await;
    let id = request.execution_id;

    harness.runtime.start(request.clone()).await.unwrap();
    harness.runtime.wait(id).await;

    match harness.runtime.start(request).await {
        Err(RuntimeError::InvalidState { status, .. }) => {
            assert_eq!(status, ExecutionStatus::Succeeded)
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }
    assert!(matches!(
        harness.runtime.signal(Uuid::new_v4(), RuntimeSignal::Cancel).await,
        Err(RuntimeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_resume_replays_journaled_steps() {
    let harness = Harness::new();
    let request = harness.prepare(linear(), json!({}), 0).await;
    let id = request.execution_id;

    let mut journal = Journal::default();
    journal.record(
        Journal::key("start", 0),
        StepRecord::Completed {
            output: NodeOutput::new().with_data("node", "start"),
        },
    );
    journal.record(
        Journal::key("a1", 0),
        StepRecord::Completed {
            output: NodeOutput::new().with_data("node", "a1"),
        },
    );
    let checkpoint = Checkpoint { request, journal };
    harness
        .store
        .save_checkpoint(id, serde_json::to_value(&checkpoint).unwrap())
        .await
        .unwrap();

    harness.runtime.resume(id).await.unwrap();
    assert_eq!(harness.runtime.wait(id).await, Some(ExecutionStatus::Succeeded));
    assert_eq!(harness.calls(), vec!["end"]);

    let records = harness.store.list_node_executions(id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].node_id, "end");
}

#[tokio::test]
async fn test_resume_rejects_finished_execution() {
    let harness = Harness::new();
    let execution = harness.run(linear(), 0).await;

    assert!(matches!(
        harness.runtime.resume(execution.id).await,
        Err(RuntimeError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_validator_reports_structural_issues() {
    let harness = Harness::new();
    let validator = GraphValidator::new(Arc::clone(&harness.registry));

    assert!(validator.validate(&linear()).is_empty());

    let mut graph = Graph::new();
    graph.add_node(Node::new("start", "start"));
    graph.add_node(Node::new("check", "condition"));
    graph.add_node(Node::new("act", "activity"));
    graph.add_node(Node::new("odd", "mystery"));
    graph.add_node(Node::new("island", "log"));
    graph.connect("start", "check");
    graph.connect_port("check", "maybe", "act");
    graph.connect("act", "odd");

    let issues: Vec<String> = validator.validate(&graph).iter().map(|i| i.to_string()).collect();
    assert!(issues.contains(&"node 'check': 'condition' has no output port 'maybe'".to_string()));
    assert!(issues.contains(&"node 'act': missing required config 'activity_id'".to_string()));
    assert!(issues.contains(&"node 'odd': unknown node type 'mystery'".to_string()));
    assert!(issues.contains(&"node 'island': required input is not connected".to_string()));
    assert!(issues.contains(&"node 'island': not reachable from a start node".to_string()));
}
