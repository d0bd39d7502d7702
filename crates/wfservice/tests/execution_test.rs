use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use wfcore::{
    ExecutionStatus, ExecutionStore, Graph, InMemoryStore, NewDefinition, Node, NodeExecutionStatus,
    WorkflowDefinition,
};
use wfnodes::{
    standard_registry, ActivityRequest, ActivityResult, ActivityService, CollaboratorError,
    Collaborators,
};
use wfruntime::{ExecutionRuntime, RuntimeConfig, RuntimeError, RuntimeSignal, StartRequest, WorkflowRuntime};
use wfservice::{StartExecution, WorkflowDefinitionService, WorkflowExecutionService};

/// Accepts executions and leaves them PENDING.
#[derive(Default)]
struct ParkedRuntime {
    started: Mutex<Vec<StartRequest>>,
}

#[async_trait]
impl ExecutionRuntime for ParkedRuntime {
    async fn start(&self, request: StartRequest) -> Result<(), RuntimeError> {
        self.started.lock().unwrap().push(request);
        Ok(())
    }

    async fn signal(&self, execution_id: Uuid, _signal: RuntimeSignal) -> Result<(), RuntimeError> {
        Err(RuntimeError::NotFound(execution_id))
    }
}

struct RefusingRuntime;

#[async_trait]
impl ExecutionRuntime for RefusingRuntime {
    async fn start(&self, request: StartRequest) -> Result<(), RuntimeError> {
        Err(RuntimeError::AlreadyRunning(request.execution_id))
    }

    async fn signal(&self, execution_id: Uuid, _signal: RuntimeSignal) -> Result<(), RuntimeError> {
        Err(RuntimeError::NotFound(execution_id))
    }
}

fn linear_graph() -> Graph {
    let mut graph = Graph::new();
    graph.add_node(Node::new("start", "start"));
    graph.add_node(Node::new("a1", "activity").with_config("activity_id", "provision-vm"));
    graph.add_node(Node::new("end", "end"));
    graph.connect("start", "a1");
    graph.connect("a1", "end");
    graph
}

struct Harness {
    store: InMemoryStore,
    definitions: WorkflowDefinitionService,
    executions: WorkflowExecutionService,
    tenant: Uuid,
}

impl Harness {
    fn new(runtime: impl FnOnce(&InMemoryStore) -> Arc<dyn ExecutionRuntime>) -> Self {
        let store = InMemoryStore::new();
        let registry = Arc::new(standard_registry(&Collaborators::default(), &RuntimeConfig::default()));
        let runtime = runtime(&store);
        Self {
            definitions: WorkflowDefinitionService::new(Arc::new(store.clone()), registry),
            executions: WorkflowExecutionService::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                runtime,
            ),
            store,
            tenant: Uuid::new_v4(),
        }
    }

    async fn active(&self, new: NewDefinition) -> WorkflowDefinition {
        let draft = self.definitions.create(self.tenant, new).await.unwrap();
        self.definitions.publish(self.tenant, draft.id).await.unwrap()
    }
}

fn workflow_runtime(store: &InMemoryStore) -> Arc<dyn ExecutionRuntime> {
    let registry = Arc::new(standard_registry(&Collaborators::default(), &RuntimeConfig::default()));
    Arc::new(WorkflowRuntime::new(registry, Arc::new(store.clone()), RuntimeConfig::default()))
}

struct FailingActivities;

#[async_trait]
impl ActivityService for FailingActivities {
    async fn execute(&self, _request: ActivityRequest) -> Result<ActivityResult, CollaboratorError> {
        Ok(ActivityResult::failed("quota exceeded"))
    }
}

fn failing_runtime(store: &InMemoryStore) -> Arc<dyn ExecutionRuntime> {
    let collaborators = Collaborators {
        activities: Arc::new(FailingActivities),
        ..Collaborators::default()
    };
    let registry = Arc::new(standard_registry(&collaborators, &RuntimeConfig::default()));
    Arc::new(WorkflowRuntime::new(registry, Arc::new(store.clone()), RuntimeConfig::default()))
}

#[tokio::test]
async fn test_concurrency_limit_and_test_bypass() {
    let harness = Harness::new(|_| Arc::new(ParkedRuntime::default()));
    let mut new = NewDefinition::new("deploy").with_graph(linear_graph());
    new.max_concurrent = 2;
    let definition = harness.active(new).await;

    for _ in 0..2 {
        let execution = harness
            .executions
            .start(harness.tenant, definition.id, StartExecution::new(json!({})))
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);
    }

    let err = harness
        .executions
        .start(harness.tenant, definition.id, StartExecution::new(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONCURRENT_LIMIT");

    let test_run = harness
        .executions
        .start(
            harness.tenant,
            definition.id,
            StartExecution::new(json!({})).test(None),
        )
        .await
        .unwrap();
    assert!(test_run.is_test);
}

#[tokio::test]
async fn test_racing_starts_respect_the_limit() {
    let harness = Arc::new(Harness::new(|_| Arc::new(ParkedRuntime::default())));
    let mut new = NewDefinition::new("deploy").with_graph(linear_graph());
    new.max_concurrent = 3;
    let definition_id = harness.active(new).await.id;

    let attempts: Vec<_> = (0..10)
        .map(|_| {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move {
                harness
                    .executions
                    .start(harness.tenant, definition_id, StartExecution::new(json!({})))
                    .await
                    .is_ok()
            })
        })
        .collect();

    let mut accepted = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(harness.executions.pending_starts().await, 0);
}

#[tokio::test]
async fn test_start_requires_active_unless_test() {
    let harness = Harness::new(|_| Arc::new(ParkedRuntime::default()));
    let draft = harness
        .definitions
        .create(harness.tenant, NewDefinition::new("deploy").with_graph(linear_graph()))
        .await
        .unwrap();

    let err = harness
        .executions
        .start(harness.tenant, draft.id, StartExecution::new(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_ACTIVE");

    assert!(harness
        .executions
        .start(harness.tenant, draft.id, StartExecution::new(json!({})).test(None))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_runtime_refusal_leaves_failed_row() {
    let harness = Harness::new(|_| Arc::new(RefusingRuntime));
    let definition = harness
        .active(NewDefinition::new("deploy").with_graph(linear_graph()))
        .await;

    let execution = harness
        .executions
        .start(harness.tenant, definition.id, StartExecution::new(json!({})))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.error.unwrap().starts_with("Failed to start execution"));

    let stored = harness.store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_cancel_is_authoritative_and_status_checked() {
    let harness = Harness::new(|_| Arc::new(ParkedRuntime::default()));
    let definition = harness
        .active(NewDefinition::new("deploy").with_graph(linear_graph()))
        .await;
    let execution = harness
        .executions
        .start(harness.tenant, definition.id, StartExecution::new(json!({})))
        .await
        .unwrap();

    let cancelled = harness.executions.cancel(harness.tenant, execution.id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    let err = harness
        .executions
        .cancel(harness.tenant, execution.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");

    let err = harness
        .executions
        .retry(harness.tenant, execution.id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");
}

#[tokio::test]
async fn test_end_to_end_run_records_every_node() {
    let harness = Harness::new(workflow_runtime);
    let definition = harness
        .active(NewDefinition::new("deploy").with_graph(linear_graph()))
        .await;

    let execution = harness
        .executions
        .start(harness.tenant, definition.id, StartExecution::new(json!({"size": "small"})))
        .await
        .unwrap();

    let finished = wait_terminal(&harness, execution.id).await;
    assert_eq!(finished.status, ExecutionStatus::Succeeded);

    let nodes = harness
        .executions
        .node_executions(harness.tenant, execution.id)
        .await
        .unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| n.status == NodeExecutionStatus::Succeeded));
}

#[tokio::test]
async fn test_retry_creates_new_execution_with_same_input() {
    let harness = Harness::new(failing_runtime);
    let definition = harness
        .active(NewDefinition::new("deploy").with_graph(linear_graph()))
        .await;

    let execution = harness
        .executions
        .start(harness.tenant, definition.id, StartExecution::new(json!({"size": "large"})))
        .await
        .unwrap();
    let first = wait_terminal(&harness, execution.id).await;
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert!(first.error.unwrap().contains("quota exceeded"));

    let retried = harness
        .executions
        .retry(harness.tenant, execution.id)
        .await
        .unwrap();
    assert_ne!(retried.id, execution.id);
    assert_eq!(retried.input, json!({"size": "large"}));
    assert_eq!(
        harness
            .executions
            .list(harness.tenant, Some(definition.id), None)
            .await
            .unwrap()
            .len(),
        2
    );
}

async fn wait_terminal(harness: &Harness, execution_id: Uuid) -> wfcore::WorkflowExecution {
    for _ in 0..200 {
        let execution = harness.executions.get(harness.tenant, execution_id).await.unwrap();
        if execution.status.is_terminal() {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} did not finish", execution_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_runtime_finish_never_overwrites() {
    let harness = Harness::new(|_| Arc::new(ParkedRuntime::default()));
    let definition = harness
        .active(NewDefinition::new("deploy").with_graph(linear_graph()))
        .await;

    for _ in 0..20 {
        let execution = harness
            .executions
            .start(harness.tenant, definition.id, StartExecution::new(json!({})))
            .await
            .unwrap();

        let (cancelled, finished) = tokio::join!(
            harness.executions.cancel(harness.tenant, execution.id),
            harness.store.finish_execution(
                execution.id,
                ExecutionStatus::Succeeded,
                Some(json!({"end": {}})),
                None,
            ),
        );

        let stored = harness.store.get_execution(execution.id).await.unwrap().unwrap();
        if finished.unwrap() {
            assert_eq!(stored.status, ExecutionStatus::Succeeded);
            assert_eq!(stored.output, Some(json!({"end": {}})));
            if let Ok(returned) = cancelled {
                assert_eq!(returned.status, ExecutionStatus::Succeeded);
            }
        } else {
            assert_eq!(stored.status, ExecutionStatus::Cancelled);
            assert_eq!(stored.output, None);
            assert_eq!(cancelled.unwrap().status, ExecutionStatus::Cancelled);
        }
    }
}

#[tokio::test]
async fn test_start_locks_are_released() {
    let harness = Harness::new(|_| Arc::new(ParkedRuntime::default()));
    let mut new = NewDefinition::new("deploy").with_graph(linear_graph());
    new.max_concurrent = 1;
    let definition = harness.active(new).await;

    harness
        .executions
        .start(harness.tenant, definition.id, StartExecution::new(json!({})))
        .await
        .unwrap();
    assert_eq!(harness.executions.pending_starts().await, 0);

    let err = harness
        .executions
        .start(harness.tenant, definition.id, StartExecution::new(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONCURRENT_LIMIT");
    assert_eq!(harness.executions.pending_starts().await, 0);
}
