use crate::error::RuntimeError;
use crate::executor::{PlanExecutor, RunControl, RunOutcome};
use crate::journal::{Checkpoint, Journal};
use crate::registry::NodeTypeRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wfcore::{
    ConfigMap, EventBus, ExecutionEvent, ExecutionPlan, ExecutionStatus, ExecutionStore,
};

/// Everything the runtime needs to drive one execution. Persisted in the
/// checkpoint, so it must round-trip through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub execution_id: Uuid,
    pub tenant_id: Uuid,
    pub plan: ExecutionPlan,
    pub input: Value,
    #[serde(default)]
    pub variables: ConfigMap,
    pub started_by: Option<String>,
    pub is_test: bool,
    pub mock_outputs: Option<ConfigMap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum RuntimeSignal {
    /// Cooperative cancellation, observed at step and loop boundaries and
    /// inside suspending executors.
    Cancel,
    /// Push the execution deadline back.
    ExtendDeadline { seconds: u64 },
}

/// The durable driver the execution service hands plans to.
#[async_trait]
pub trait ExecutionRuntime: Send + Sync {
    /// Accept a PENDING execution: mark it RUNNING and start driving it.
    async fn start(&self, request: StartRequest) -> Result<(), RuntimeError>;

    async fn signal(&self, execution_id: Uuid, signal: RuntimeSignal) -> Result<(), RuntimeError>;
}

/// Handle for a running execution
#[derive(Clone)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    cancellation: CancellationToken,
    deadline: Arc<watch::Sender<Option<tokio::time::Instant>>>,
    done: watch::Receiver<Option<ExecutionStatus>>,
}

impl ExecutionHandle {
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn extend_deadline(&self, seconds: u64) {
        self.deadline.send_modify(|deadline| {
            if let Some(at) = deadline {
                *at += Duration::from_secs(seconds);
            }
        });
    }

    /// Wait for the terminal status.
    pub async fn wait(&self) -> Option<ExecutionStatus> {
        let mut done = self.done.clone();
        loop {
            if let Some(status) = *done.borrow_and_update() {
                return Some(status);
            }
            if done.changed().await.is_err() {
                return *done.borrow();
            }
        }
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    pub approval_poll_interval_ms: u64,
    pub default_max_loop_iterations: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            approval_poll_interval_ms: 1000,
            default_max_loop_iterations: 1000,
        }
    }
}

/// Drives compiled plans as background tasks, one per execution.
pub struct WorkflowRuntime {
    executor: Arc<PlanExecutor>,
    store: Arc<dyn ExecutionStore>,
    event_bus: Arc<EventBus>,
    handles: Arc<RwLock<HashMap<Uuid, ExecutionHandle>>>,
}

impl WorkflowRuntime {
    pub fn new(
        registry: Arc<NodeTypeRegistry>,
        store: Arc<dyn ExecutionStore>,
        config: RuntimeConfig,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self::with_event_bus(registry, store, event_bus, config)
    }

    pub fn with_event_bus(
        registry: Arc<NodeTypeRegistry>,
        store: Arc<dyn ExecutionStore>,
        event_bus: Arc<EventBus>,
        config: RuntimeConfig,
    ) -> Self {
        let executor = Arc::new(PlanExecutor::new(
            registry,
            Arc::clone(&store),
            Arc::clone(&event_bus),
            config.max_parallel_nodes,
        ));
        Self {
            executor,
            store,
            event_bus,
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub async fn handle(&self, execution_id: Uuid) -> Option<ExecutionHandle> {
        self.handles.read().await.get(&execution_id).cloned()
    }

    /// Wait for an execution to reach a terminal status. Falls back to the
    /// stored record once the execution is no longer in flight.
    pub async fn wait(&self, execution_id: Uuid) -> Option<ExecutionStatus> {
        if let Some(handle) = self.handle(execution_id).await {
            return handle.wait().await;
        }
        match self.store.get_execution(execution_id).await {
            Ok(execution) => execution.map(|e| e.status),
            Err(e) => {
                tracing::warn!("Failed to load execution {}: {}", execution_id, e);
                None
            }
        }
    }

    /// Re-drive an interrupted execution from its checkpoint. Steps whose
    /// outcome is journaled are replayed, not re-executed.
    pub async fn resume(&self, execution_id: Uuid) -> Result<(), RuntimeError> {
        let mut execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(RuntimeError::NotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Err(RuntimeError::InvalidState {
                execution_id,
                status: execution.status,
            });
        }
        if self.handles.read().await.contains_key(&execution_id) {
            return Err(RuntimeError::AlreadyRunning(execution_id));
        }

        let checkpoint = self
            .store
            .load_checkpoint(execution_id)
            .await?
            .ok_or(RuntimeError::NotFound(execution_id))?;
        let checkpoint: Checkpoint = serde_json::from_value(checkpoint)?;

        let started_at = match execution.started_at {
            Some(at) => at,
            None => {
                let now = Utc::now();
                execution.status = ExecutionStatus::Running;
                execution.started_at = Some(now);
                self.store.update_execution(execution).await?;
                now
            }
        };

        tracing::info!(
            "Resuming execution {} with {} journaled steps",
            execution_id,
            checkpoint.journal.len()
        );
        self.launch(checkpoint.request, checkpoint.journal, started_at)
            .await
    }

    async fn launch(
        &self,
        request: StartRequest,
        journal: Journal,
        started_at: DateTime<Utc>,
    ) -> Result<(), RuntimeError> {
        let execution_id = request.execution_id;
        let checkpoint = Checkpoint {
            request: request.clone(),
            journal: journal.clone(),
        };
        self.store
            .save_checkpoint(execution_id, serde_json::to_value(&checkpoint)?)
            .await?;

        let (deadline_tx, deadline_rx) =
            watch::channel(deadline_from(started_at, request.plan.timeout_seconds));
        let (done_tx, done_rx) = watch::channel(None);
        let cancellation = CancellationToken::new();

        let handle = ExecutionHandle {
            execution_id,
            cancellation: cancellation.clone(),
            deadline: Arc::new(deadline_tx),
            done: done_rx,
        };
        self.handles.write().await.insert(execution_id, handle);

        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            definition_id: request.plan.definition_id,
            timestamp: Utc::now(),
        });
        tracing::info!("Starting workflow execution: {}", execution_id);

        let executor = Arc::clone(&self.executor);
        let store = Arc::clone(&self.store);
        let event_bus = Arc::clone(&self.event_bus);
        let handles = Arc::clone(&self.handles);
        let control = RunControl {
            cancellation,
            deadline: deadline_rx,
        };

        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let outcome = executor.execute(&request, journal, control).await;
            let status = finalize(store.as_ref(), execution_id, outcome).await;

            event_bus.emit(ExecutionEvent::WorkflowCompleted {
                execution_id,
                status,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });
            handles.write().await.remove(&execution_id);
            let _ = done_tx.send(Some(status));
        });

        Ok(())
    }
}

#[async_trait]
impl ExecutionRuntime for WorkflowRuntime {
    async fn start(&self, request: StartRequest) -> Result<(), RuntimeError> {
        let execution_id = request.execution_id;
        let mut execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(RuntimeError::NotFound(execution_id))?;
        if execution.status != ExecutionStatus::Pending {
            return Err(RuntimeError::InvalidState {
                execution_id,
                status: execution.status,
            });
        }
        if self.handles.read().await.contains_key(&execution_id) {
            return Err(RuntimeError::AlreadyRunning(execution_id));
        }

        let now = Utc::now();
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(now);
        self.store.update_execution(execution).await?;

        self.launch(request, Journal::default(), now).await
    }

    async fn signal(&self, execution_id: Uuid, signal: RuntimeSignal) -> Result<(), RuntimeError> {
        let handle = self
            .handle(execution_id)
            .await
            .ok_or(RuntimeError::NotFound(execution_id))?;
        tracing::info!("Signalling execution {}: {:?}", execution_id, signal);
        match signal {
            RuntimeSignal::Cancel => handle.cancel(),
            RuntimeSignal::ExtendDeadline { seconds } => handle.extend_deadline(seconds),
        }
        Ok(())
    }
}

/// Deadline measured from RUNNING entry; zero means unbounded.
fn deadline_from(started_at: DateTime<Utc>, timeout_seconds: u64) -> Option<tokio::time::Instant> {
    if timeout_seconds == 0 {
        return None;
    }
    let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
    let remaining = Duration::from_secs(timeout_seconds).saturating_sub(elapsed);
    Some(tokio::time::Instant::now() + remaining)
}

/// Write the outcome unless something else (a cancel) already closed the
/// record; returns the status the record ends with.
async fn finalize(store: &dyn ExecutionStore, execution_id: Uuid, outcome: RunOutcome) -> ExecutionStatus {
    let status = outcome.status;
    match store
        .finish_execution(execution_id, status, outcome.output, outcome.error.clone())
        .await
    {
        Ok(true) => {
            match status {
                ExecutionStatus::Failed => tracing::error!(
                    "Execution {} failed: {}",
                    execution_id,
                    outcome.error.as_deref().unwrap_or("unknown error")
                ),
                _ => tracing::info!("Execution {} finished: {}", execution_id, status),
            }
            status
        }
        Ok(false) => match store.get_execution(execution_id).await {
            Ok(Some(execution)) => {
                tracing::info!(
                    "Execution {} already {}, keeping recorded status",
                    execution_id,
                    execution.status
                );
                execution.status
            }
            Ok(None) => status,
            Err(e) => {
                tracing::error!("Failed to load execution {}: {}", execution_id, e);
                status
            }
        },
        Err(e) => {
            tracing::error!("Failed to record outcome of {}: {}", execution_id, e);
            status
        }
    }
}
