use crate::journal::{Checkpoint, Journal, StepRecord};
use crate::registry::NodeTypeRegistry;
use crate::runtime::StartRequest;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use wfcore::{
    node_types, ports, EventBus, ExecutionEvent, ExecutionStatus, ExecutionStep, ExecutionStore,
    NodeContext, NodeError, NodeExecutionStatus, NodeOutput, StoreError, WorkflowNodeExecution,
};

/// Signals a running plan observes at its suspension points.
#[derive(Clone)]
pub struct RunControl {
    pub cancellation: CancellationToken,
    pub deadline: watch::Receiver<Option<tokio::time::Instant>>,
}

impl RunControl {
    pub fn unbounded() -> Self {
        let (_tx, deadline) = watch::channel(None);
        Self {
            cancellation: CancellationToken::new(),
            deadline,
        }
    }

    fn past_deadline(&self) -> bool {
        matches!(*self.deadline.borrow(), Some(at) if tokio::time::Instant::now() >= at)
    }

    /// Resolves once the current deadline passes, following extensions.
    async fn expired(&self) {
        let mut rx = self.deadline.clone();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                tokio::time::sleep_until(at).await;
                                return;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

/// Final state of one plan run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub journal: Journal,
}

/// Why a run stopped dispatching.
#[derive(Debug)]
enum Halt {
    Failed { node_id: String, error: String },
    Cancelled,
    TimedOut,
    Store(StoreError),
}

#[derive(Debug, Clone, PartialEq)]
enum StepState {
    Pending,
    Completed { port: String },
    Skipped,
}

enum Readiness {
    Ready,
    Blocked,
    Dead,
}

/// Walks an execution plan: dependency gating, dead-path elimination,
/// parallel groups, loop bodies and error-port routing.
pub struct PlanExecutor {
    registry: Arc<NodeTypeRegistry>,
    store: Arc<dyn ExecutionStore>,
    event_bus: Arc<EventBus>,
    max_parallel: usize,
}

impl PlanExecutor {
    pub fn new(
        registry: Arc<NodeTypeRegistry>,
        store: Arc<dyn ExecutionStore>,
        event_bus: Arc<EventBus>,
        max_parallel: usize,
    ) -> Self {
        Self {
            registry,
            store,
            event_bus,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run a plan to completion. Outcomes already present in `journal` are
    /// replayed instead of dispatched.
    pub async fn execute(
        &self,
        request: &StartRequest,
        journal: Journal,
        control: RunControl,
    ) -> RunOutcome {
        let mut run = Run::new(self, request, &control, journal);
        let result = run.run_scope(None).await;

        let (status, output, error) = match result {
            Ok(()) => (ExecutionStatus::Succeeded, Some(run.sink_output()), None),
            Err(Halt::Failed { node_id, error }) => (
                ExecutionStatus::Failed,
                None,
                Some(format!("Node {} failed: {}", node_id, error)),
            ),
            Err(Halt::Cancelled) => (ExecutionStatus::Cancelled, None, None),
            Err(Halt::TimedOut) => (
                ExecutionStatus::Failed,
                None,
                Some(format!(
                    "Execution timed out after {}s",
                    request.plan.timeout_seconds
                )),
            ),
            Err(Halt::Store(e)) => (
                ExecutionStatus::Failed,
                None,
                Some(format!("Store failure: {}", e)),
            ),
        };

        RunOutcome {
            status,
            output,
            error,
            journal: run.journal,
        }
    }

    /// One dispatch: record, invoke with retries, finalize the record.
    async fn dispatch(
        &self,
        request: &StartRequest,
        step: &ExecutionStep,
        mut ctx: NodeContext,
        control: &RunControl,
    ) -> Result<Result<NodeOutput, NodeError>, StoreError> {
        let execution_id = request.execution_id;
        let mut record = WorkflowNodeExecution::pending(
            execution_id,
            &step.node_id,
            &step.node_type,
            Value::Object(step.config.clone()),
        );
        self.store.insert_node_execution(record.clone()).await?;

        record.status = NodeExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        self.store.update_node_execution(record.clone()).await?;

        let started = Instant::now();
        let max_attempts = step.retry.as_ref().map_or(1, |p| p.max_attempts.max(1));

        let result = match self.registry.executor(&step.node_type) {
            None => Err(NodeError::ExecutionFailed(format!(
                "No executor registered for node type '{}'",
                step.node_type
            ))),
            Some(node) => loop {
                ctx.attempt = record.attempt;
                self.event_bus.emit(ExecutionEvent::NodeStarted {
                    execution_id,
                    node_id: step.node_id.clone(),
                    node_type: step.node_type.clone(),
                    attempt: record.attempt,
                    timestamp: Utc::now(),
                });

                // Cancellation is not raced here: a started step runs to
                // completion and the run halts at the next boundary.
                let attempt = tokio::select! {
                    result = node.execute(ctx.clone()) => match result {
                        Ok(NodeOutput { error: Some(e), .. }) => Err(NodeError::ExecutionFailed(e)),
                        other => other,
                    },
                    _ = control.expired() => Err(NodeError::Timeout {
                        seconds: request.plan.timeout_seconds,
                    }),
                };

                match (attempt, step.retry.as_ref()) {
                    (Err(e), Some(policy)) if !e.is_interrupt() && record.attempt < max_attempts => {
                        let delay = policy.delay_for(record.attempt);
                        tracing::warn!(
                            "Node {} attempt {} failed, retrying in {:?}: {}",
                            step.node_id,
                            record.attempt,
                            delay,
                            e
                        );
                        record.attempt += 1;
                        self.store.update_node_execution(record.clone()).await?;
                        tokio::select! {
                            _ = control.cancellation.cancelled() => break Err(NodeError::Cancelled),
                            _ = control.expired() => break Err(NodeError::Timeout {
                                seconds: request.plan.timeout_seconds,
                            }),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    (result, _) => break result,
                }
            },
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        record.completed_at = Some(Utc::now());
        match &result {
            Ok(output) => {
                tracing::info!("Node {} completed in {}ms", step.node_id, duration_ms);
                record.status = NodeExecutionStatus::Succeeded;
                record.output = Some(Value::Object(output.data.clone()));
                self.event_bus.emit(ExecutionEvent::NodeCompleted {
                    execution_id,
                    node_id: step.node_id.clone(),
                    port: output.next_port.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                tracing::error!("Node {} failed: {}", step.node_id, e);
                record.status = NodeExecutionStatus::Failed;
                record.error = Some(e.to_string());
                self.event_bus.emit(ExecutionEvent::NodeFailed {
                    execution_id,
                    node_id: step.node_id.clone(),
                    error: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
        self.store.update_node_execution(record).await?;

        Ok(result)
    }
}

/// Mutable state of one plan run.
struct Run<'a> {
    executor: &'a PlanExecutor,
    request: &'a StartRequest,
    control: &'a RunControl,
    steps: HashMap<&'a str, &'a ExecutionStep>,
    error_routed: HashSet<&'a str>,
    state: HashMap<String, StepState>,
    outputs: HashMap<String, Value>,
    dispatch_seq: HashMap<String, u32>,
    journal: Journal,
}

impl<'a> Run<'a> {
    fn new(
        executor: &'a PlanExecutor,
        request: &'a StartRequest,
        control: &'a RunControl,
        journal: Journal,
    ) -> Self {
        let plan = &request.plan;
        let steps = plan.steps.iter().map(|s| (s.node_id.as_str(), s)).collect();
        let error_routed = plan
            .steps
            .iter()
            .flat_map(|s| s.inbound.iter())
            .filter(|e| e.port == ports::ERROR)
            .map(|e| e.source.as_str())
            .collect();
        let state = plan
            .steps
            .iter()
            .map(|s| (s.node_id.clone(), StepState::Pending))
            .collect();

        Self {
            executor,
            request,
            control,
            steps,
            error_routed,
            state,
            outputs: HashMap::new(),
            dispatch_seq: HashMap::new(),
            journal,
        }
    }

    fn check_interrupts(&self) -> Result<(), Halt> {
        if self.control.cancellation.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        if self.control.past_deadline() {
            return Err(Halt::TimedOut);
        }
        Ok(())
    }

    /// Steps whose innermost loop is `scope`, in plan order.
    fn scope_steps(&self, scope: Option<&str>) -> Vec<&'a ExecutionStep> {
        self.request
            .plan
            .steps
            .iter()
            .filter(|s| s.loop_parent.as_deref() == scope)
            .collect()
    }

    fn is_within_loop(&self, step: &ExecutionStep, loop_id: &str) -> bool {
        let mut parent = step.loop_parent.as_deref();
        while let Some(current) = parent {
            if current == loop_id {
                return true;
            }
            parent = self.steps.get(current).and_then(|s| s.loop_parent.as_deref());
        }
        false
    }

    fn readiness(&self, step: &ExecutionStep, scope: Option<&str>) -> Readiness {
        if step.inbound.is_empty() {
            return Readiness::Ready;
        }

        let mut live = false;
        for edge in &step.inbound {
            if Some(edge.source.as_str()) == scope && edge.port == ports::BODY {
                live = true;
                continue;
            }
            match self.state.get(&edge.source) {
                Some(StepState::Completed { port }) => live |= *port == edge.port,
                Some(StepState::Skipped) => {}
                _ => return Readiness::Blocked,
            }
        }

        // A merge joins only once every sibling of its group is settled.
        if step.node_type == node_types::MERGE {
            if let Some(group) = &step.parallel_group {
                let open_sibling = self.scope_steps(scope).into_iter().any(|s| {
                    s.node_id != step.node_id
                        && s.parallel_group.as_ref() == Some(group)
                        && self.state.get(&s.node_id) == Some(&StepState::Pending)
                });
                if open_sibling {
                    return Readiness::Blocked;
                }
            }
        }

        if live {
            Readiness::Ready
        } else {
            Readiness::Dead
        }
    }

    fn skip(&mut self, node_id: &str) {
        tracing::debug!("Skipping node {}", node_id);
        self.state.insert(node_id.to_string(), StepState::Skipped);
        self.executor.event_bus.emit(ExecutionEvent::NodeSkipped {
            execution_id: self.request.execution_id,
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Dispatch every step of a scope until nothing more can run.
    fn run_scope<'s>(&'s mut self, scope: Option<&'s str>) -> BoxFuture<'s, Result<(), Halt>> {
        Box::pin(async move {
            let steps = self.scope_steps(scope);

            loop {
                self.check_interrupts()?;

                let mut ready = Vec::new();
                loop {
                    let mut changed = false;
                    ready.clear();
                    for step in &steps {
                        if self.state.get(&step.node_id) != Some(&StepState::Pending) {
                            continue;
                        }
                        match self.readiness(step, scope) {
                            Readiness::Ready => ready.push(*step),
                            Readiness::Dead => {
                                self.skip(&step.node_id);
                                changed = true;
                            }
                            Readiness::Blocked => {}
                        }
                    }
                    if !changed {
                        break;
                    }
                }

                let Some(first) = ready.first().copied() else {
                    break;
                };

                if node_types::is_loop(&first.node_type) {
                    self.run_loop(first).await?;
                    continue;
                }

                let batch: Vec<&ExecutionStep> = match &first.parallel_group {
                    Some(group) => ready
                        .iter()
                        .copied()
                        .filter(|s| s.parallel_group.as_ref() == Some(group))
                        .filter(|s| !node_types::is_loop(&s.node_type))
                        .take(self.executor.max_parallel)
                        .collect(),
                    None => vec![first],
                };
                let batch = batch.into_iter().map(|s| (s, 0)).collect();
                self.dispatch_batch(batch).await?;
            }

            for step in steps {
                if self.state.get(&step.node_id) == Some(&StepState::Pending) {
                    tracing::warn!("Node {} never became eligible", step.node_id);
                    self.skip(&step.node_id);
                }
            }
            Ok(())
        })
    }

    /// Re-offer a loop's body once per pass until the loop node exits.
    async fn run_loop(&mut self, loop_step: &'a ExecutionStep) -> Result<(), Halt> {
        let loop_id = loop_step.node_id.as_str();
        let mut passes = 0u32;

        loop {
            self.check_interrupts()?;
            self.dispatch_batch(vec![(loop_step, passes)]).await?;

            let took_body = matches!(
                self.state.get(loop_id),
                Some(StepState::Completed { port }) if port == ports::BODY
            );
            if !took_body {
                break;
            }

            passes += 1;
            tracing::debug!("Loop {} pass {}", loop_id, passes);
            let body: Vec<String> = self
                .request
                .plan
                .steps
                .iter()
                .filter(|s| self.is_within_loop(s, loop_id))
                .map(|s| s.node_id.clone())
                .collect();
            for node_id in body {
                self.state.insert(node_id, StepState::Pending);
            }
            self.run_scope(Some(loop_id)).await?;
        }

        if passes == 0 {
            let body: Vec<&'a ExecutionStep> = self
                .request
                .plan
                .steps
                .iter()
                .filter(|s| self.is_within_loop(s, loop_id))
                .collect();
            for step in body {
                self.skip(&step.node_id);
            }
        }
        Ok(())
    }

    fn context_for(&self, step: &ExecutionStep, iteration: u32) -> NodeContext {
        let request = self.request;
        let events = self
            .executor
            .event_bus
            .create_emitter(request.execution_id, &step.node_id);

        let mut ctx = NodeContext::new(&step.node_id, &step.node_type, request.execution_id, events);
        ctx.config = step.config.clone();
        ctx.input = request.input.clone();
        ctx.node_outputs = self.outputs.clone();
        ctx.variables = request.variables.clone();
        ctx.tenant_id = request.tenant_id;
        ctx.started_by = request.started_by.clone();
        ctx.is_test = request.is_test;
        ctx.mock_outputs = request.mock_outputs.clone();
        ctx.iteration = iteration;
        ctx.cancellation = self.control.cancellation.clone();
        ctx
    }

    fn next_key(&mut self, node_id: &str) -> String {
        let seq = self.dispatch_seq.entry(node_id.to_string()).or_insert(0);
        let key = Journal::key(node_id, *seq);
        *seq += 1;
        key
    }

    /// Dispatch steps concurrently and apply their outcomes. In-flight
    /// siblings always finish before a failure halts the run.
    async fn dispatch_batch(&mut self, batch: Vec<(&'a ExecutionStep, u32)>) -> Result<(), Halt> {
        let mut replayed = Vec::new();
        let mut live = Vec::new();
        for (step, iteration) in batch {
            let key = self.next_key(&step.node_id);
            match self.journal.get(&key) {
                Some(record) => {
                    tracing::debug!("Replaying {} from journal", key);
                    replayed.push((step, record.clone().into_result()));
                }
                None => live.push((step, key, self.context_for(step, iteration))),
            }
        }

        let executor = self.executor;
        let request = self.request;
        let control = self.control;
        let mut running: FuturesUnordered<_> = live
            .into_iter()
            .map(|(step, key, ctx)| async move {
                let result = executor.dispatch(request, step, ctx, control).await;
                (step, key, result)
            })
            .collect();

        let mut halt = None;
        for (step, result) in replayed {
            if let Err(h) = self.apply(step, result) {
                halt.get_or_insert(h);
            }
        }

        let mut recorded = false;
        while let Some((step, key, result)) = running.next().await {
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    halt.get_or_insert(Halt::Store(e));
                    continue;
                }
            };
            if let Some(record) = StepRecord::from_result(&result) {
                self.journal.record(key, record);
                recorded = true;
            }
            if let Err(h) = self.apply(step, result) {
                halt.get_or_insert(h);
            }
        }

        if recorded {
            self.checkpoint().await;
        }
        match halt {
            Some(h) => Err(h),
            None => Ok(()),
        }
    }

    fn apply(&mut self, step: &ExecutionStep, result: Result<NodeOutput, NodeError>) -> Result<(), Halt> {
        let node_id = step.node_id.as_str();
        match result {
            Ok(output) => {
                self.outputs
                    .insert(node_id.to_string(), Value::Object(output.data));
                self.state.insert(
                    node_id.to_string(),
                    StepState::Completed {
                        port: output.next_port,
                    },
                );
                Ok(())
            }
            Err(NodeError::Cancelled) => Err(Halt::Cancelled),
            Err(NodeError::Timeout { .. }) => Err(Halt::TimedOut),
            Err(e) if self.error_routed.contains(node_id) => {
                tracing::info!("Node {} failed, following its error port", node_id);
                self.outputs.insert(
                    node_id.to_string(),
                    serde_json::json!({ "error": e.to_string() }),
                );
                self.state.insert(
                    node_id.to_string(),
                    StepState::Completed {
                        port: ports::ERROR.to_string(),
                    },
                );
                Ok(())
            }
            Err(e) => Err(Halt::Failed {
                node_id: node_id.to_string(),
                error: e.to_string(),
            }),
        }
    }

    async fn checkpoint(&self) {
        let checkpoint = Checkpoint {
            request: self.request.clone(),
            journal: self.journal.clone(),
        };
        let saved = match serde_json::to_value(&checkpoint) {
            Ok(value) => self
                .executor
                .store
                .save_checkpoint(self.request.execution_id, value)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = saved {
            tracing::warn!(
                "Failed to checkpoint execution {}: {}",
                self.request.execution_id,
                e
            );
        }
    }

    /// Data of every completed top-level step nothing else consumes.
    fn sink_output(&self) -> Value {
        let consumed: HashSet<&str> = self
            .request
            .plan
            .steps
            .iter()
            .flat_map(|s| s.inbound.iter().map(|e| e.source.as_str()))
            .collect();

        let mut output = serde_json::Map::new();
        for step in &self.request.plan.steps {
            if step.loop_parent.is_some() || consumed.contains(step.node_id.as_str()) {
                continue;
            }
            if let (Some(StepState::Completed { .. }), Some(data)) =
                (self.state.get(&step.node_id), self.outputs.get(&step.node_id))
            {
                output.insert(step.node_id.clone(), data.clone());
            }
        }
        Value::Object(output)
    }
}
