use crate::error::WorkflowExecutionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use wfcore::{
    compile, ConfigMap, DefinitionStatus, DefinitionStore, ExecutionFilter, ExecutionPlan,
    ExecutionStatus, ExecutionStore, WorkflowDefinition, WorkflowExecution, WorkflowNodeExecution,
};
use wfruntime::{ExecutionRuntime, RuntimeSignal, StartRequest};

type Result<T> = std::result::Result<T, WorkflowExecutionError>;

/// Parameters of a new execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartExecution {
    pub input: Value,
    pub is_test: bool,
    pub mock_configs: Option<ConfigMap>,
    pub started_by: Option<String>,
}

impl StartExecution {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn test(mut self, mock_configs: Option<ConfigMap>) -> Self {
        self.is_test = true;
        self.mock_configs = mock_configs;
        self
    }
}

/// Starts, cancels, retries and reports on workflow executions.
pub struct WorkflowExecutionService {
    definitions: Arc<dyn DefinitionStore>,
    executions: Arc<dyn ExecutionStore>,
    runtime: Arc<dyn ExecutionRuntime>,
    start_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl WorkflowExecutionService {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        executions: Arc<dyn ExecutionStore>,
        runtime: Arc<dyn ExecutionRuntime>,
    ) -> Self {
        Self {
            definitions,
            executions,
            runtime,
            start_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn start_lock(&self, definition_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.start_locks.lock().await;
        Arc::clone(locks.entry(definition_id).or_default())
    }

    /// Drop the caller's handle and forget the lock once nobody else holds it.
    async fn release_start_lock(&self, definition_id: Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.start_locks.lock().await;
        drop(lock);
        if locks
            .get(&definition_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&definition_id);
        }
    }

    /// Number of definitions with a start in progress.
    pub async fn pending_starts(&self) -> usize {
        self.start_locks.lock().await.len()
    }

    /// Concurrency check, compilation and the PENDING row. Runs under the
    /// definition's start lock.
    async fn admit(
        &self,
        definition: &WorkflowDefinition,
        params: StartExecution,
    ) -> Result<(WorkflowExecution, ExecutionPlan)> {
        let definition_id = definition.id;
        if !params.is_test {
            let active = self.executions.count_active(definition_id).await?;
            if active >= definition.max_concurrent as usize {
                tracing::warn!(
                    "Definition {} at concurrency limit ({}/{})",
                    definition_id,
                    active,
                    definition.max_concurrent
                );
                return Err(WorkflowExecutionError::ConcurrentLimit {
                    definition_id,
                    limit: definition.max_concurrent,
                });
            }
        }

        let graph = definition
            .graph
            .as_ref()
            .ok_or(WorkflowExecutionError::NoGraph(definition_id))?;
        let plan = compile(
            definition.id,
            definition.version,
            graph,
            definition.timeout_seconds,
        )?;

        let mut execution = WorkflowExecution::pending(definition, params.input);
        execution.started_by = params.started_by;
        execution.is_test = params.is_test;
        execution.mock_configs = params.mock_configs;
        self.executions.insert_execution(execution.clone()).await?;
        Ok((execution, plan))
    }

    /// Compile the definition and hand the plan to the runtime. The
    /// execution row exists even when the runtime refuses it.
    pub async fn start(
        &self,
        tenant_id: Uuid,
        definition_id: Uuid,
        params: StartExecution,
    ) -> Result<WorkflowExecution> {
        let definition = self
            .definitions
            .get_definition(definition_id)
            .await?
            .filter(|d| d.visible_to(tenant_id))
            .ok_or(WorkflowExecutionError::NotFound(definition_id))?;

        if !params.is_test && definition.status != DefinitionStatus::Active {
            return Err(WorkflowExecutionError::NotActive {
                definition_id,
                status: definition.status,
            });
        }

        // Count-then-create runs under a per-definition lock so racing
        // starts cannot both pass the limit.
        let lock = self.start_lock(definition_id).await;
        let admitted = {
            let _guard = lock.lock().await;
            self.admit(&definition, params).await
        };
        self.release_start_lock(definition_id, lock).await;
        let (execution, plan) = admitted?;

        tracing::info!(
            "Starting execution {} of definition {} v{}",
            execution.id,
            definition_id,
            definition.version
        );
        let request = StartRequest {
            execution_id: execution.id,
            tenant_id,
            plan,
            input: execution.input.clone(),
            variables: definition.variables.clone(),
            started_by: execution.started_by.clone(),
            is_test: execution.is_test,
            mock_outputs: execution.mock_configs.clone(),
        };

        if let Err(e) = self.runtime.start(request).await {
            tracing::error!("Runtime refused execution {}: {}", execution.id, e);
            self.executions
                .finish_execution(
                    execution.id,
                    ExecutionStatus::Failed,
                    None,
                    Some(format!("Failed to start execution: {}", e)),
                )
                .await?;
            return Ok(self
                .executions
                .get_execution(execution.id)
                .await?
                .unwrap_or(execution));
        }

        Ok(self
            .executions
            .get_execution(execution.id)
            .await?
            .unwrap_or(execution))
    }

    /// Signal the runtime, then record CANCELLED whether or not the signal
    /// was delivered.
    pub async fn cancel(&self, tenant_id: Uuid, execution_id: Uuid) -> Result<WorkflowExecution> {
        let execution = self.get(tenant_id, execution_id).await?;
        if !execution.status.is_active() {
            return Err(WorkflowExecutionError::InvalidStatus {
                execution_id,
                status: execution.status,
            });
        }

        if let Err(e) = self
            .runtime
            .signal(execution_id, RuntimeSignal::Cancel)
            .await
        {
            tracing::warn!("Cancel signal for {} not delivered: {}", execution_id, e);
        }

        if self
            .executions
            .finish_execution(execution_id, ExecutionStatus::Cancelled, None, None)
            .await?
        {
            tracing::info!("Cancelled execution {}", execution_id);
        }
        self.get(tenant_id, execution_id).await
    }

    /// Start a fresh execution with the inputs of a failed one.
    pub async fn retry(&self, tenant_id: Uuid, execution_id: Uuid) -> Result<WorkflowExecution> {
        let failed = self.get(tenant_id, execution_id).await?;
        if failed.status != ExecutionStatus::Failed {
            return Err(WorkflowExecutionError::InvalidStatus {
                execution_id,
                status: failed.status,
            });
        }

        tracing::info!("Retrying execution {}", execution_id);
        self.start(
            tenant_id,
            failed.definition_id,
            StartExecution {
                input: failed.input,
                is_test: failed.is_test,
                mock_configs: failed.mock_configs,
                started_by: failed.started_by,
            },
        )
        .await
    }

    pub async fn get(&self, tenant_id: Uuid, execution_id: Uuid) -> Result<WorkflowExecution> {
        self.executions
            .get_execution(execution_id)
            .await?
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or(WorkflowExecutionError::NotFound(execution_id))
    }

    /// Executions of the tenant, newest first.
    pub async fn list(
        &self,
        tenant_id: Uuid,
        definition_id: Option<Uuid>,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<WorkflowExecution>> {
        let filter = ExecutionFilter {
            tenant_id: Some(tenant_id),
            definition_id,
            status,
        };
        Ok(self.executions.list_executions(&filter).await?)
    }

    pub async fn node_executions(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<WorkflowNodeExecution>> {
        self.get(tenant_id, execution_id).await?;
        Ok(self.executions.list_node_executions(execution_id).await?)
    }
}
