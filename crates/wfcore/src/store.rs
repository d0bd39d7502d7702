//! Storage seams for definitions, executions and runtime checkpoints.
//!
//! [`InMemoryStore`] implements both traits and backs the CLI and tests.

use crate::records::{
    ExecutionFilter, ExecutionStatus, WorkflowDefinition, WorkflowExecution,
    WorkflowNodeExecution,
};
use crate::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn insert_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    async fn update_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError>;

    /// Returns soft-deleted rows too; callers decide visibility.
    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn list_definitions(&self, tenant_id: Uuid) -> Result<Vec<WorkflowDefinition>, StoreError>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError>;

    async fn update_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Move an execution to a terminal status in one step. Returns false and
    /// leaves the row untouched when it is already terminal.
    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<bool, StoreError>;

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Executions of a definition that are PENDING or RUNNING.
    async fn count_active(&self, definition_id: Uuid) -> Result<usize, StoreError>;

    async fn insert_node_execution(&self, record: WorkflowNodeExecution) -> Result<(), StoreError>;

    async fn update_node_execution(&self, record: WorkflowNodeExecution) -> Result<(), StoreError>;

    async fn list_node_executions(&self, execution_id: Uuid) -> Result<Vec<WorkflowNodeExecution>, StoreError>;

    /// Opaque runtime checkpoint (start request plus journal).
    async fn save_checkpoint(&self, execution_id: Uuid, checkpoint: Value) -> Result<(), StoreError>;

    async fn load_checkpoint(&self, execution_id: Uuid) -> Result<Option<Value>, StoreError>;
}

#[derive(Default)]
struct Tables {
    definitions: HashMap<Uuid, WorkflowDefinition>,
    executions: HashMap<Uuid, WorkflowExecution>,
    node_executions: HashMap<Uuid, Vec<WorkflowNodeExecution>>,
    checkpoints: HashMap<Uuid, Value>,
}

/// Process-local store guarded by a single async lock.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for InMemoryStore {
    async fn insert_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.definitions.contains_key(&definition.id) {
            return Err(StoreError::Conflict(definition.id.to_string()));
        }
        tables.definitions.insert(definition.id, definition);
        Ok(())
    }

    async fn update_definition(&self, definition: WorkflowDefinition) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.definitions.get_mut(&definition.id) {
            Some(existing) => {
                *existing = definition;
                Ok(())
            }
            None => Err(StoreError::NotFound(definition.id.to_string())),
        }
    }

    async fn get_definition(&self, id: Uuid) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.tables.read().await.definitions.get(&id).cloned())
    }

    async fn list_definitions(&self, tenant_id: Uuid) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let tables = self.tables.read().await;
        let mut definitions: Vec<_> = tables
            .definitions
            .values()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        definitions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(definitions)
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn insert_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict(execution.id.to_string()));
        }
        tables.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn update_execution(&self, execution: WorkflowExecution) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.executions.get_mut(&execution.id) {
            Some(existing) => {
                *existing = execution;
                Ok(())
            }
            None => Err(StoreError::NotFound(execution.id.to_string())),
        }
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.tables.read().await.executions.get(&id).cloned())
    }

    async fn finish_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let execution = tables
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(execution.finish(status, output, error))
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, StoreError> {
        let tables = self.tables.read().await;
        let mut executions: Vec<_> = tables
            .executions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    async fn count_active(&self, definition_id: Uuid) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions
            .values()
            .filter(|e| e.definition_id == definition_id)
            .filter(|e| matches!(e.status, ExecutionStatus::Pending | ExecutionStatus::Running))
            .count())
    }

    async fn insert_node_execution(&self, record: WorkflowNodeExecution) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .node_executions
            .entry(record.execution_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn update_node_execution(&self, record: WorkflowNodeExecution) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .node_executions
            .get_mut(&record.execution_id)
            .and_then(|rows| rows.iter_mut().find(|r| r.id == record.id))
            .ok_or_else(|| StoreError::NotFound(record.id.to_string()))?;
        *existing = record;
        Ok(())
    }

    async fn list_node_executions(&self, execution_id: Uuid) -> Result<Vec<WorkflowNodeExecution>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .node_executions
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_checkpoint(&self, execution_id: Uuid, checkpoint: Value) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .checkpoints
            .insert(execution_id, checkpoint);
        Ok(())
    }

    async fn load_checkpoint(&self, execution_id: Uuid) -> Result<Option<Value>, StoreError> {
        Ok(self.tables.read().await.checkpoints.get(&execution_id).cloned())
    }
}
