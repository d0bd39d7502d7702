//! Persisted records: workflow definitions, executions and per-node
//! executions.

use crate::graph::{ConfigMap, Graph};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Archived,
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DefinitionStatus::Draft => "DRAFT",
            DefinitionStatus::Active => "ACTIVE",
            DefinitionStatus::Archived => "ARCHIVED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub version: u32,
    pub graph: Option<Graph>,
    pub status: DefinitionStatus,
    pub timeout_seconds: u64,
    pub max_concurrent: u32,
    pub workflow_type: String,
    /// Declared variables and their default values
    #[serde(default)]
    pub variables: ConfigMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    /// A fresh DRAFT at version 0.
    pub fn draft(tenant_id: Uuid, new: NewDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            name: new.name,
            description: new.description,
            version: 0,
            graph: new.graph,
            status: DefinitionStatus::Draft,
            timeout_seconds: new.timeout_seconds,
            max_concurrent: new.max_concurrent,
            workflow_type: new.workflow_type,
            variables: new.variables,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn visible_to(&self, tenant_id: Uuid) -> bool {
        self.tenant_id == tenant_id && !self.is_deleted()
    }
}

/// Payload for creating a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewDefinition {
    pub name: String,
    pub description: Option<String>,
    pub graph: Option<Graph>,
    pub timeout_seconds: u64,
    pub max_concurrent: u32,
    pub workflow_type: String,
    pub variables: ConfigMap,
}

impl NewDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_graph(mut self, graph: Graph) -> Self {
        self.graph = Some(graph);
        self
    }
}

impl Default for NewDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            graph: None,
            timeout_seconds: 3600,
            max_concurrent: 10,
            workflow_type: "automation".to_string(),
            variables: ConfigMap::new(),
        }
    }
}

/// Partial update of a DRAFT definition; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub graph: Option<Graph>,
    pub timeout_seconds: Option<u64>,
    pub max_concurrent: Option<u32>,
    pub workflow_type: Option<String>,
    pub variables: Option<ConfigMap>,
}

impl DefinitionPatch {
    pub fn apply(self, definition: &mut WorkflowDefinition) {
        if let Some(name) = self.name {
            definition.name = name;
        }
        if let Some(description) = self.description {
            definition.description = Some(description);
        }
        if let Some(graph) = self.graph {
            definition.graph = Some(graph);
        }
        if let Some(timeout) = self.timeout_seconds {
            definition.timeout_seconds = timeout;
        }
        if let Some(max) = self.max_concurrent {
            definition.max_concurrent = max;
        }
        if let Some(workflow_type) = self.workflow_type {
            definition.workflow_type = workflow_type;
        }
        if let Some(variables) = self.variables {
            definition.variables = variables;
        }
        definition.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub definition_id: Uuid,
    pub definition_version: u32,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_by: Option<String>,
    pub is_test: bool,
    pub mock_configs: Option<ConfigMap>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn pending(definition: &WorkflowDefinition, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: definition.tenant_id,
            definition_id: definition.id,
            definition_version: definition.version,
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            started_by: None,
            is_test: false,
            mock_configs: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to a terminal status. Returns false if already terminal.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.output = output;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One record per step dispatch; retries bump `attempt` on the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNodeExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowNodeExecution {
    pub fn pending(execution_id: Uuid, node_id: &str, node_type: &str, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            status: NodeExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            attempt: 1,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Filter for listing executions. Empty matches everything of the tenant.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub tenant_id: Option<Uuid>,
    pub definition_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        self.tenant_id.map_or(true, |t| execution.tenant_id == t)
            && self.definition_id.map_or(true, |d| execution.definition_id == d)
            && self.status.map_or(true, |s| execution.status == s)
    }
}
