use crate::error::WorkflowDefinitionError;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use wfcore::{
    compile, DefinitionPatch, DefinitionStatus, DefinitionStore, NewDefinition, WorkflowDefinition,
};
use wfruntime::{GraphValidator, NodeTypeRegistry};

type Result<T> = std::result::Result<T, WorkflowDefinitionError>;

/// Create, edit, version and retire workflow definitions.
pub struct WorkflowDefinitionService {
    store: Arc<dyn DefinitionStore>,
    validator: GraphValidator,
    publish_lock: Mutex<()>,
}

impl WorkflowDefinitionService {
    pub fn new(store: Arc<dyn DefinitionStore>, registry: Arc<NodeTypeRegistry>) -> Self {
        Self {
            store,
            validator: GraphValidator::new(registry),
            publish_lock: Mutex::new(()),
        }
    }

    pub async fn create(&self, tenant_id: Uuid, new: NewDefinition) -> Result<WorkflowDefinition> {
        let definition = WorkflowDefinition::draft(tenant_id, new);
        self.store.insert_definition(definition.clone()).await?;
        tracing::info!("Created definition {} '{}'", definition.id, definition.name);
        Ok(definition)
    }

    pub async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<WorkflowDefinition> {
        self.store
            .get_definition(id)
            .await?
            .filter(|d| d.visible_to(tenant_id))
            .ok_or(WorkflowDefinitionError::NotFound(id))
    }

    /// Live definitions of the tenant, newest first.
    pub async fn list(
        &self,
        tenant_id: Uuid,
        status: Option<DefinitionStatus>,
    ) -> Result<Vec<WorkflowDefinition>> {
        Ok(self
            .store
            .list_definitions(tenant_id)
            .await?
            .into_iter()
            .filter(|d| !d.is_deleted())
            .filter(|d| status.map_or(true, |s| d.status == s))
            .collect())
    }

    pub async fn update(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        patch: DefinitionPatch,
    ) -> Result<WorkflowDefinition> {
        let mut definition = self.get(tenant_id, id).await?;
        if definition.status != DefinitionStatus::Draft {
            return Err(WorkflowDefinitionError::NotDraft {
                id,
                status: definition.status,
            });
        }
        patch.apply(&mut definition);
        self.store.update_definition(definition.clone()).await?;
        tracing::debug!("Updated definition {}", id);
        Ok(definition)
    }

    /// Validate the graph, retire the lineage's current ACTIVE definition
    /// and make this one the next ACTIVE version.
    pub async fn publish(&self, tenant_id: Uuid, id: Uuid) -> Result<WorkflowDefinition> {
        let _guard = self.publish_lock.lock().await;

        let mut definition = self.get(tenant_id, id).await?;
        let Some(graph) = &definition.graph else {
            return Err(WorkflowDefinitionError::NoGraph(id));
        };
        if definition.status != DefinitionStatus::Draft {
            return Err(WorkflowDefinitionError::NotDraft {
                id,
                status: definition.status,
            });
        }

        let mut issues: Vec<String> = self
            .validator
            .validate(graph)
            .iter()
            .map(ToString::to_string)
            .collect();
        // Compile only to surface cycles now rather than at first start.
        if let Err(e) = compile(definition.id, definition.version, graph, definition.timeout_seconds) {
            issues.push(e.to_string());
        }
        if !issues.is_empty() {
            tracing::warn!("Definition {} failed validation: {:?}", id, issues);
            return Err(WorkflowDefinitionError::ValidationFailed(issues));
        }

        let lineage: Vec<WorkflowDefinition> = self
            .store
            .list_definitions(tenant_id)
            .await?
            .into_iter()
            .filter(|d| d.name == definition.name && d.id != id)
            .collect();

        let latest_version = lineage.iter().map(|d| d.version).max().unwrap_or(0);
        for mut previous in lineage {
            if previous.status == DefinitionStatus::Active && !previous.is_deleted() {
                tracing::info!(
                    "Archiving definition {} v{} superseded by {}",
                    previous.id,
                    previous.version,
                    id
                );
                previous.status = DefinitionStatus::Archived;
                previous.updated_at = Utc::now();
                self.store.update_definition(previous).await?;
            }
        }

        definition.version = latest_version.max(definition.version) + 1;
        definition.status = DefinitionStatus::Active;
        definition.updated_at = Utc::now();
        self.store.update_definition(definition.clone()).await?;
        tracing::info!(
            "Published definition {} '{}' as v{}",
            id,
            definition.name,
            definition.version
        );
        Ok(definition)
    }

    /// One-way move to ARCHIVED from any status.
    pub async fn archive(&self, tenant_id: Uuid, id: Uuid) -> Result<WorkflowDefinition> {
        let mut definition = self.get(tenant_id, id).await?;
        if definition.status != DefinitionStatus::Archived {
            definition.status = DefinitionStatus::Archived;
            definition.updated_at = Utc::now();
            self.store.update_definition(definition.clone()).await?;
            tracing::info!("Archived definition {}", id);
        }
        Ok(definition)
    }

    /// Deep-copy into a new DRAFT at version 0. Keeping the name makes the
    /// copy the next version of the same lineage once published.
    pub async fn clone_definition(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        name: Option<String>,
    ) -> Result<WorkflowDefinition> {
        let source = self.get(tenant_id, id).await?;
        let copy = WorkflowDefinition::draft(
            tenant_id,
            NewDefinition {
                name: name.unwrap_or_else(|| source.name.clone()),
                description: source.description.clone(),
                graph: source.graph.clone(),
                timeout_seconds: source.timeout_seconds,
                max_concurrent: source.max_concurrent,
                workflow_type: source.workflow_type.clone(),
                variables: source.variables.clone(),
            },
        );
        self.store.insert_definition(copy.clone()).await?;
        tracing::info!("Cloned definition {} into {}", id, copy.id);
        Ok(copy)
    }

    /// Soft delete; the row stays for execution history.
    pub async fn delete(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let mut definition = self.get(tenant_id, id).await?;
        let now = Utc::now();
        definition.deleted_at = Some(now);
        definition.updated_at = now;
        self.store.update_definition(definition).await?;
        tracing::info!("Deleted definition {}", id);
        Ok(())
    }

    /// Every live definition named `name`, newest version first.
    pub async fn get_versions(&self, tenant_id: Uuid, name: &str) -> Result<Vec<WorkflowDefinition>> {
        let mut versions: Vec<WorkflowDefinition> = self
            .list(tenant_id, None)
            .await?
            .into_iter()
            .filter(|d| d.name == name)
            .collect();
        versions.sort_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(versions)
    }
}
