//! The `activity` node and the contract of the activity execution service
//! it calls.

use crate::error::CollaboratorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use wfcore::{node_types, ports, ConfigMap, NodeContext, NodeError, NodeExecutor, NodeOutput};
use wfruntime::{ConfigSchema, FieldKind, NodeCategory, NodeTypeDefinition, PortDefinition};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRequest {
    pub tenant_id: Uuid,
    pub activity_id: String,
    pub version_id: Option<String>,
    pub input_data: Value,
    pub ci_id: Option<String>,
    pub deployment_id: Option<String>,
    pub workflow_execution_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    pub status: ActivityStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActivityResult {
    pub fn succeeded(output: Value) -> Self {
        Self {
            status: ActivityStatus::Succeeded,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ActivityStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Runs deployment activities on behalf of workflows.
#[async_trait]
pub trait ActivityService: Send + Sync {
    async fn execute(&self, request: ActivityRequest) -> Result<ActivityResult, CollaboratorError>;
}

/// Succeeds immediately, echoing the input back. For dry runs.
pub struct EchoActivityService;

#[async_trait]
impl ActivityService for EchoActivityService {
    async fn execute(&self, request: ActivityRequest) -> Result<ActivityResult, CollaboratorError> {
        tracing::info!("Echoing activity {}", request.activity_id);
        Ok(ActivityResult::succeeded(request.input_data))
    }
}

pub struct ActivityNode {
    service: Arc<dyn ActivityService>,
}

impl ActivityNode {
    pub fn new(service: Arc<dyn ActivityService>) -> Self {
        Self { service }
    }

    pub fn definition(service: Arc<dyn ActivityService>) -> NodeTypeDefinition {
        NodeTypeDefinition::new(
            node_types::ACTIVITY,
            "Activity",
            NodeCategory::Action,
            Arc::new(ActivityNode::new(service)),
        )
        .with_port(PortDefinition::flow_in(true))
        .with_port(PortDefinition::flow_out(ports::OUT))
        .with_port(PortDefinition::flow_out(ports::ERROR))
        .with_schema(
            ConfigSchema::new()
                .required("activity_id", FieldKind::String)
                .optional("version_id", FieldKind::String)
                .optional("input", FieldKind::Object)
                .optional("ci_id", FieldKind::String)
                .optional("deployment_id", FieldKind::String)
                .optional("retry", FieldKind::Object),
        )
    }

    fn request(ctx: &NodeContext) -> Result<ActivityRequest, NodeError> {
        let activity_id = ctx
            .config_str("activity_id")
            .ok_or_else(|| NodeError::MissingConfig("activity_id".to_string()))?;

        // Configured input wins; otherwise the activity sees the workflow input.
        let input_data = match ctx.config.get("input") {
            Some(Value::Object(template)) => Value::Object(render(template, &ctx.scope())),
            _ => ctx.input.clone(),
        };
        let optional = |key: &str| ctx.config_str(key).map(str::to_string);

        Ok(ActivityRequest {
            tenant_id: ctx.tenant_id,
            activity_id: activity_id.to_string(),
            version_id: optional("version_id"),
            input_data,
            ci_id: optional("ci_id"),
            deployment_id: optional("deployment_id"),
            workflow_execution_id: ctx.execution_id,
        })
    }
}

/// Replace `{{path}}` string values with what the path resolves to.
fn render(template: &ConfigMap, scope: &Value) -> ConfigMap {
    template
        .iter()
        .map(|(key, value)| {
            let rendered = match value.as_str() {
                Some(s) if s.starts_with("{{") && s.ends_with("}}") => {
                    let path = s.trim_start_matches("{{").trim_end_matches("}}").trim();
                    wfcore::lookup_path(scope, path).cloned().unwrap_or(Value::Null)
                }
                _ => value.clone(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

#[async_trait]
impl NodeExecutor for ActivityNode {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(mock) = ctx.mock_output() {
            tracing::debug!("Activity {} returning mock output", ctx.node_id);
            return Ok(mock);
        }

        let request = Self::request(&ctx)?;
        ctx.events
            .info(format!("Running activity {}", request.activity_id));
        let result = self.service.execute(request).await?;

        match result.status {
            ActivityStatus::Succeeded => {
                let output = match result.output {
                    Some(Value::Object(map)) => NodeOutput::new().with_map(map),
                    Some(Value::Null) | None => NodeOutput::new(),
                    Some(other) => NodeOutput::new().with_data("output", other),
                };
                Ok(output.with_data("status", "SUCCEEDED"))
            }
            ActivityStatus::Failed => Err(NodeError::ExecutionFailed(
                result
                    .error
                    .unwrap_or_else(|| "activity failed".to_string()),
            )),
        }
    }
}
