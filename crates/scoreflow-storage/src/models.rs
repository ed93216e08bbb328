// Row types and write inputs for the storage layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use scoreflow_core::{
    CoreError, HealthStatus, Operation, ResourceInstance, ResourceState, Result,
};

// ============================================
// Resource instances
// ============================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ResourceInstanceRow {
    pub id: i64,
    pub application_name: String,
    pub resource_name: String,
    pub resource_type: String,
    pub state: String,
    pub health_status: String,
    pub provider_id: Option<String>,
    pub configuration: Value,
    pub provider_metadata: Value,
    pub error_message: Option<String>,
    pub workflow_execution_id: Option<i64>,
    pub desired_operation: Option<String>,
    pub workflow_override: Option<String>,
    pub workflow_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceInstanceRow {
    /// Parse the row into the typed domain form
    pub fn into_domain(self) -> Result<ResourceInstance> {
        let state: ResourceState = self
            .state
            .parse()
            .map_err(|e: String| CoreError::store(e))?;
        let health_status: HealthStatus = self
            .health_status
            .parse()
            .map_err(|e: String| CoreError::store(e))?;
        let desired_operation = self
            .desired_operation
            .as_deref()
            .map(|op| op.parse::<Operation>())
            .transpose()
            .map_err(CoreError::store)?;

        Ok(ResourceInstance {
            id: self.id,
            application_name: self.application_name,
            resource_name: self.resource_name,
            resource_type: self.resource_type,
            state,
            health_status,
            provider_id: self.provider_id,
            configuration: value_to_map(self.configuration),
            provider_metadata: value_to_map(self.provider_metadata),
            error_message: self.error_message,
            workflow_execution_id: self.workflow_execution_id,
            desired_operation,
            workflow_override: self.workflow_override,
            workflow_tags: self.workflow_tags,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    /// Parse just the state column
    pub fn state(&self) -> Result<ResourceState> {
        self.state.parse().map_err(|e: String| CoreError::store(e))
    }
}

fn value_to_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Input for inserting a resource instance (always starts `requested`)
#[derive(Debug, Clone)]
pub struct CreateResource {
    pub application_name: String,
    pub resource_name: String,
    pub resource_type: String,
    pub configuration: Map<String, Value>,
    pub desired_operation: Option<Operation>,
    pub workflow_override: Option<String>,
    pub workflow_tags: Vec<String>,
}

/// One recorded state transition
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ResourceTransitionRow {
    pub id: i64,
    pub resource_id: i64,
    pub from_state: String,
    pub to_state: String,
    pub reason: String,
    pub actor: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Workflow executions
// ============================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowExecutionRow {
    pub id: i64,
    pub application_name: String,
    pub workflow_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_steps: i32,
    pub error_message: Option<String>,
    pub is_retry: bool,
    pub parent_execution_id: Option<i64>,
    pub resume_from_step: Option<i32>,
    pub retry_count: i32,
}

/// Input for creating a workflow execution record
#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub application_name: String,
    pub workflow_name: String,
    pub total_steps: i32,
    pub is_retry: bool,
    pub parent_execution_id: Option<i64>,
    pub resume_from_step: Option<i32>,
    pub retry_count: i32,
}

impl CreateExecution {
    /// A fresh (non-retry) execution
    pub fn fresh(
        application_name: impl Into<String>,
        workflow_name: impl Into<String>,
        total_steps: i32,
    ) -> Self {
        Self {
            application_name: application_name.into(),
            workflow_name: workflow_name.into(),
            total_steps,
            is_retry: false,
            parent_execution_id: None,
            resume_from_step: None,
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkflowStepRow {
    pub id: i64,
    pub execution_id: i64,
    pub step_number: i32,
    pub step_name: String,
    pub step_type: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output_logs: Option<String>,
    pub error_message: Option<String>,
    pub config: Value,
}

/// Input for creating a step record in `pending` state
#[derive(Debug, Clone)]
pub struct CreateStep {
    pub execution_id: i64,
    pub step_number: i32,
    pub step_name: String,
    pub step_type: String,
    pub config: Map<String, Value>,
}

/// Input for a step status update
#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub output_logs: Option<String>,
    pub error_message: Option<String>,
}

// ============================================
// Queue tasks
// ============================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueTaskRow {
    pub id: i64,
    pub task_id: String,
    pub app_name: String,
    pub workflow_name: String,
    pub workflow_spec: String,
    pub metadata: Value,
    pub status: String,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Input for persisting an enqueued task
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub task_id: String,
    pub app_name: String,
    pub workflow_name: String,
    pub workflow_spec: String,
    pub metadata: Map<String, Value>,
}

// ============================================
// Graph lineage (observational)
// ============================================

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GraphNodeRow {
    pub id: i64,
    pub app_name: String,
    pub node_type: String,
    pub name: String,
    pub properties: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GraphEdgeRow {
    pub id: i64,
    pub app_name: String,
    pub from_node_id: i64,
    pub to_node_id: i64,
    pub edge_type: String,
    pub created_at: DateTime<Utc>,
}
