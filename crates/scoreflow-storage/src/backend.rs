// Storage backend abstraction
// Decision: Use enum dispatch for simplicity over trait objects
//
// Production runs against PostgreSQL; tests and dev mode run against the
// in-memory backend behind the same method surface.

use std::sync::Arc;

use serde_json::{Map, Value};
use sqlx::PgPool;

use scoreflow_core::{ResourceState, Result};

use crate::memory::InMemoryDatabase;
use crate::models::*;
use crate::repositories::Database;

/// Storage backend that can be either PostgreSQL or in-memory
#[derive(Clone)]
pub enum StorageBackend {
    /// PostgreSQL database (production)
    Postgres(Database),
    /// In-memory database (dev mode, tests)
    InMemory(Arc<InMemoryDatabase>),
}

impl StorageBackend {
    /// Create a PostgreSQL storage backend from a database URL and run
    /// the bootstrap migrations
    pub async fn postgres(database_url: &str) -> Result<Self> {
        let db = Database::from_url(database_url).await?;
        db.migrate().await?;
        Ok(Self::Postgres(db))
    }

    /// Create an in-memory storage backend
    pub fn in_memory() -> Self {
        Self::InMemory(Arc::new(InMemoryDatabase::new()))
    }

    /// Check if this is dev mode (in-memory)
    pub fn is_dev_mode(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }

    /// Get the PostgreSQL pool if using the PostgreSQL backend
    pub fn pool(&self) -> Option<&PgPool> {
        match self {
            Self::Postgres(db) => Some(db.pool()),
            Self::InMemory(_) => None,
        }
    }

    // ============================================
    // Applications
    // ============================================

    pub async fn upsert_application(&self, name: &str) -> Result<()> {
        match self {
            Self::Postgres(db) => db.upsert_application(name).await,
            Self::InMemory(db) => db.upsert_application(name).await,
        }
    }

    // ============================================
    // Resource instances
    // ============================================

    pub async fn create_resource(&self, input: CreateResource) -> Result<ResourceInstanceRow> {
        match self {
            Self::Postgres(db) => db.create_resource(input).await,
            Self::InMemory(db) => db.create_resource(input).await,
        }
    }

    pub async fn get_resource(&self, id: i64) -> Result<Option<ResourceInstanceRow>> {
        match self {
            Self::Postgres(db) => db.get_resource(id).await,
            Self::InMemory(db) => db.get_resource(id).await,
        }
    }

    pub async fn list_resources_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<ResourceInstanceRow>> {
        match self {
            Self::Postgres(db) => db.list_resources_by_application(application_name).await,
            Self::InMemory(db) => db.list_resources_by_application(application_name).await,
        }
    }

    pub async fn list_pending_resources(&self, limit: i64) -> Result<Vec<ResourceInstanceRow>> {
        match self {
            Self::Postgres(db) => db.list_pending_resources(limit).await,
            Self::InMemory(db) => db.list_pending_resources(limit).await,
        }
    }

    pub async fn transition_resource(
        &self,
        id: i64,
        new_state: ResourceState,
        reason: &str,
        actor: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<ResourceInstanceRow> {
        match self {
            Self::Postgres(db) => {
                db.transition_resource(id, new_state, reason, actor, metadata)
                    .await
            }
            Self::InMemory(db) => {
                db.transition_resource(id, new_state, reason, actor, metadata)
                    .await
            }
        }
    }

    pub async fn link_workflow(&self, id: i64, execution_id: i64) -> Result<()> {
        match self {
            Self::Postgres(db) => db.link_workflow(id, execution_id).await,
            Self::InMemory(db) => db.link_workflow(id, execution_id).await,
        }
    }

    pub async fn set_resource_provider(&self, id: i64, provider: &str) -> Result<()> {
        match self {
            Self::Postgres(db) => db.set_resource_provider(id, provider).await,
            Self::InMemory(db) => db.set_resource_provider(id, provider).await,
        }
    }

    pub async fn list_transitions(&self, resource_id: i64) -> Result<Vec<ResourceTransitionRow>> {
        match self {
            Self::Postgres(db) => db.list_transitions(resource_id).await,
            Self::InMemory(db) => db.list_transitions(resource_id).await,
        }
    }

    // ============================================
    // Workflow executions
    // ============================================

    pub async fn create_execution(&self, input: CreateExecution) -> Result<WorkflowExecutionRow> {
        match self {
            Self::Postgres(db) => db.create_execution(input).await,
            Self::InMemory(db) => db.create_execution(input).await,
        }
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<WorkflowExecutionRow>> {
        match self {
            Self::Postgres(db) => db.get_execution(id).await,
            Self::InMemory(db) => db.get_execution(id).await,
        }
    }

    pub async fn list_executions_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<WorkflowExecutionRow>> {
        match self {
            Self::Postgres(db) => db.list_executions_by_application(application_name).await,
            Self::InMemory(db) => db.list_executions_by_application(application_name).await,
        }
    }

    pub async fn update_execution_status(
        &self,
        id: i64,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<WorkflowExecutionRow> {
        match self {
            Self::Postgres(db) => db.update_execution_status(id, status, error_message).await,
            Self::InMemory(db) => db.update_execution_status(id, status, error_message).await,
        }
    }

    // ============================================
    // Workflow steps
    // ============================================

    pub async fn create_step(&self, input: CreateStep) -> Result<WorkflowStepRow> {
        match self {
            Self::Postgres(db) => db.create_step(input).await,
            Self::InMemory(db) => db.create_step(input).await,
        }
    }

    pub async fn copy_step_as_completed(
        &self,
        execution_id: i64,
        parent_step: &WorkflowStepRow,
    ) -> Result<WorkflowStepRow> {
        match self {
            Self::Postgres(db) => db.copy_step_as_completed(execution_id, parent_step).await,
            Self::InMemory(db) => db.copy_step_as_completed(execution_id, parent_step).await,
        }
    }

    pub async fn update_step_status(
        &self,
        execution_id: i64,
        step_number: i32,
        status: &str,
        update: StepUpdate,
    ) -> Result<WorkflowStepRow> {
        match self {
            Self::Postgres(db) => {
                db.update_step_status(execution_id, step_number, status, update)
                    .await
            }
            Self::InMemory(db) => {
                db.update_step_status(execution_id, step_number, status, update)
                    .await
            }
        }
    }

    pub async fn list_steps(&self, execution_id: i64) -> Result<Vec<WorkflowStepRow>> {
        match self {
            Self::Postgres(db) => db.list_steps(execution_id).await,
            Self::InMemory(db) => db.list_steps(execution_id).await,
        }
    }

    // ============================================
    // Queue tasks
    // ============================================

    pub async fn create_task(&self, input: CreateTask) -> Result<QueueTaskRow> {
        match self {
            Self::Postgres(db) => db.create_task(input).await,
            Self::InMemory(db) => db.create_task(input).await,
        }
    }

    pub async fn mark_task_running(&self, task_id: &str) -> Result<()> {
        match self {
            Self::Postgres(db) => db.mark_task_running(task_id).await,
            Self::InMemory(db) => db.mark_task_running(task_id).await,
        }
    }

    pub async fn mark_task_completed(&self, task_id: &str) -> Result<()> {
        match self {
            Self::Postgres(db) => db.mark_task_completed(task_id).await,
            Self::InMemory(db) => db.mark_task_completed(task_id).await,
        }
    }

    pub async fn mark_task_failed(&self, task_id: &str, error_message: &str) -> Result<()> {
        match self {
            Self::Postgres(db) => db.mark_task_failed(task_id, error_message).await,
            Self::InMemory(db) => db.mark_task_failed(task_id, error_message).await,
        }
    }

    pub async fn list_tasks_by_status(&self, status: &str) -> Result<Vec<QueueTaskRow>> {
        match self {
            Self::Postgres(db) => db.list_tasks_by_status(status).await,
            Self::InMemory(db) => db.list_tasks_by_status(status).await,
        }
    }

    pub async fn count_tasks_by_status(&self, status: &str) -> Result<i64> {
        match self {
            Self::Postgres(db) => db.count_tasks_by_status(status).await,
            Self::InMemory(db) => db.count_tasks_by_status(status).await,
        }
    }

    // ============================================
    // Graph lineage
    // ============================================

    pub async fn record_graph_app(&self, app_name: &str) -> Result<()> {
        match self {
            Self::Postgres(db) => db.record_graph_app(app_name).await,
            Self::InMemory(db) => db.record_graph_app(app_name).await,
        }
    }

    pub async fn record_graph_node(
        &self,
        app_name: &str,
        node_type: &str,
        name: &str,
        properties: Map<String, Value>,
    ) -> Result<i64> {
        match self {
            Self::Postgres(db) => {
                db.record_graph_node(app_name, node_type, name, properties)
                    .await
            }
            Self::InMemory(db) => {
                db.record_graph_node(app_name, node_type, name, properties)
                    .await
            }
        }
    }

    pub async fn record_graph_edge(
        &self,
        app_name: &str,
        from_node_id: i64,
        to_node_id: i64,
        edge_type: &str,
    ) -> Result<()> {
        match self {
            Self::Postgres(db) => {
                db.record_graph_edge(app_name, from_node_id, to_node_id, edge_type)
                    .await
            }
            Self::InMemory(db) => {
                db.record_graph_edge(app_name, from_node_id, to_node_id, edge_type)
                    .await
            }
        }
    }
}
