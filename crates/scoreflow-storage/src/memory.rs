// In-memory database for tests and dev mode
//
// Mirrors the repository API over plain maps guarded by a single lock, so
// every logical operation is atomic the way its Postgres counterpart's
// transaction is. Not durable; dev mode only.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use scoreflow_core::{CoreError, ResourceState, Result};

use crate::models::*;

#[derive(Default)]
struct Inner {
    applications: HashMap<String, ()>,
    resources: HashMap<i64, ResourceInstanceRow>,
    transitions: Vec<ResourceTransitionRow>,
    executions: HashMap<i64, WorkflowExecutionRow>,
    steps: Vec<WorkflowStepRow>,
    tasks: HashMap<String, QueueTaskRow>,
    graph_apps: HashMap<String, ()>,
    graph_nodes: Vec<GraphNodeRow>,
    graph_edges: Vec<GraphEdgeRow>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory stand-in for the Postgres `Database`
#[derive(Default)]
pub struct InMemoryDatabase {
    inner: RwLock<Inner>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================
    // Applications
    // ============================================

    pub async fn upsert_application(&self, name: &str) -> Result<()> {
        self.inner.write().applications.insert(name.to_string(), ());
        Ok(())
    }

    // ============================================
    // Resource instances
    // ============================================

    pub async fn create_resource(&self, input: CreateResource) -> Result<ResourceInstanceRow> {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        let now = Utc::now();

        let row = ResourceInstanceRow {
            id,
            application_name: input.application_name,
            resource_name: input.resource_name,
            resource_type: input.resource_type,
            state: "requested".to_string(),
            health_status: "unknown".to_string(),
            provider_id: None,
            configuration: Value::Object(input.configuration),
            provider_metadata: Value::Object(Map::new()),
            error_message: None,
            workflow_execution_id: None,
            desired_operation: input.desired_operation.map(|op| op.as_str().to_string()),
            workflow_override: input.workflow_override,
            workflow_tags: input.workflow_tags,
            created_at: now,
            updated_at: now,
        };
        inner.resources.insert(id, row.clone());
        Ok(row)
    }

    pub async fn get_resource(&self, id: i64) -> Result<Option<ResourceInstanceRow>> {
        Ok(self.inner.read().resources.get(&id).cloned())
    }

    pub async fn list_resources_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<ResourceInstanceRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<ResourceInstanceRow> = inner
            .resources
            .values()
            .filter(|r| r.application_name == application_name)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    pub async fn list_pending_resources(&self, limit: i64) -> Result<Vec<ResourceInstanceRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<ResourceInstanceRow> = inner
            .resources
            .values()
            .filter(|r| r.state == "requested")
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    pub async fn transition_resource(
        &self,
        id: i64,
        new_state: ResourceState,
        reason: &str,
        actor: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<ResourceInstanceRow> {
        let mut inner = self.inner.write();
        let transition_id = inner.next_id();

        let row = inner
            .resources
            .get_mut(&id)
            .ok_or(CoreError::ResourceNotFound(id))?;

        let current: ResourceState = row
            .state
            .parse()
            .map_err(|e: String| CoreError::store(e))?;
        current.check_transition_to(new_state)?;

        let metadata_map = metadata.unwrap_or_default();
        row.state = new_state.as_str().to_string();
        row.error_message = if new_state == ResourceState::Failed {
            Some(reason.to_string())
        } else {
            None
        };
        if let Value::Object(existing) = &mut row.provider_metadata {
            for (key, value) in metadata_map.clone() {
                existing.insert(key, value);
            }
        }
        row.updated_at = Utc::now();
        let updated = row.clone();

        inner.transitions.push(ResourceTransitionRow {
            id: transition_id,
            resource_id: id,
            from_state: current.as_str().to_string(),
            to_state: new_state.as_str().to_string(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            metadata: Value::Object(metadata_map),
            created_at: Utc::now(),
        });

        Ok(updated)
    }

    pub async fn link_workflow(&self, id: i64, execution_id: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let row = inner
            .resources
            .get_mut(&id)
            .ok_or(CoreError::ResourceNotFound(id))?;
        row.workflow_execution_id = Some(execution_id);
        row.updated_at = Utc::now();
        Ok(())
    }

    pub async fn set_resource_provider(&self, id: i64, provider: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(row) = inner.resources.get_mut(&id) {
            row.provider_id = Some(provider.to_string());
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    pub async fn list_transitions(&self, resource_id: i64) -> Result<Vec<ResourceTransitionRow>> {
        Ok(self
            .inner
            .read()
            .transitions
            .iter()
            .filter(|t| t.resource_id == resource_id)
            .cloned()
            .collect())
    }

    // ============================================
    // Workflow executions
    // ============================================

    pub async fn create_execution(&self, input: CreateExecution) -> Result<WorkflowExecutionRow> {
        let mut inner = self.inner.write();
        let id = inner.next_id();

        let row = WorkflowExecutionRow {
            id,
            application_name: input.application_name,
            workflow_name: input.workflow_name,
            status: "pending".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            total_steps: input.total_steps,
            error_message: None,
            is_retry: input.is_retry,
            parent_execution_id: input.parent_execution_id,
            resume_from_step: input.resume_from_step,
            retry_count: input.retry_count,
        };
        inner.executions.insert(id, row.clone());
        Ok(row)
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<WorkflowExecutionRow>> {
        Ok(self.inner.read().executions.get(&id).cloned())
    }

    pub async fn list_executions_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<WorkflowExecutionRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<WorkflowExecutionRow> = inner
            .executions
            .values()
            .filter(|e| e.application_name == application_name)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    pub async fn update_execution_status(
        &self,
        id: i64,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<WorkflowExecutionRow> {
        let mut inner = self.inner.write();
        let row = inner
            .executions
            .get_mut(&id)
            .ok_or(CoreError::ExecutionNotFound(id))?;

        row.status = status.to_string();
        if let Some(error_message) = error_message {
            row.error_message = Some(error_message.to_string());
        }
        if status == "completed" || status == "failed" {
            row.completed_at = Some(Utc::now());
        }
        Ok(row.clone())
    }

    // ============================================
    // Workflow steps
    // ============================================

    pub async fn create_step(&self, input: CreateStep) -> Result<WorkflowStepRow> {
        let mut inner = self.inner.write();
        let id = inner.next_id();

        let row = WorkflowStepRow {
            id,
            execution_id: input.execution_id,
            step_number: input.step_number,
            step_name: input.step_name,
            step_type: input.step_type,
            status: "pending".to_string(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output_logs: None,
            error_message: None,
            config: Value::Object(input.config),
        };
        inner.steps.push(row.clone());
        Ok(row)
    }

    pub async fn copy_step_as_completed(
        &self,
        execution_id: i64,
        parent_step: &WorkflowStepRow,
    ) -> Result<WorkflowStepRow> {
        let mut inner = self.inner.write();
        let id = inner.next_id();

        let row = WorkflowStepRow {
            id,
            execution_id,
            step_number: parent_step.step_number,
            step_name: parent_step.step_name.clone(),
            step_type: parent_step.step_type.clone(),
            status: "completed".to_string(),
            started_at: parent_step.started_at,
            completed_at: parent_step.completed_at,
            duration_ms: parent_step.duration_ms,
            output_logs: parent_step.output_logs.clone(),
            error_message: None,
            config: parent_step.config.clone(),
        };
        inner.steps.push(row.clone());
        Ok(row)
    }

    pub async fn update_step_status(
        &self,
        execution_id: i64,
        step_number: i32,
        status: &str,
        update: StepUpdate,
    ) -> Result<WorkflowStepRow> {
        let mut inner = self.inner.write();
        let row = inner
            .steps
            .iter_mut()
            .find(|s| s.execution_id == execution_id && s.step_number == step_number)
            .ok_or(CoreError::ExecutionNotFound(execution_id))?;

        let now = Utc::now();
        row.status = status.to_string();
        if status == "running" {
            row.started_at = Some(now);
        }
        if status == "completed" || status == "failed" || status == "skipped" {
            row.completed_at = Some(now);
            if let Some(started_at) = row.started_at {
                row.duration_ms = Some((now - started_at).num_milliseconds());
            }
        }
        if update.output_logs.is_some() {
            row.output_logs = update.output_logs;
        }
        if update.error_message.is_some() {
            row.error_message = update.error_message;
        }
        Ok(row.clone())
    }

    pub async fn list_steps(&self, execution_id: i64) -> Result<Vec<WorkflowStepRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<WorkflowStepRow> = inner
            .steps
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.step_number);
        Ok(rows)
    }

    // ============================================
    // Queue tasks
    // ============================================

    pub async fn create_task(&self, input: CreateTask) -> Result<QueueTaskRow> {
        let mut inner = self.inner.write();
        if inner.tasks.contains_key(&input.task_id) {
            return Err(CoreError::store(format!(
                "duplicate task id '{}'",
                input.task_id
            )));
        }
        let id = inner.next_id();

        let row = QueueTaskRow {
            id,
            task_id: input.task_id.clone(),
            app_name: input.app_name,
            workflow_name: input.workflow_name,
            workflow_spec: input.workflow_spec,
            metadata: Value::Object(input.metadata),
            status: "pending".to_string(),
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        };
        inner.tasks.insert(input.task_id, row.clone());
        Ok(row)
    }

    pub async fn mark_task_running(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(row) = inner.tasks.get_mut(task_id) {
            row.status = "running".to_string();
            row.started_at = Some(Utc::now());
        }
        Ok(())
    }

    pub async fn mark_task_completed(&self, task_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(row) = inner.tasks.get_mut(task_id) {
            row.status = "completed".to_string();
            row.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub async fn mark_task_failed(&self, task_id: &str, error_message: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(row) = inner.tasks.get_mut(task_id) {
            row.status = "failed".to_string();
            row.completed_at = Some(Utc::now());
            row.error_message = Some(error_message.to_string());
        }
        Ok(())
    }

    pub async fn list_tasks_by_status(&self, status: &str) -> Result<Vec<QueueTaskRow>> {
        let inner = self.inner.read();
        let mut rows: Vec<QueueTaskRow> = inner
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.id);
        Ok(rows)
    }

    pub async fn count_tasks_by_status(&self, status: &str) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .count() as i64)
    }

    // ============================================
    // Graph lineage
    // ============================================

    pub async fn record_graph_app(&self, app_name: &str) -> Result<()> {
        self.inner.write().graph_apps.insert(app_name.to_string(), ());
        Ok(())
    }

    pub async fn record_graph_node(
        &self,
        app_name: &str,
        node_type: &str,
        name: &str,
        properties: Map<String, Value>,
    ) -> Result<i64> {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        inner.graph_nodes.push(GraphNodeRow {
            id,
            app_name: app_name.to_string(),
            node_type: node_type.to_string(),
            name: name.to_string(),
            properties: Value::Object(properties),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    pub async fn record_graph_edge(
        &self,
        app_name: &str,
        from_node_id: i64,
        to_node_id: i64,
        edge_type: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let id = inner.next_id();
        inner.graph_edges.push(GraphEdgeRow {
            id,
            app_name: app_name.to_string(),
            from_node_id,
            to_node_id,
            edge_type: edge_type.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource_input(app: &str, name: &str) -> CreateResource {
        CreateResource {
            application_name: app.to_string(),
            resource_name: name.to_string(),
            resource_type: "postgres".to_string(),
            configuration: Map::new(),
            desired_operation: None,
            workflow_override: None,
            workflow_tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_resource_lifecycle() {
        let db = InMemoryDatabase::new();
        let row = db.create_resource(resource_input("demo", "db")).await.unwrap();
        assert_eq!(row.state, "requested");

        let row = db
            .transition_resource(row.id, ResourceState::Provisioning, "enqueued", "test", None)
            .await
            .unwrap();
        assert_eq!(row.state, "provisioning");

        // Disallowed transition is rejected and recorded nowhere
        let err = db
            .transition_resource(row.id, ResourceState::Requested, "no", "test", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let history = db.list_transitions(row.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].to_state, "provisioning");
    }

    #[tokio::test]
    async fn test_failed_transition_sets_error_message() {
        let db = InMemoryDatabase::new();
        let row = db.create_resource(resource_input("demo", "db")).await.unwrap();

        let row = db
            .transition_resource(
                row.id,
                ResourceState::Failed,
                "no provider for resource type 'mysql'",
                "orchestration-engine",
                None,
            )
            .await
            .unwrap();
        assert_eq!(
            row.error_message.as_deref(),
            Some("no provider for resource type 'mysql'")
        );
    }

    #[tokio::test]
    async fn test_pending_listing_is_ordered_and_limited() {
        let db = InMemoryDatabase::new();
        for i in 0..5 {
            db.create_resource(resource_input("demo", &format!("r{i}")))
                .await
                .unwrap();
        }

        let pending = db.list_pending_resources(3).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].resource_name, "r0");
        assert_eq!(pending[2].resource_name, "r2");
    }

    #[tokio::test]
    async fn test_task_status_flow() {
        let db = InMemoryDatabase::new();
        db.create_task(CreateTask {
            task_id: "t-1".to_string(),
            app_name: "demo".to_string(),
            workflow_name: "wf".to_string(),
            workflow_spec: "{}".to_string(),
            metadata: Map::new(),
        })
        .await
        .unwrap();

        db.mark_task_running("t-1").await.unwrap();
        db.mark_task_failed("t-1", "boom").await.unwrap();

        let failed = db.list_tasks_by_status("failed").await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_message.as_deref(), Some("boom"));
        assert_eq!(db.count_tasks_by_status("pending").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_task_id_rejected() {
        let db = InMemoryDatabase::new();
        let input = CreateTask {
            task_id: "t-1".to_string(),
            app_name: "demo".to_string(),
            workflow_name: "wf".to_string(),
            workflow_spec: "{}".to_string(),
            metadata: Map::new(),
        };
        db.create_task(input.clone()).await.unwrap();
        assert!(db.create_task(input).await.is_err());
    }
}
