// Repository layer for database operations
//
// One Database over a shared pool; short transactions per logical
// operation. Resource state transitions take a row-level lock so
// transitions are serialized per resource id.

use serde_json::{Map, Value};
use sqlx::PgPool;

use scoreflow_core::{CoreError, ResourceState, Result};

use crate::models::*;

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| CoreError::store(format!("connect failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Run embedded migrations (bootstrap table sequence)
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::store(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ============================================
    // Applications
    // ============================================

    pub async fn upsert_application(&self, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO applications (name)
            VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET updated_at = NOW()
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    // ============================================
    // Resource instances
    // ============================================

    pub async fn create_resource(&self, input: CreateResource) -> Result<ResourceInstanceRow> {
        let configuration = Value::Object(input.configuration);

        let row = sqlx::query_as::<_, ResourceInstanceRow>(
            r#"
            INSERT INTO resource_instances
                (application_name, resource_name, resource_type, state, health_status,
                 configuration, provider_metadata, desired_operation, workflow_override, workflow_tags)
            VALUES ($1, $2, $3, 'requested', 'unknown', $4, '{}'::jsonb, $5, $6, $7)
            RETURNING id, application_name, resource_name, resource_type, state, health_status,
                      provider_id, configuration, provider_metadata, error_message,
                      workflow_execution_id, desired_operation, workflow_override, workflow_tags,
                      created_at, updated_at
            "#,
        )
        .bind(&input.application_name)
        .bind(&input.resource_name)
        .bind(&input.resource_type)
        .bind(&configuration)
        .bind(input.desired_operation.map(|op| op.as_str()))
        .bind(&input.workflow_override)
        .bind(&input.workflow_tags)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row)
    }

    pub async fn get_resource(&self, id: i64) -> Result<Option<ResourceInstanceRow>> {
        let row = sqlx::query_as::<_, ResourceInstanceRow>(
            r#"
            SELECT id, application_name, resource_name, resource_type, state, health_status,
                   provider_id, configuration, provider_metadata, error_message,
                   workflow_execution_id, desired_operation, workflow_override, workflow_tags,
                   created_at, updated_at
            FROM resource_instances
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row)
    }

    pub async fn list_resources_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<ResourceInstanceRow>> {
        let rows = sqlx::query_as::<_, ResourceInstanceRow>(
            r#"
            SELECT id, application_name, resource_name, resource_type, state, health_status,
                   provider_id, configuration, provider_metadata, error_message,
                   workflow_execution_id, desired_operation, workflow_override, workflow_tags,
                   created_at, updated_at
            FROM resource_instances
            WHERE application_name = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(application_name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows)
    }

    /// Resources waiting for the orchestration engine, oldest first
    pub async fn list_pending_resources(&self, limit: i64) -> Result<Vec<ResourceInstanceRow>> {
        let rows = sqlx::query_as::<_, ResourceInstanceRow>(
            r#"
            SELECT id, application_name, resource_name, resource_type, state, health_status,
                   provider_id, configuration, provider_metadata, error_message,
                   workflow_execution_id, desired_operation, workflow_override, workflow_tags,
                   created_at, updated_at
            FROM resource_instances
            WHERE state = 'requested'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows)
    }

    /// Transition a resource, enforcing the allowed-transition table
    ///
    /// Runs in one transaction with the row locked, so transitions are
    /// serialized per resource id. Records a history entry.
    pub async fn transition_resource(
        &self,
        id: i64,
        new_state: ResourceState,
        reason: &str,
        actor: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<ResourceInstanceRow> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let row = sqlx::query_as::<_, ResourceInstanceRow>(
            r#"
            SELECT id, application_name, resource_name, resource_type, state, health_status,
                   provider_id, configuration, provider_metadata, error_message,
                   workflow_execution_id, desired_operation, workflow_override, workflow_tags,
                   created_at, updated_at
            FROM resource_instances
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?
        .ok_or(CoreError::ResourceNotFound(id))?;

        let current = row.state()?;
        current.check_transition_to(new_state)?;

        let metadata_json = Value::Object(metadata.unwrap_or_default());
        let error_message = if new_state == ResourceState::Failed {
            Some(reason)
        } else {
            None
        };

        let updated = sqlx::query_as::<_, ResourceInstanceRow>(
            r#"
            UPDATE resource_instances
            SET state = $2,
                error_message = $3,
                provider_metadata = provider_metadata || $4,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, application_name, resource_name, resource_type, state, health_status,
                      provider_id, configuration, provider_metadata, error_message,
                      workflow_execution_id, desired_operation, workflow_override, workflow_tags,
                      created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(new_state.as_str())
        .bind(error_message)
        .bind(&metadata_json)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            INSERT INTO resource_state_transitions (resource_id, from_state, to_state, reason, actor, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(current.as_str())
        .bind(new_state.as_str())
        .bind(reason)
        .bind(actor)
        .bind(&metadata_json)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;

        Ok(updated)
    }

    /// Link a resource to the workflow execution provisioning it
    pub async fn link_workflow(&self, id: i64, execution_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE resource_instances
            SET workflow_execution_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ResourceNotFound(id));
        }
        Ok(())
    }

    /// Record which provider was resolved for a resource
    pub async fn set_resource_provider(&self, id: i64, provider: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE resource_instances
            SET provider_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(provider)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    /// Transition history for a resource, oldest first
    pub async fn list_transitions(&self, resource_id: i64) -> Result<Vec<ResourceTransitionRow>> {
        let rows = sqlx::query_as::<_, ResourceTransitionRow>(
            r#"
            SELECT id, resource_id, from_state, to_state, reason, actor, metadata, created_at
            FROM resource_state_transitions
            WHERE resource_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows)
    }

    // ============================================
    // Workflow executions
    // ============================================

    pub async fn create_execution(&self, input: CreateExecution) -> Result<WorkflowExecutionRow> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            INSERT INTO workflow_executions
                (application_name, workflow_name, status, total_steps,
                 is_retry, parent_execution_id, resume_from_step, retry_count)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7)
            RETURNING id, application_name, workflow_name, status, started_at, completed_at,
                      total_steps, error_message, is_retry, parent_execution_id,
                      resume_from_step, retry_count
            "#,
        )
        .bind(&input.application_name)
        .bind(&input.workflow_name)
        .bind(input.total_steps)
        .bind(input.is_retry)
        .bind(input.parent_execution_id)
        .bind(input.resume_from_step)
        .bind(input.retry_count)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row)
    }

    pub async fn get_execution(&self, id: i64) -> Result<Option<WorkflowExecutionRow>> {
        let row = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            SELECT id, application_name, workflow_name, status, started_at, completed_at,
                   total_steps, error_message, is_retry, parent_execution_id,
                   resume_from_step, retry_count
            FROM workflow_executions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row)
    }

    pub async fn list_executions_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<WorkflowExecutionRow>> {
        let rows = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            SELECT id, application_name, workflow_name, status, started_at, completed_at,
                   total_steps, error_message, is_retry, parent_execution_id,
                   resume_from_step, retry_count
            FROM workflow_executions
            WHERE application_name = $1
            ORDER BY started_at DESC
            "#,
        )
        .bind(application_name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows)
    }

    /// Update execution status; terminal statuses stamp completed_at
    pub async fn update_execution_status(
        &self,
        id: i64,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<WorkflowExecutionRow> {
        let terminal = status == "completed" || status == "failed";

        let row = sqlx::query_as::<_, WorkflowExecutionRow>(
            r#"
            UPDATE workflow_executions
            SET status = $2,
                error_message = COALESCE($3, error_message),
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
            WHERE id = $1
            RETURNING id, application_name, workflow_name, status, started_at, completed_at,
                      total_steps, error_message, is_retry, parent_execution_id,
                      resume_from_step, retry_count
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .bind(terminal)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        .ok_or(CoreError::ExecutionNotFound(id))?;

        Ok(row)
    }

    // ============================================
    // Workflow steps
    // ============================================

    pub async fn create_step(&self, input: CreateStep) -> Result<WorkflowStepRow> {
        let config = Value::Object(input.config);

        let row = sqlx::query_as::<_, WorkflowStepRow>(
            r#"
            INSERT INTO workflow_step_executions
                (execution_id, step_number, step_name, step_type, status, config)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            RETURNING id, execution_id, step_number, step_name, step_type, status,
                      started_at, completed_at, duration_ms, output_logs, error_message, config
            "#,
        )
        .bind(input.execution_id)
        .bind(input.step_number)
        .bind(&input.step_name)
        .bind(&input.step_type)
        .bind(&config)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row)
    }

    /// Copy a parent step into a retry execution as already completed
    pub async fn copy_step_as_completed(
        &self,
        execution_id: i64,
        parent_step: &WorkflowStepRow,
    ) -> Result<WorkflowStepRow> {
        let row = sqlx::query_as::<_, WorkflowStepRow>(
            r#"
            INSERT INTO workflow_step_executions
                (execution_id, step_number, step_name, step_type, status,
                 started_at, completed_at, duration_ms, output_logs, config)
            VALUES ($1, $2, $3, $4, 'completed', $5, $6, $7, $8, $9)
            RETURNING id, execution_id, step_number, step_name, step_type, status,
                      started_at, completed_at, duration_ms, output_logs, error_message, config
            "#,
        )
        .bind(execution_id)
        .bind(parent_step.step_number)
        .bind(&parent_step.step_name)
        .bind(&parent_step.step_type)
        .bind(parent_step.started_at)
        .bind(parent_step.completed_at)
        .bind(parent_step.duration_ms)
        .bind(&parent_step.output_logs)
        .bind(&parent_step.config)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row)
    }

    /// Update a step's status; `running` stamps started_at, terminal
    /// statuses stamp completed_at and duration
    pub async fn update_step_status(
        &self,
        execution_id: i64,
        step_number: i32,
        status: &str,
        update: StepUpdate,
    ) -> Result<WorkflowStepRow> {
        let starting = status == "running";
        let terminal = status == "completed" || status == "failed" || status == "skipped";

        let row = sqlx::query_as::<_, WorkflowStepRow>(
            r#"
            UPDATE workflow_step_executions
            SET status = $3,
                started_at = CASE WHEN $4 THEN NOW() ELSE started_at END,
                completed_at = CASE WHEN $5 THEN NOW() ELSE completed_at END,
                duration_ms = CASE
                    WHEN $5 AND started_at IS NOT NULL
                    THEN (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::bigint
                    ELSE duration_ms
                END,
                output_logs = COALESCE($6, output_logs),
                error_message = COALESCE($7, error_message)
            WHERE execution_id = $1 AND step_number = $2
            RETURNING id, execution_id, step_number, step_name, step_type, status,
                      started_at, completed_at, duration_ms, output_logs, error_message, config
            "#,
        )
        .bind(execution_id)
        .bind(step_number)
        .bind(status)
        .bind(starting)
        .bind(terminal)
        .bind(&update.output_logs)
        .bind(&update.error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        .ok_or(CoreError::ExecutionNotFound(execution_id))?;

        Ok(row)
    }

    pub async fn list_steps(&self, execution_id: i64) -> Result<Vec<WorkflowStepRow>> {
        let rows = sqlx::query_as::<_, WorkflowStepRow>(
            r#"
            SELECT id, execution_id, step_number, step_name, step_type, status,
                   started_at, completed_at, duration_ms, output_logs, error_message, config
            FROM workflow_step_executions
            WHERE execution_id = $1
            ORDER BY step_number ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows)
    }

    // ============================================
    // Queue tasks
    // ============================================

    pub async fn create_task(&self, input: CreateTask) -> Result<QueueTaskRow> {
        let metadata = Value::Object(input.metadata);

        let row = sqlx::query_as::<_, QueueTaskRow>(
            r#"
            INSERT INTO queue_tasks (task_id, app_name, workflow_name, workflow_spec, metadata, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING id, task_id, app_name, workflow_name, workflow_spec, metadata, status,
                      enqueued_at, started_at, completed_at, error_message
            "#,
        )
        .bind(&input.task_id)
        .bind(&input.app_name)
        .bind(&input.workflow_name)
        .bind(&input.workflow_spec)
        .bind(&metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row)
    }

    pub async fn mark_task_running(&self, task_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'running', started_at = NOW()
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn mark_task_completed(&self, task_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'completed', completed_at = NOW()
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn mark_task_failed(&self, task_id: &str, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_tasks
            SET status = 'failed', completed_at = NOW(), error_message = $2
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn list_tasks_by_status(&self, status: &str) -> Result<Vec<QueueTaskRow>> {
        let rows = sqlx::query_as::<_, QueueTaskRow>(
            r#"
            SELECT id, task_id, app_name, workflow_name, workflow_spec, metadata, status,
                   enqueued_at, started_at, completed_at, error_message
            FROM queue_tasks
            WHERE status = $1
            ORDER BY enqueued_at ASC
            "#,
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(rows)
    }

    pub async fn count_tasks_by_status(&self, status: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM queue_tasks WHERE status = $1
            "#,
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(count.0)
    }

    // ============================================
    // Graph lineage (observational, never fatal)
    // ============================================

    pub async fn record_graph_app(&self, app_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_apps (app_name)
            VALUES ($1)
            ON CONFLICT (app_name) DO NOTHING
            "#,
        )
        .bind(app_name)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    pub async fn record_graph_node(
        &self,
        app_name: &str,
        node_type: &str,
        name: &str,
        properties: Map<String, Value>,
    ) -> Result<i64> {
        let properties = Value::Object(properties);

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO graph_nodes (app_name, node_type, name, properties)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(app_name)
        .bind(node_type)
        .bind(name)
        .bind(&properties)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.0)
    }

    pub async fn record_graph_edge(
        &self,
        app_name: &str,
        from_node_id: i64,
        to_node_id: i64,
        edge_type: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO graph_edges (app_name, from_node_id, to_node_id, edge_type)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(app_name)
        .bind(from_node_id)
        .bind(to_node_id)
        .bind(edge_type)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }
}

fn store_err(e: sqlx::Error) -> CoreError {
    CoreError::store(e.to_string())
}
