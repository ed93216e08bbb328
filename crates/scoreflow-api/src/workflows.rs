// Workflow execution HTTP routes, including the operator retry entry point

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use scoreflow_core::{CoreError, StepDefinition, WorkflowDefinition};
use scoreflow_engine::{ExecutionRequest, WorkflowExecutor, WorkflowQueue};
use scoreflow_storage::{StorageBackend, WorkflowExecutionRow, WorkflowStepRow};

// ============================================
// App State and Routes
// ============================================

/// App state for workflow routes
#[derive(Clone)]
pub struct AppState {
    pub db: StorageBackend,
    pub executor: Arc<WorkflowExecutor>,
    pub queue: Arc<WorkflowQueue>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/workflows", get(list_executions))
        .route("/api/workflows/:id", get(get_execution))
        .route("/api/workflows/:id/retry", post(retry_execution))
        .route("/api/queue/metrics", get(queue_metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsParams {
    pub app: String,
}

/// GET /api/workflows?app= - execution history for one application
pub async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ListExecutionsParams>,
) -> Result<Json<Vec<WorkflowExecutionRow>>, (StatusCode, String)> {
    let rows = state
        .db
        .list_executions_by_application(&params.app)
        .await
        .map_err(internal)?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub execution: WorkflowExecutionRow,
    pub steps: Vec<WorkflowStepRow>,
}

/// GET /api/workflows/{id} - one execution with its steps
pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ExecutionDetail>, (StatusCode, String)> {
    let execution = state
        .db
        .get_execution(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, format!("execution {id} not found")))?;
    let steps = state.db.list_steps(id).await.map_err(internal)?;

    Ok(Json(ExecutionDetail { execution, steps }))
}

/// POST /api/workflows/{id}/retry - operator retry from the first failed
/// step
///
/// The body may carry a replacement workflow definition (YAML); an empty
/// body reuses the parent's recorded steps. Retries always create a new
/// execution; nothing inside a single execution ever retries itself.
pub async fn retry_execution(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: String,
) -> Result<(StatusCode, Json<WorkflowExecutionRow>), (StatusCode, String)> {
    let parent = state
        .db
        .get_execution(id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, format!("execution {id} not found")))?;

    let definition = if body.trim().is_empty() {
        definition_from_steps(state.db.list_steps(id).await.map_err(internal)?)
            .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?
    } else {
        WorkflowDefinition::from_yaml(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    };

    // Re-link the resource this execution was provisioning, if any
    let resource_id = state
        .db
        .list_resources_by_application(&parent.application_name)
        .await
        .map_err(internal)?
        .into_iter()
        .find(|r| r.workflow_execution_id == Some(id))
        .map(|r| r.id);

    info!(
        parent_execution = id,
        app = %parent.application_name,
        workflow = %parent.workflow_name,
        "Operator retry requested"
    );

    let execution = state
        .executor
        .retry(
            ExecutionRequest {
                app_name: parent.application_name.clone(),
                workflow_name: parent.workflow_name.clone(),
                definition,
                resource_id,
                provider: None,
            },
            id,
        )
        .await
        .map_err(|e| match e {
            CoreError::ExecutionNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
            CoreError::StepFailed(_) => (StatusCode::CONFLICT, e.to_string()),
            other => {
                error!(error = %other, "Retry failed");
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        })?;

    Ok((StatusCode::CREATED, Json(execution)))
}

/// GET /api/queue/metrics - queue counters and rolling averages
pub async fn queue_metrics(
    State(state): State<AppState>,
) -> Json<scoreflow_engine::QueueMetricsSnapshot> {
    Json(state.queue.metrics())
}

/// Rebuild a sequential definition from recorded steps (retry without a
/// replacement body)
fn definition_from_steps(
    steps: Vec<WorkflowStepRow>,
) -> scoreflow_core::Result<WorkflowDefinition> {
    let steps = steps
        .into_iter()
        .map(|step| StepDefinition {
            name: step.step_name,
            step_type: step.step_type,
            config: match step.config {
                Value::Object(map) => map,
                _ => Default::default(),
            },
            parallel: false,
            depends_on: vec![],
            parallel_group: None,
            condition: None,
        })
        .collect();

    let definition = WorkflowDefinition::from_steps(steps);
    definition.validate()?;
    Ok(definition)
}

fn internal(e: CoreError) -> (StatusCode, String) {
    error!(error = %e, "Storage error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
