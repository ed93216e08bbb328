// Spec intake and resource HTTP routes

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use scoreflow_core::{EventBus, ResourceInstance, ScoreSpec};
use scoreflow_engine::materialize_spec;
use scoreflow_providers::ProviderRegistry;
use scoreflow_storage::StorageBackend;

// ============================================
// App State and Routes
// ============================================

/// App state for spec and resource routes
#[derive(Clone)]
pub struct AppState {
    pub db: StorageBackend,
    pub bus: Arc<EventBus>,
    pub registry: Arc<ProviderRegistry>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/specs", post(submit_spec))
        .route("/api/resources", get(list_resources))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct SubmitSpecResponse {
    pub app: String,
    pub resources: Vec<ResourceInstance>,
}

/// POST /api/specs - submit a Score spec (YAML body)
///
/// Resources are materialized in `requested` state; the orchestration
/// engine picks them up on its next tick.
pub async fn submit_spec(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<SubmitSpecResponse>), (StatusCode, String)> {
    let spec = ScoreSpec::from_yaml(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    let rows = materialize_spec(&state.db, &state.bus, &state.registry, &spec)
        .await
        .map_err(|e| {
            error!(error = %e, "Spec materialization failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    let mut resources = Vec::with_capacity(rows.len());
    for row in rows {
        let resource = row
            .into_domain()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        resources.push(resource);
    }

    Ok((
        StatusCode::CREATED,
        Json(SubmitSpecResponse {
            app: spec.app_name().to_string(),
            resources,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListResourcesParams {
    pub app: String,
}

/// GET /api/resources?app= - resources for one application
pub async fn list_resources(
    State(state): State<AppState>,
    Query(params): Query<ListResourcesParams>,
) -> Result<Json<Vec<ResourceInstance>>, (StatusCode, String)> {
    let rows = state
        .db
        .list_resources_by_application(&params.app)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to list resources");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    let mut resources = Vec::with_capacity(rows.len());
    for row in rows {
        resources.push(
            row.into_domain()
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
        );
    }
    Ok(Json(resources))
}
