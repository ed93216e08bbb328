// Provider registry HTTP routes (read-only snapshots)

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use scoreflow_core::ProviderManifest;
use scoreflow_providers::ProviderRegistry;

/// App state for provider routes
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/providers/:name", get(get_provider))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub version: String,
    pub resource_types: Vec<String>,
    pub workflows: Vec<String>,
}

/// GET /api/providers - registered providers
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderSummary>> {
    let providers = state
        .registry
        .list()
        .into_iter()
        .map(|provider| ProviderSummary {
            name: provider.manifest.metadata.name.clone(),
            version: provider.manifest.metadata.version.clone(),
            resource_types: provider.manifest.primary_resource_types(),
            workflows: provider
                .manifest
                .workflows
                .iter()
                .map(|w| w.name.clone())
                .collect(),
        })
        .collect();
    Json(providers)
}

/// GET /api/providers/{name} - full manifest of one provider
pub async fn get_provider(
    State(state): State<AppState>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> Result<Json<ProviderManifest>, (StatusCode, String)> {
    let provider = state
        .registry
        .get(&name)
        .ok_or((StatusCode::NOT_FOUND, format!("provider '{name}' not found")))?;
    Ok(Json(provider.manifest.clone()))
}
