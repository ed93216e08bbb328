// Score spec intake
//
// Materializes a validated spec into `requested` resource rows and emits
// the corresponding lifecycle events. Resource types are checked against
// the registry's capability index (the same index resolution uses), but
// unknown types only warn here: the orchestration engine is the authority
// that marks them failed.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use scoreflow_core::{Event, EventBus, EventType, Result, ScoreSpec};
use scoreflow_providers::ProviderRegistry;
use scoreflow_storage::{CreateResource, ResourceInstanceRow, StorageBackend};

const SOURCE: &str = "spec-intake";

/// Materialize a spec: one `requested` resource row per declared resource
pub async fn materialize_spec(
    db: &StorageBackend,
    bus: &EventBus,
    registry: &Arc<ProviderRegistry>,
    spec: &ScoreSpec,
) -> Result<Vec<ResourceInstanceRow>> {
    spec.validate()?;
    let app = spec.app_name();

    db.upsert_application(app).await?;
    bus.publish(
        Event::new(EventType::SpecCreated, app, SOURCE)
            .with_data("resources", spec.resources.len()),
    );

    // Same capability index the resolver consumes; unknown types are
    // surfaced in the validation event but still materialized
    let unknown: Vec<String> = spec
        .resources
        .values()
        .map(|r| r.resource_type.clone())
        .filter(|t| !registry.has_resource_type(t))
        .collect();
    if !unknown.is_empty() {
        warn!(app, ?unknown, "Spec references resource types no provider claims");
    }
    bus.publish(
        Event::new(EventType::SpecValidated, app, SOURCE).with_data(
            "unknown_types",
            Value::from(unknown),
        ),
    );

    let mut rows = Vec::with_capacity(spec.resources.len());
    for (resource_name, resource_spec) in &spec.resources {
        let row = db
            .create_resource(CreateResource {
                application_name: app.to_string(),
                resource_name: resource_name.clone(),
                resource_type: resource_spec.resource_type.clone(),
                configuration: resource_spec.params.clone(),
                desired_operation: resource_spec.operation,
                workflow_override: resource_spec.workflow.clone(),
                workflow_tags: resource_spec.tags.clone(),
            })
            .await?;

        bus.publish(
            Event::new(EventType::ResourceCreated, app, SOURCE)
                .with_data("resource_id", row.id)
                .with_data("resource_name", resource_name.clone())
                .with_data("resource_type", resource_spec.resource_type.clone()),
        );
        bus.publish(
            Event::new(EventType::ResourceRequested, app, SOURCE)
                .with_data("resource_id", row.id)
                .with_data("resource_name", resource_name.clone()),
        );

        record_resource_lineage(db, app, &row).await;
        rows.push(row);
    }

    info!(app, resources = rows.len(), "Spec materialized");
    Ok(rows)
}

/// Observational graph writes; failures warn and never fail the intake
async fn record_resource_lineage(db: &StorageBackend, app: &str, row: &ResourceInstanceRow) {
    let result: Result<()> = async {
        db.record_graph_app(app).await?;
        let spec_node = db
            .record_graph_node(app, "spec", app, Default::default())
            .await?;
        let resource_node = db
            .record_graph_node(
                app,
                "resource",
                &row.resource_name,
                serde_json::json!({ "type": row.resource_type, "resource_id": row.id })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            )
            .await?;
        db.record_graph_edge(app, spec_node, resource_node, "declares")
            .await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        warn!(app, error = %e, "Failed to record resource lineage");
    }
}
