// Orchestration engine
//
// Tick-driven: every interval, take a batch of `requested` resources,
// resolve each to a provider workflow, enqueue it, and move the resource
// to `provisioning`. The transition happens only after a successful
// enqueue; a full queue leaves the resource `requested` for the next
// tick. Resolution and load failures are permanent and mark the resource
// `failed` with a structured reason. A pass never overlaps itself.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use scoreflow_core::{
    CoreError, Event, EventBus, EventType, Operation, ResourceState, Result, WorkflowDefinition,
};
use scoreflow_providers::ProviderRegistry;
use scoreflow_storage::{ResourceInstanceRow, StorageBackend};

use crate::queue::WorkflowQueue;

const SOURCE: &str = "orchestration-engine";

/// Engine loop parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub batch_limit: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            batch_limit: 10,
        }
    }
}

/// Couples the resource repository, provider registry and workflow queue
pub struct OrchestrationEngine {
    db: StorageBackend,
    registry: Arc<ProviderRegistry>,
    queue: Arc<WorkflowQueue>,
    bus: Arc<EventBus>,
    config: EngineConfig,
    // Guards against overlapping passes
    tick_lock: tokio::sync::Mutex<()>,
}

impl OrchestrationEngine {
    pub fn new(
        db: StorageBackend,
        registry: Arc<ProviderRegistry>,
        queue: Arc<WorkflowQueue>,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            registry,
            queue,
            bus,
            config,
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Run the periodic loop until shutdown
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            batch_limit = self.config.batch_limit,
            "Orchestration engine started"
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Orchestration pass failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Orchestration engine shutting down");
                    break;
                }
            }
        }
    }

    /// One orchestration pass; returns how many resources were dispatched
    ///
    /// Skipped (returns 0) if another pass is still in flight.
    pub async fn tick(&self) -> Result<usize> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("Previous orchestration pass still running, skipping tick");
            return Ok(0);
        };

        let pending = self.db.list_pending_resources(self.config.batch_limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        debug!(count = pending.len(), "Processing pending resources");
        let mut dispatched = 0usize;
        for resource in pending {
            let resource_id = resource.id;
            match self.dispatch(resource).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {} // left `requested` for the next tick
                Err(e) => {
                    error!(resource_id, error = %e, "Dispatch failed");
                }
            }
        }
        Ok(dispatched)
    }

    /// Resolve, enqueue, and transition one resource
    ///
    /// Returns Ok(false) when the resource was deliberately left
    /// `requested` (queue full).
    async fn dispatch(&self, resource: ResourceInstanceRow) -> Result<bool> {
        let operation = resource
            .desired_operation
            .as_deref()
            .map(|op| op.parse::<Operation>())
            .transpose()
            .unwrap_or_else(|e| {
                warn!(resource_id = resource.id, error = %e, "Bad desired operation, defaulting to create");
                None
            })
            .unwrap_or(Operation::Create);

        // Workflow override bypasses category/operation matching but still
        // goes through the claiming provider
        let resolved = match &resource.workflow_override {
            Some(workflow_name) => self
                .registry
                .resolve_named(&resource.resource_type, workflow_name),
            None => self.registry.resolve(
                &resource.resource_type,
                operation,
                &resource.workflow_tags,
            ),
        };

        let (provider, workflow_meta) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                self.fail_resource(&resource, &e.to_string()).await?;
                return Ok(true);
            }
        };

        self.bus.publish(
            Event::new(EventType::ProviderResolved, &resource.application_name, SOURCE)
                .with_data("resource_id", resource.id)
                .with_data("resource_type", resource.resource_type.clone())
                .with_data("provider", provider.name())
                .with_data("workflow", workflow_meta.name.clone()),
        );
        self.db
            .set_resource_provider(resource.id, provider.name())
            .await?;

        let workflow_path = provider.workflow_path(&workflow_meta.file);
        let definition = match tokio::fs::read_to_string(&workflow_path).await {
            Ok(yaml) => match WorkflowDefinition::from_yaml(&yaml) {
                Ok(definition) => definition,
                Err(e) => {
                    self.fail_resource(&resource, &e.to_string()).await?;
                    return Ok(true);
                }
            },
            Err(e) => {
                let message = format!(
                    "cannot read workflow file {}: {e}",
                    workflow_path.display()
                );
                self.fail_resource(&resource, &message).await?;
                return Ok(true);
            }
        };

        let mut metadata = Map::new();
        metadata.insert("resource_id".to_string(), Value::from(resource.id));
        metadata.insert("provider".to_string(), Value::from(provider.name()));

        match self
            .queue
            .enqueue(
                &resource.application_name,
                &workflow_meta.name,
                definition,
                metadata,
            )
            .await
        {
            Ok(task_id) => {
                debug!(resource_id = resource.id, task_id = %task_id, "Workflow enqueued");
            }
            Err(e) if e.is_transient() => {
                // QueueFull: leave the resource `requested`; the next tick
                // retries the enqueue
                warn!(resource_id = resource.id, "Queue full, resource stays requested");
                return Ok(false);
            }
            Err(e) => {
                self.fail_resource(&resource, &e.to_string()).await?;
                return Ok(true);
            }
        }

        let row = self
            .db
            .transition_resource(
                resource.id,
                ResourceState::Provisioning,
                "workflow enqueued",
                SOURCE,
                None,
            )
            .await?;
        self.bus.publish(
            Event::new(EventType::ResourceProvisioning, &row.application_name, SOURCE)
                .with_data("resource_id", row.id)
                .with_data("resource_name", row.resource_name.clone())
                .with_data("workflow", workflow_meta.name.clone()),
        );

        Ok(true)
    }

    async fn fail_resource(&self, resource: &ResourceInstanceRow, reason: &str) -> Result<()> {
        warn!(
            resource_id = resource.id,
            resource_type = %resource.resource_type,
            reason,
            "Marking resource failed"
        );
        match self
            .db
            .transition_resource(resource.id, ResourceState::Failed, reason, SOURCE, None)
            .await
        {
            Ok(row) => {
                self.bus.publish(
                    Event::new(EventType::ResourceFailed, &row.application_name, SOURCE)
                        .with_data("resource_id", row.id)
                        .with_data("resource_name", row.resource_name.clone())
                        .with_data("error", reason),
                );
                Ok(())
            }
            Err(CoreError::InvalidTransition { from, to }) => {
                // Raced with another actor; the pass moves on
                error!(resource_id = resource.id, %from, %to, "Invalid transition while failing resource");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
