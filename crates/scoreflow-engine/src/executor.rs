// Workflow executor
//
// Drives one workflow definition to completion: execution + step records,
// declaration-order execution with bounded parallel groups, conditional
// skips, event emission, resource linkage, and operator-initiated
// retry-from-failed-step. Step failures are never retried automatically
// within an execution.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};

use scoreflow_core::{
    CoreError, Event, EventBus, EventType, ResourceState, Result, StepDefinition,
    WorkflowDefinition,
};
use scoreflow_storage::{
    CreateExecution, CreateStep, StepUpdate, StorageBackend, WorkflowExecutionRow,
    WorkflowStepRow,
};

use crate::conditions;
use crate::steps::{StepContext, StepRegistry};

const SOURCE: &str = "workflow-executor";
const DEFAULT_PARALLEL_LIMIT: usize = 4;

/// A workflow bound to an application, optionally linked to a resource
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub app_name: String,
    pub workflow_name: String,
    pub definition: WorkflowDefinition,
    /// Resource the execution provisions; drives lifecycle linkage
    pub resource_id: Option<i64>,
    pub provider: Option<String>,
}

struct RetryPlan {
    resume_from: i32,
    /// Names of the steps copied from the parent as completed
    copied: Vec<String>,
    /// Scope seeded with the copied steps' outputs
    scope: Map<String, Value>,
}

enum StepRun {
    Completed { name: String, outputs: Map<String, Value> },
    Skipped { name: String },
    Failed { name: String, error: String },
    /// Peer of a failed parallel step that never started; stays pending
    NotStarted,
}

/// Executes workflow definitions against the store and the event bus
pub struct WorkflowExecutor {
    db: StorageBackend,
    bus: Arc<EventBus>,
    steps: Arc<StepRegistry>,
    workspace_root: PathBuf,
    parallel_limit: usize,
    cancel_tx: watch::Sender<bool>,
}

impl WorkflowExecutor {
    pub fn new(db: StorageBackend, bus: Arc<EventBus>, steps: Arc<StepRegistry>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            db,
            bus,
            steps,
            workspace_root: std::env::temp_dir().join("scoreflow-workspaces"),
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            cancel_tx,
        }
    }

    /// Root directory for per-step scratch workspaces
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Bound on concurrently running steps within a parallel group
    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = limit.max(1);
        self
    }

    /// Signal cancellation to every in-flight step handler
    pub fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Execute a workflow from the first step
    pub async fn execute(&self, request: ExecutionRequest) -> Result<WorkflowExecutionRow> {
        request.definition.validate()?;

        let execution = self
            .db
            .create_execution(CreateExecution::fresh(
                &request.app_name,
                &request.workflow_name,
                request.definition.total_steps() as i32,
            ))
            .await?;

        for (index, step) in request.definition.steps.iter().enumerate() {
            self.db
                .create_step(CreateStep {
                    execution_id: execution.id,
                    step_number: index as i32 + 1,
                    step_name: step.name.clone(),
                    step_type: step.step_type.clone(),
                    config: step.config.clone(),
                })
                .await?;
        }

        self.record_lineage(&request, execution.id).await;
        self.run(request, execution, None).await
    }

    /// Retry a failed execution from its first failed step
    ///
    /// The supplied definition may differ from the parent's; this is how
    /// operators fix and retry. Steps before the failed one are copied
    /// from the parent as completed, outputs included.
    pub async fn retry(
        &self,
        request: ExecutionRequest,
        parent_id: i64,
    ) -> Result<WorkflowExecutionRow> {
        request.definition.validate()?;

        let parent = self
            .db
            .get_execution(parent_id)
            .await?
            .ok_or(CoreError::ExecutionNotFound(parent_id))?;
        let parent_steps = self.db.list_steps(parent_id).await?;

        let resume_from = parent_steps
            .iter()
            .filter(|s| s.status == "failed")
            .map(|s| s.step_number)
            .min()
            .ok_or_else(|| {
                CoreError::step_failed(format!("execution {parent_id} has no failed step"))
            })?;

        let execution = self
            .db
            .create_execution(CreateExecution {
                application_name: request.app_name.clone(),
                workflow_name: request.workflow_name.clone(),
                total_steps: request.definition.total_steps() as i32,
                is_retry: true,
                parent_execution_id: Some(parent_id),
                resume_from_step: Some(resume_from),
                retry_count: parent.retry_count + 1,
            })
            .await?;

        let mut copied = Vec::new();
        let mut scope = Map::new();
        for parent_step in parent_steps.iter().filter(|s| s.step_number < resume_from) {
            self.db
                .copy_step_as_completed(execution.id, parent_step)
                .await?;
            scope_insert_outputs(
                &mut scope,
                &parent_step.step_name,
                decode_step_outputs(parent_step.output_logs.as_deref()),
            );
            copied.push(parent_step.step_name.clone());
        }

        for (index, step) in request.definition.steps.iter().enumerate() {
            let step_number = index as i32 + 1;
            if step_number < resume_from {
                continue;
            }
            self.db
                .create_step(CreateStep {
                    execution_id: execution.id,
                    step_number,
                    step_name: step.name.clone(),
                    step_type: step.step_type.clone(),
                    config: step.config.clone(),
                })
                .await?;
        }

        info!(
            parent_execution = parent_id,
            execution = execution.id,
            resume_from,
            "Retrying workflow from failed step"
        );

        self.run(
            request,
            execution,
            Some(RetryPlan {
                resume_from,
                copied,
                scope,
            }),
        )
        .await
    }

    async fn run(
        &self,
        request: ExecutionRequest,
        execution: WorkflowExecutionRow,
        retry: Option<RetryPlan>,
    ) -> Result<WorkflowExecutionRow> {
        let app = request.app_name.clone();
        let execution_id = execution.id;

        self.db
            .update_execution_status(execution_id, "running", None)
            .await?;
        let mut started_data = vec![
            ("workflow_name", Value::from(request.workflow_name.clone())),
            ("execution_id", Value::from(execution_id)),
        ];
        if let Some(provider) = &request.provider {
            started_data.push(("provider", Value::from(provider.clone())));
        }
        self.emit(EventType::WorkflowStarted, &app, &started_data);

        if let Some(resource_id) = request.resource_id {
            self.db.link_workflow(resource_id, execution_id).await?;
            self.move_resource(
                resource_id,
                ResourceState::Provisioning,
                "workflow started",
                None,
            )
            .await;
        }

        let start_from = retry.as_ref().map(|r| r.resume_from).unwrap_or(1);
        let mut scope = retry.as_ref().map(|r| r.scope.clone()).unwrap_or_default();
        scope.insert(
            "app".to_string(),
            serde_json::json!({ "name": app.clone() }),
        );
        let mut completed: HashSet<String> = retry
            .as_ref()
            .map(|r| r.copied.iter().cloned().collect())
            .unwrap_or_default();

        let mut remaining: Vec<(i32, StepDefinition)> = request
            .definition
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| (index as i32 + 1, step.clone()))
            .filter(|(number, _)| *number >= start_from)
            .collect();

        let mut failure: Option<(String, String)> = None;

        'outer: while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .enumerate()
                .filter(|(_, (_, step))| {
                    step.depends_on.iter().all(|dep| completed.contains(dep))
                })
                .map(|(position, _)| position)
                .collect();

            if ready.is_empty() {
                failure = Some((
                    String::new(),
                    "unresolvable step dependencies".to_string(),
                ));
                break;
            }

            // Group parallel peers that are ready together; everything else
            // runs one at a time in declaration order
            let (_, first) = &remaining[ready[0]];
            let batch_positions: Vec<usize> = match (first.parallel, first.parallel_group) {
                (true, Some(group)) => ready
                    .iter()
                    .copied()
                    .filter(|position| {
                        let (_, step) = &remaining[*position];
                        step.parallel && step.parallel_group == Some(group)
                    })
                    .collect(),
                _ => vec![ready[0]],
            };

            let mut batch: Vec<(i32, StepDefinition)> = Vec::with_capacity(batch_positions.len());
            for position in batch_positions.iter().rev() {
                batch.push(remaining.remove(*position));
            }
            batch.reverse();

            let results = if batch.len() == 1 {
                let (number, step) = &batch[0];
                vec![self.run_step(execution_id, &app, *number, step, &scope).await?]
            } else {
                let group_failed = AtomicBool::new(false);
                let scope_snapshot = scope.clone();
                let futures: Vec<_> = batch
                    .iter()
                    .map(|(number, step)| {
                        let group_failed = &group_failed;
                        let scope_snapshot = &scope_snapshot;
                        let app = app.clone();
                        Box::pin(async move {
                            if group_failed.load(Ordering::Acquire) {
                                return Ok(StepRun::NotStarted);
                            }
                            let result = self
                                .run_step(execution_id, &app, *number, step, scope_snapshot)
                                .await;
                            if matches!(result, Ok(StepRun::Failed { .. })) {
                                group_failed.store(true, Ordering::Release);
                            }
                            result
                        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<StepRun>> + Send + '_>>
                    })
                    .collect();
                let runs = stream::iter(futures)
                    .buffer_unordered(self.parallel_limit)
                    .collect::<Vec<Result<StepRun>>>()
                    .await;

                let mut collected = Vec::with_capacity(runs.len());
                for run in runs {
                    collected.push(run?);
                }
                collected
            };

            for result in results {
                match result {
                    StepRun::Completed { name, outputs } => {
                        scope_insert_outputs(&mut scope, &name, outputs);
                        completed.insert(name);
                    }
                    StepRun::Skipped { name } => {
                        // A skipped step satisfies its dependents
                        completed.insert(name);
                    }
                    StepRun::Failed { name, error } => {
                        failure = Some((name, error));
                    }
                    StepRun::NotStarted => {}
                }
            }

            if failure.is_some() {
                break 'outer;
            }
        }

        match failure {
            None => {
                let row = self
                    .db
                    .update_execution_status(execution_id, "completed", None)
                    .await?;
                self.emit(
                    EventType::WorkflowCompleted,
                    &app,
                    &[
                        ("workflow_name", Value::from(request.workflow_name.clone())),
                        ("execution_id", Value::from(execution_id)),
                    ],
                );

                if let Some(resource_id) = request.resource_id {
                    let metadata = collect_step_outputs(&scope);
                    self.move_resource(
                        resource_id,
                        ResourceState::Active,
                        "workflow completed",
                        Some(metadata),
                    )
                    .await;
                }
                Ok(row)
            }
            Some((step_name, error)) => {
                let message = if step_name.is_empty() {
                    error
                } else {
                    format!("step '{step_name}' failed: {error}")
                };
                let row = self
                    .db
                    .update_execution_status(execution_id, "failed", Some(&message))
                    .await?;
                self.emit(
                    EventType::WorkflowFailed,
                    &app,
                    &[
                        ("workflow_name", Value::from(request.workflow_name.clone())),
                        ("execution_id", Value::from(execution_id)),
                        ("error", Value::from(message.clone())),
                    ],
                );

                if let Some(resource_id) = request.resource_id {
                    self.move_resource(resource_id, ResourceState::Failed, &message, None)
                        .await;
                }
                Ok(row)
            }
        }
    }

    /// Run one step: condition check, dispatch, record keeping, events
    async fn run_step(
        &self,
        execution_id: i64,
        app: &str,
        step_number: i32,
        step: &StepDefinition,
        scope: &Map<String, Value>,
    ) -> Result<StepRun> {
        if let Some(condition) = &step.condition {
            if !conditions::evaluate(condition, scope) {
                self.db
                    .update_step_status(execution_id, step_number, "skipped", StepUpdate::default())
                    .await?;
                info!(step = %step.name, condition = %condition, "Step condition falsy, skipping");
                return Ok(StepRun::Skipped {
                    name: step.name.clone(),
                });
            }
        }

        self.db
            .update_step_status(execution_id, step_number, "running", StepUpdate::default())
            .await?;
        self.emit(
            EventType::StepStarted,
            app,
            &[
                ("step_name", Value::from(step.name.clone())),
                ("step_number", Value::from(step_number)),
                ("execution_id", Value::from(execution_id)),
            ],
        );

        let outcome = match self.steps.get(&step.step_type) {
            Ok(handler) => {
                let ctx = StepContext {
                    app_name: app.to_string(),
                    execution_id,
                    step_name: step.name.clone(),
                    workspace: self
                        .workspace_root
                        .join(app)
                        .join(execution_id.to_string())
                        .join(&step.name),
                    cancel: self.cancel_tx.subscribe(),
                };
                handler.execute(&step.config, &ctx).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(output) => {
                self.db
                    .update_step_status(
                        execution_id,
                        step_number,
                        "completed",
                        StepUpdate {
                            output_logs: Some(encode_step_logs(&output.logs, &output.outputs)),
                            error_message: None,
                        },
                    )
                    .await?;
                self.emit(
                    EventType::StepCompleted,
                    app,
                    &[
                        ("step_name", Value::from(step.name.clone())),
                        ("step_number", Value::from(step_number)),
                        ("execution_id", Value::from(execution_id)),
                    ],
                );
                Ok(StepRun::Completed {
                    name: step.name.clone(),
                    outputs: output.outputs,
                })
            }
            Err(e) => {
                let error = e.to_string();
                self.db
                    .update_step_status(
                        execution_id,
                        step_number,
                        "failed",
                        StepUpdate {
                            output_logs: None,
                            error_message: Some(error.clone()),
                        },
                    )
                    .await?;
                self.emit(
                    EventType::StepFailed,
                    app,
                    &[
                        ("step_name", Value::from(step.name.clone())),
                        ("step_number", Value::from(step_number)),
                        ("execution_id", Value::from(execution_id)),
                        ("error", Value::from(error.clone())),
                    ],
                );
                Ok(StepRun::Failed {
                    name: step.name.clone(),
                    error,
                })
            }
        }
    }

    /// Move a linked resource, tolerating states that make the move a
    /// no-op (the orchestration engine may already have transitioned it)
    async fn move_resource(
        &self,
        resource_id: i64,
        target: ResourceState,
        reason: &str,
        metadata: Option<Map<String, Value>>,
    ) {
        let row = match self.db.get_resource(resource_id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(resource_id, "Linked resource not found");
                return;
            }
            Err(e) => {
                error!(resource_id, error = %e, "Failed to load linked resource");
                return;
            }
        };

        let current = match row.state() {
            Ok(state) => state,
            Err(e) => {
                error!(resource_id, error = %e, "Corrupt resource state");
                return;
            }
        };
        if current == target {
            return;
        }
        if !current.can_transition_to(target) {
            error!(
                resource_id,
                from = %current,
                to = %target,
                "Resource linkage transition not allowed"
            );
            return;
        }

        match self
            .db
            .transition_resource(resource_id, target, reason, SOURCE, metadata)
            .await
        {
            Ok(row) => {
                let event_type = match target {
                    ResourceState::Provisioning => EventType::ResourceProvisioning,
                    ResourceState::Active => EventType::ResourceActive,
                    ResourceState::Failed => EventType::ResourceFailed,
                    _ => return,
                };
                self.emit(
                    event_type,
                    &row.application_name,
                    &[
                        ("resource_id", Value::from(resource_id)),
                        ("resource_name", Value::from(row.resource_name.clone())),
                        ("state", Value::from(target.as_str())),
                    ],
                );
            }
            Err(e) => {
                error!(resource_id, error = %e, "Resource linkage transition failed");
            }
        }
    }

    /// Lineage is observational; failures never fail the workflow
    async fn record_lineage(&self, request: &ExecutionRequest, execution_id: i64) {
        let result: Result<()> = async {
            self.db.record_graph_app(&request.app_name).await?;
            let workflow_node = self
                .db
                .record_graph_node(
                    &request.app_name,
                    "workflow",
                    &request.workflow_name,
                    serde_json::json!({ "execution_id": execution_id })
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                )
                .await?;
            for step in &request.definition.steps {
                let step_node = self
                    .db
                    .record_graph_node(
                        &request.app_name,
                        "step",
                        &step.name,
                        serde_json::json!({ "type": step.step_type })
                            .as_object()
                            .cloned()
                            .unwrap_or_default(),
                    )
                    .await?;
                self.db
                    .record_graph_edge(&request.app_name, workflow_node, step_node, "contains")
                    .await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Failed to record workflow lineage");
        }
    }

    fn emit(&self, event_type: EventType, app: &str, data: &[(&str, Value)]) {
        let mut event = Event::new(event_type, app, SOURCE);
        for (key, value) in data {
            event = event.with_data(*key, value.clone());
        }
        self.bus.publish(event);
    }
}

fn scope_insert_outputs(scope: &mut Map<String, Value>, step_name: &str, outputs: Map<String, Value>) {
    let steps = scope
        .entry("steps".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(steps) = steps {
        steps.insert(
            step_name.to_string(),
            serde_json::json!({ "outputs": outputs }),
        );
    }
}

/// Flatten `steps.<name>.outputs` into `{name: outputs}` for resource
/// provider metadata
fn collect_step_outputs(scope: &Map<String, Value>) -> Map<String, Value> {
    let mut collected = Map::new();
    if let Some(Value::Object(steps)) = scope.get("steps") {
        for (name, entry) in steps {
            if let Some(outputs) = entry.get("outputs") {
                if outputs.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
                    collected.insert(name.clone(), outputs.clone());
                }
            }
        }
    }
    collected
}

/// Persist logs and structured outputs in one column; plain text when
/// there are no outputs, a JSON envelope otherwise
fn encode_step_logs(logs: &str, outputs: &Map<String, Value>) -> String {
    if outputs.is_empty() {
        logs.to_string()
    } else {
        serde_json::json!({ "logs": logs, "outputs": outputs }).to_string()
    }
}

/// Inverse of `encode_step_logs` for retry output copying
fn decode_step_outputs(output_logs: Option<&str>) -> Map<String, Value> {
    output_logs
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|value| value.get("outputs").cloned())
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

/// Expose the encoded outputs of a persisted step (used by API readers)
pub fn step_outputs(step: &WorkflowStepRow) -> Map<String, Value> {
    decode_step_outputs(step.output_logs.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_step_logs() {
        let mut outputs = Map::new();
        outputs.insert("endpoint".to_string(), Value::from("db:5432"));

        let encoded = encode_step_logs("provisioned", &outputs);
        let decoded = decode_step_outputs(Some(&encoded));
        assert_eq!(decoded["endpoint"], "db:5432");

        // Plain logs decode to no outputs
        assert!(decode_step_outputs(Some("just text")).is_empty());
        assert!(decode_step_outputs(None).is_empty());
    }

    #[test]
    fn test_scope_outputs_collection() {
        let mut scope = Map::new();
        let mut outputs = Map::new();
        outputs.insert("host".to_string(), Value::from("db"));
        scope_insert_outputs(&mut scope, "provision", outputs);
        scope_insert_outputs(&mut scope, "noop", Map::new());

        let collected = collect_step_outputs(&scope);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected["provision"]["host"], "db");
    }
}
