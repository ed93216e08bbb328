// End-to-end scenarios against the in-memory backend: spec intake ->
// orchestration tick -> queue -> executor -> resource lifecycle, observed
// through the event bus.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};

use scoreflow_core::{
    Event, EventBus, EventType, ProviderManifest, ScoreSpec, SubscriptionFilter,
    WorkflowDefinition,
};
use scoreflow_engine::{
    materialize_spec, EngineConfig, ExecutionRequest, OrchestrationEngine, QueueConfig,
    StepContext, StepExecutor, StepOutput, StepRegistry, WorkflowExecutor, WorkflowQueue,
};
use scoreflow_providers::{LoadedProvider, ProviderRegistry};
use scoreflow_storage::StorageBackend;

/// Step that sleeps; used to observe graceful queue shutdown
struct SlowStep(Duration);

#[async_trait::async_trait]
impl StepExecutor for SlowStep {
    async fn execute(
        &self,
        _config: &Map<String, Value>,
        _ctx: &StepContext,
    ) -> scoreflow_core::Result<StepOutput> {
        tokio::time::sleep(self.0).await;
        Ok(StepOutput::with_logs("slept"))
    }
}

struct Harness {
    db: StorageBackend,
    bus: Arc<EventBus>,
    registry: Arc<ProviderRegistry>,
    queue: Arc<WorkflowQueue>,
    executor: Arc<WorkflowExecutor>,
    engine: OrchestrationEngine,
    _workdir: tempfile::TempDir,
}

async fn harness(workers: usize) -> Harness {
    let db = StorageBackend::in_memory();
    let bus = Arc::new(EventBus::new());

    let mut steps = StepRegistry::with_builtins();
    steps.register("slow", SlowStep(Duration::from_millis(150)));
    let steps = Arc::new(steps);

    let workdir = tempfile::tempdir().unwrap();
    let executor = Arc::new(
        WorkflowExecutor::new(db.clone(), bus.clone(), steps)
            .with_workspace_root(workdir.path().join("workspaces")),
    );
    let queue = Arc::new(WorkflowQueue::new(
        db.clone(),
        executor.clone(),
        bus.clone(),
        QueueConfig {
            workers,
            capacity: 16,
            enqueue_timeout: Duration::from_millis(500),
        },
    ));
    queue.start().await;

    let registry = Arc::new(ProviderRegistry::new());
    let engine = OrchestrationEngine::new(
        db.clone(),
        registry.clone(),
        queue.clone(),
        bus.clone(),
        EngineConfig::default(),
    );

    Harness {
        db,
        bus,
        registry,
        queue,
        executor,
        engine,
        _workdir: workdir,
    }
}

/// Register the `database-team` provider claiming `postgres` with a
/// single-dummy-step workflow, backed by a real file
async fn register_database_team(harness: &Harness) {
    let dir = harness._workdir.path().join("providers/database-team");
    tokio::fs::create_dir_all(dir.join("workflows")).await.unwrap();
    tokio::fs::write(
        dir.join("workflows/provision-postgres.yaml"),
        r#"
steps:
  - name: provision
    type: dummy
    config:
      outputs:
        endpoint: postgres.demo.svc:5432
"#,
    )
    .await
    .unwrap();

    let manifest = ProviderManifest::from_yaml(
        r#"
apiVersion: scoreflow.dev/v1
kind: Provider
metadata:
  name: database-team
  version: 1.0.0
compatibility:
  minCoreVersion: 0.1.0
capabilities:
  resourceTypes: [postgres]
workflows:
  - name: provision-postgres
    file: workflows/provision-postgres.yaml
    version: 1.0.0
    category: provisioner
    operations: [create]
"#,
    )
    .unwrap();

    harness
        .registry
        .register(LoadedProvider { manifest, dir })
        .unwrap();
}

fn collect_events(bus: &EventBus, types: Vec<EventType>) -> Arc<Mutex<Vec<Event>>> {
    let received: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus.subscribe(SubscriptionFilter::all().with_types(types), move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event);
        }
    });
    received
}

async fn wait_until<F, Fut>(what: &str, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn demo_spec(resource_type: &str) -> ScoreSpec {
    ScoreSpec::from_yaml(&format!(
        r#"
apiVersion: score.dev/v1b1
metadata:
  name: demo
resources:
  db:
    type: {resource_type}
"#
    ))
    .unwrap()
}

#[tokio::test]
async fn test_successful_provisioning_lifecycle() {
    let harness = harness(2).await;
    register_database_team(&harness).await;

    let scenario_types = vec![
        EventType::ResourceCreated,
        EventType::ResourceRequested,
        EventType::ResourceProvisioning,
        EventType::WorkflowStarted,
        EventType::StepStarted,
        EventType::StepCompleted,
        EventType::WorkflowCompleted,
        EventType::ResourceActive,
    ];
    let events = collect_events(&harness.bus, scenario_types.clone());

    let rows = materialize_spec(&harness.db, &harness.bus, &harness.registry, &demo_spec("postgres"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let resource_id = rows[0].id;

    let dispatched = harness.engine.tick().await.unwrap();
    assert_eq!(dispatched, 1);

    {
        let db = harness.db.clone();
        wait_until("resource active", move || {
            let db = db.clone();
            async move {
                db.get_resource(resource_id)
                    .await
                    .unwrap()
                    .map(|r| r.state == "active")
                    .unwrap_or(false)
            }
        })
        .await;
    }

    // One completed execution, linked to the resource
    let resource = harness.db.get_resource(resource_id).await.unwrap().unwrap();
    let execution_id = resource.workflow_execution_id.expect("linked execution");
    let execution = harness.db.get_execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, "completed");
    assert!(!execution.is_retry);

    // Outputs flowed into provider metadata
    assert_eq!(
        resource.provider_metadata["provision"]["endpoint"],
        "postgres.demo.svc:5432"
    );
    assert_eq!(resource.provider_id.as_deref(), Some("database-team"));

    // Events arrive in lifecycle order
    {
        let events = events.clone();
        let expected = scenario_types.len();
        wait_until("all lifecycle events", move || {
            let events = events.clone();
            async move { events.lock().unwrap().len() >= expected }
        })
        .await;
    }
    let observed: Vec<EventType> = events.lock().unwrap().iter().map(|e| e.event_type).collect();
    assert_eq!(observed, scenario_types);

    harness.queue.stop().await;
}

#[tokio::test]
async fn test_unknown_resource_type_marks_failed() {
    let harness = harness(1).await;
    register_database_team(&harness).await;

    let rows = materialize_spec(&harness.db, &harness.bus, &harness.registry, &demo_spec("mysql"))
        .await
        .unwrap();
    let resource_id = rows[0].id;

    harness.engine.tick().await.unwrap();

    let resource = harness.db.get_resource(resource_id).await.unwrap().unwrap();
    assert_eq!(resource.state, "failed");
    assert_eq!(
        resource.error_message.as_deref(),
        Some("no provider for resource type 'mysql'")
    );

    // No workflow execution was created
    assert!(harness
        .db
        .list_executions_by_application("demo")
        .await
        .unwrap()
        .is_empty());

    harness.queue.stop().await;
}

#[tokio::test]
async fn test_retry_from_failed_step() {
    let harness = harness(1).await;

    let failing = WorkflowDefinition::from_yaml(
        r#"
steps:
  - name: a
    type: dummy
    config:
      outputs:
        token: abc123
  - name: b
    type: invalid-type
  - name: c
    type: dummy
"#,
    )
    .unwrap();

    let first = harness
        .executor
        .execute(ExecutionRequest {
            app_name: "demo".to_string(),
            workflow_name: "provision".to_string(),
            definition: failing,
            resource_id: None,
            provider: None,
        })
        .await
        .unwrap();
    assert_eq!(first.status, "failed");

    let steps = harness.db.list_steps(first.id).await.unwrap();
    assert_eq!(steps[0].status, "completed");
    assert_eq!(steps[1].status, "failed");
    assert_eq!(steps[2].status, "pending"); // never started

    // Operator fixes step b and retries
    let fixed = WorkflowDefinition::from_yaml(
        r#"
steps:
  - name: a
    type: dummy
  - name: b
    type: dummy
  - name: c
    type: dummy
"#,
    )
    .unwrap();

    let retry = harness
        .executor
        .retry(
            ExecutionRequest {
                app_name: "demo".to_string(),
                workflow_name: "provision".to_string(),
                definition: fixed,
                resource_id: None,
                provider: None,
            },
            first.id,
        )
        .await
        .unwrap();

    assert_eq!(retry.status, "completed");
    assert!(retry.is_retry);
    assert_eq!(retry.parent_execution_id, Some(first.id));
    assert_eq!(retry.resume_from_step, Some(2));
    assert_eq!(retry.retry_count, 1);

    let retry_steps = harness.db.list_steps(retry.id).await.unwrap();
    assert_eq!(retry_steps.len(), 3);
    // Step 1 copied from the parent with its outputs intact
    assert_eq!(retry_steps[0].status, "completed");
    assert!(retry_steps[0]
        .output_logs
        .as_deref()
        .unwrap_or_default()
        .contains("abc123"));
    // Steps 2 and 3 executed fresh
    assert_eq!(retry_steps[1].status, "completed");
    assert_eq!(retry_steps[2].status, "completed");

    harness.queue.stop().await;
}

#[tokio::test]
async fn test_parallel_group_failure_cancels_unstarted_peers() {
    let harness = harness(1).await;

    let definition = WorkflowDefinition::from_yaml(
        r#"
steps:
  - name: base
    type: dummy
  - name: left
    type: dummy
    parallel: true
    parallel_group: 1
    depends_on: [base]
    config:
      fail: true
      message: left exploded
  - name: right
    type: dummy
    parallel: true
    parallel_group: 1
    depends_on: [base]
  - name: after
    type: dummy
    depends_on: [left, right]
"#,
    )
    .unwrap();

    let execution = harness
        .executor
        .execute(ExecutionRequest {
            app_name: "demo".to_string(),
            workflow_name: "parallel".to_string(),
            definition,
            resource_id: None,
            provider: None,
        })
        .await
        .unwrap();

    assert_eq!(execution.status, "failed");
    assert!(execution
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("left exploded"));

    let steps = harness.db.list_steps(execution.id).await.unwrap();
    let failed = steps.iter().find(|s| s.step_name == "left").unwrap();
    assert_eq!(failed.status, "failed");
    // The step after the failed group never ran
    let after = steps.iter().find(|s| s.step_name == "after").unwrap();
    assert_eq!(after.status, "pending");

    harness.queue.stop().await;
}

#[tokio::test]
async fn test_conditional_step_skipped() {
    let harness = harness(1).await;

    let definition = WorkflowDefinition::from_yaml(
        r#"
steps:
  - name: base
    type: dummy
    config:
      outputs:
        enabled: "false"
  - name: optional
    type: dummy
    if: "steps.base.outputs.enabled == 'true'"
  - name: final
    type: dummy
    depends_on: [optional]
"#,
    )
    .unwrap();

    let execution = harness
        .executor
        .execute(ExecutionRequest {
            app_name: "demo".to_string(),
            workflow_name: "conditional".to_string(),
            definition,
            resource_id: None,
            provider: None,
        })
        .await
        .unwrap();

    assert_eq!(execution.status, "completed");
    let steps = harness.db.list_steps(execution.id).await.unwrap();
    assert_eq!(steps[1].status, "skipped");
    // A skipped step still satisfies its dependents
    assert_eq!(steps[2].status, "completed");

    harness.queue.stop().await;
}

#[tokio::test]
async fn test_queue_graceful_shutdown_leaves_pending_tasks() {
    let harness = harness(2).await;

    let slow = WorkflowDefinition::from_yaml(
        r#"
steps:
  - name: work
    type: slow
"#,
    )
    .unwrap();

    for _ in 0..10 {
        harness
            .queue
            .enqueue("demo", "slow-workflow", slow.clone(), Map::new())
            .await
            .unwrap();
    }

    // Let the two workers finish a few tasks, then stop
    {
        let db = harness.db.clone();
        wait_until("a few tasks completed", move || {
            let db = db.clone();
            async move { db.count_tasks_by_status("completed").await.unwrap() >= 3 }
        })
        .await;
    }

    let stopped = tokio::time::timeout(Duration::from_secs(5), harness.queue.stop()).await;
    assert!(stopped.is_ok(), "stop() must return in bounded time");

    // Nothing was killed mid-task and the ledger balances
    let completed = harness.db.count_tasks_by_status("completed").await.unwrap();
    let failed = harness.db.count_tasks_by_status("failed").await.unwrap();
    let pending = harness.db.count_tasks_by_status("pending").await.unwrap();
    let running = harness.db.count_tasks_by_status("running").await.unwrap();

    assert_eq!(running, 0, "no task may be left mid-flight");
    assert!(pending > 0, "unstarted tasks stay pending for the next start");
    assert_eq!(completed + failed + pending + running, 10);

    let metrics = harness.queue.metrics();
    assert_eq!(metrics.tasks_enqueued, 10);
    assert_eq!(
        metrics.tasks_enqueued,
        metrics.tasks_completed + metrics.tasks_failed + pending as u64 + running as u64
    );
}

#[tokio::test]
async fn test_stopped_queue_leaves_resource_requested() {
    let harness = harness(1).await;
    register_database_team(&harness).await;

    // Shutting down: the queue no longer accepts work
    harness.queue.stop().await;

    let rows = materialize_spec(&harness.db, &harness.bus, &harness.registry, &demo_spec("postgres"))
        .await
        .unwrap();
    let resource_id = rows[0].id;

    harness.engine.tick().await.unwrap();

    // The resource is left for a later tick rather than failed
    let resource = harness.db.get_resource(resource_id).await.unwrap().unwrap();
    assert_eq!(resource.state, "requested");
}

#[tokio::test]
async fn test_queue_restart_repumps_pending_tasks() {
    let harness = harness(1).await;

    let slow = WorkflowDefinition::from_yaml(
        r#"
steps:
  - name: work
    type: slow
"#,
    )
    .unwrap();

    for _ in 0..4 {
        harness
            .queue
            .enqueue("demo", "slow-workflow", slow.clone(), Map::new())
            .await
            .unwrap();
    }

    // Stop after the first completion; the rest stay pending
    {
        let db = harness.db.clone();
        wait_until("first completion", move || {
            let db = db.clone();
            async move { db.count_tasks_by_status("completed").await.unwrap() >= 1 }
        })
        .await;
    }
    harness.queue.stop().await;
    let pending_before = harness.db.count_tasks_by_status("pending").await.unwrap();
    assert!(pending_before > 0);

    // A fresh start drains what the previous run left behind
    harness.queue.start().await;
    {
        let db = harness.db.clone();
        wait_until("all tasks drained", move || {
            let db = db.clone();
            async move { db.count_tasks_by_status("pending").await.unwrap() == 0 }
        })
        .await;
    }
    harness.queue.stop().await;
}
