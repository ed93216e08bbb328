// Persistent bounded workflow queue
//
// Tasks are persisted before they enter the worker channel, so a restart
// finds queued-but-unstarted work still `pending`. Workers report terminal
// status through a dedicated update channel drained by one writer task;
// worker throughput is not bound to database write latency. stop() joins
// every worker handle explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scoreflow_core::{CoreError, Event, EventBus, EventType, Result, WorkflowDefinition};
use scoreflow_storage::{CreateTask, StorageBackend};

use crate::executor::{ExecutionRequest, WorkflowExecutor};

const SOURCE: &str = "workflow-queue";

/// Queue construction parameters
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
    pub enqueue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            capacity: 64,
            enqueue_timeout: Duration::from_secs(5),
        }
    }
}

/// A task travelling through the worker channel
#[derive(Debug, Clone)]
struct QueuedTask {
    task_id: String,
    app_name: String,
    workflow_name: String,
    definition: WorkflowDefinition,
    resource_id: Option<i64>,
    provider: Option<String>,
    enqueued_at: chrono::DateTime<chrono::Utc>,
}

enum StatusUpdate {
    Running { task_id: String },
    Completed { task_id: String },
    Failed { task_id: String, error: String },
}

/// Counters and rolling averages exposed by the queue
#[derive(Default)]
struct QueueMetrics {
    tasks_enqueued: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    active_tasks: AtomicU64,
    queue_time_total_ms: AtomicU64,
    queue_time_samples: AtomicU64,
    exec_time_total_ms: AtomicU64,
    exec_time_samples: AtomicU64,
}

impl QueueMetrics {
    fn average(total: &AtomicU64, samples: &AtomicU64) -> f64 {
        let samples = samples.load(Ordering::Relaxed);
        if samples == 0 {
            0.0
        } else {
            total.load(Ordering::Relaxed) as f64 / samples as f64
        }
    }
}

/// Point-in-time queue metrics
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetricsSnapshot {
    pub tasks_enqueued: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub active_tasks: u64,
    pub queue_size: usize,
    pub workers: usize,
    pub avg_queue_time_ms: f64,
    pub avg_execution_time_ms: f64,
}

/// Bounded, persistent, worker-pool-backed workflow queue
pub struct WorkflowQueue {
    db: StorageBackend,
    executor: Arc<WorkflowExecutor>,
    bus: Arc<EventBus>,
    config: QueueConfig,
    metrics: Arc<QueueMetrics>,
    task_tx: Mutex<Option<mpsc::Sender<QueuedTask>>>,
    status_tx: Mutex<Option<mpsc::UnboundedSender<StatusUpdate>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    status_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkflowQueue {
    pub fn new(
        db: StorageBackend,
        executor: Arc<WorkflowExecutor>,
        bus: Arc<EventBus>,
        config: QueueConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            db,
            executor,
            bus,
            config,
            metrics: Arc::new(QueueMetrics::default()),
            task_tx: Mutex::new(None),
            status_tx: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
            status_handle: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Start workers and the status processor, then re-pump tasks a
    /// previous process left `pending`
    pub async fn start(&self) {
        if self.task_tx.lock().is_some() {
            return;
        }

        let (task_tx, task_rx) = mpsc::channel::<QueuedTask>(self.config.capacity);
        let (status_tx, status_rx) = mpsc::unbounded_channel::<StatusUpdate>();
        let _ = self.shutdown_tx.send(false);

        *self.task_tx.lock() = Some(task_tx.clone());
        *self.status_tx.lock() = Some(status_tx.clone());

        // Dedicated status writer keeps workers off the database
        let status_db = self.db.clone();
        *self.status_handle.lock() = Some(tokio::spawn(Self::process_status_updates(
            status_db, status_rx,
        )));

        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let mut handles = self.worker_handles.lock();
        for worker_id in 0..self.config.workers.max(1) {
            handles.push(tokio::spawn(Self::worker_loop(
                worker_id,
                Arc::clone(&task_rx),
                self.executor.clone(),
                status_tx.clone(),
                self.metrics.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }
        drop(handles);

        info!(workers = self.config.workers, capacity = self.config.capacity, "Workflow queue started");

        self.repump_pending(task_tx).await;
    }

    /// Push tasks still `pending` in the store back into the channel
    async fn repump_pending(&self, task_tx: mpsc::Sender<QueuedTask>) {
        let pending = match self.db.list_tasks_by_status("pending").await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Failed to list pending tasks on start");
                return;
            }
        };

        for row in pending {
            let definition = match serde_yaml::from_str::<WorkflowDefinition>(&row.workflow_spec) {
                Ok(definition) => definition,
                Err(e) => {
                    warn!(task_id = %row.task_id, error = %e, "Unparseable persisted task, marking failed");
                    let _ = self
                        .db
                        .mark_task_failed(&row.task_id, &format!("unparseable workflow spec: {e}"))
                        .await;
                    continue;
                }
            };

            let task = QueuedTask {
                task_id: row.task_id.clone(),
                app_name: row.app_name,
                workflow_name: row.workflow_name,
                definition,
                resource_id: row.metadata.get("resource_id").and_then(|v| v.as_i64()),
                provider: row
                    .metadata
                    .get("provider")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                enqueued_at: row.enqueued_at,
            };
            if task_tx.try_send(task).is_err() {
                // Channel full; the rest stays pending for later
                break;
            }
            debug!(task_id = %row.task_id, "Re-queued pending task");
        }
    }

    /// Persist and enqueue a workflow task
    ///
    /// The row is written first; only then does the task enter the worker
    /// channel. A send timeout surfaces as `QueueFull` and leaves the row
    /// `pending`.
    pub async fn enqueue(
        &self,
        app_name: &str,
        workflow_name: &str,
        definition: WorkflowDefinition,
        mut metadata: Map<String, Value>,
    ) -> Result<String> {
        // Refuse up front when the queue is not running, before anything
        // is persisted
        let sender = self
            .task_tx
            .lock()
            .clone()
            .ok_or(CoreError::Cancelled)?;

        // Time-ordered ids keep the queue table naturally sorted
        let task_id = format!("task-{}", Uuid::now_v7());

        let workflow_spec = serde_yaml::to_string(&definition)
            .map_err(|e| CoreError::store(format!("serialize workflow: {e}")))?;
        metadata
            .entry("workflow_name".to_string())
            .or_insert_with(|| Value::from(workflow_name));

        let row = self
            .db
            .create_task(CreateTask {
                task_id: task_id.clone(),
                app_name: app_name.to_string(),
                workflow_name: workflow_name.to_string(),
                workflow_spec,
                metadata: metadata.clone(),
            })
            .await?;
        // Counted at persist time so the ledger balances even when the
        // channel send below times out and the row stays pending
        self.metrics.tasks_enqueued.fetch_add(1, Ordering::Relaxed);

        let task = QueuedTask {
            task_id: task_id.clone(),
            app_name: app_name.to_string(),
            workflow_name: workflow_name.to_string(),
            definition,
            resource_id: metadata.get("resource_id").and_then(|v| v.as_i64()),
            provider: metadata
                .get("provider")
                .and_then(|v| v.as_str())
                .map(String::from),
            enqueued_at: row.enqueued_at,
        };

        match tokio::time::timeout(self.config.enqueue_timeout, sender.send(task)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // Queue stopped between the persist and the send; the row
                // must not linger as a duplicate for the next repump
                self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
                let _ = self.db.mark_task_failed(&task_id, "queue stopped").await;
                return Err(CoreError::Cancelled);
            }
            Err(_) => {
                warn!(task_id = %task_id, "Worker channel full, enqueue timed out");
                self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
                let _ = self.db.mark_task_failed(&task_id, "queue full").await;
                return Err(CoreError::QueueFull);
            }
        }

        self.bus.publish(
            Event::new(EventType::WorkflowCreated, app_name, SOURCE)
                .with_data("task_id", task_id.clone())
                .with_data("workflow_name", workflow_name),
        );

        debug!(task_id = %task_id, app = app_name, workflow = workflow_name, "Task enqueued");
        Ok(task_id)
    }

    async fn worker_loop(
        worker_id: usize,
        task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedTask>>>,
        executor: Arc<WorkflowExecutor>,
        status_tx: mpsc::UnboundedSender<StatusUpdate>,
        metrics: Arc<QueueMetrics>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(worker_id, "Queue worker started");
        loop {
            // Stop picking up new work on shutdown; the current task (below)
            // always runs to completion first
            let task = tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(worker_id, "Queue worker shutting down");
                    break;
                }
                task = async { task_rx.lock().await.recv().await } => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let queue_time_ms = (Utc::now() - task.enqueued_at).num_milliseconds().max(0) as u64;
            metrics
                .queue_time_total_ms
                .fetch_add(queue_time_ms, Ordering::Relaxed);
            metrics.queue_time_samples.fetch_add(1, Ordering::Relaxed);
            metrics.active_tasks.fetch_add(1, Ordering::Relaxed);

            let _ = status_tx.send(StatusUpdate::Running {
                task_id: task.task_id.clone(),
            });

            let started = tokio::time::Instant::now();
            let request = ExecutionRequest {
                app_name: task.app_name.clone(),
                workflow_name: task.workflow_name.clone(),
                definition: task.definition.clone(),
                resource_id: task.resource_id,
                provider: task.provider.clone(),
            };
            let result = executor.execute(request).await;
            let exec_time_ms = started.elapsed().as_millis() as u64;
            metrics
                .exec_time_total_ms
                .fetch_add(exec_time_ms, Ordering::Relaxed);
            metrics.exec_time_samples.fetch_add(1, Ordering::Relaxed);

            let update = match result {
                Ok(execution) if execution.status == "completed" => {
                    metrics.tasks_completed.fetch_add(1, Ordering::Relaxed);
                    StatusUpdate::Completed {
                        task_id: task.task_id.clone(),
                    }
                }
                Ok(execution) => {
                    metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
                    StatusUpdate::Failed {
                        task_id: task.task_id.clone(),
                        error: execution
                            .error_message
                            .unwrap_or_else(|| "workflow failed".to_string()),
                    }
                }
                Err(e) => {
                    metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);
                    error!(task_id = %task.task_id, error = %e, "Workflow execution error");
                    StatusUpdate::Failed {
                        task_id: task.task_id.clone(),
                        error: e.to_string(),
                    }
                }
            };
            let _ = status_tx.send(update);
            metrics.active_tasks.fetch_sub(1, Ordering::Relaxed);
        }
        debug!(worker_id, "Queue worker exited");
    }

    async fn process_status_updates(
        db: StorageBackend,
        mut status_rx: mpsc::UnboundedReceiver<StatusUpdate>,
    ) {
        while let Some(update) = status_rx.recv().await {
            let result = match &update {
                StatusUpdate::Running { task_id } => db.mark_task_running(task_id).await,
                StatusUpdate::Completed { task_id } => db.mark_task_completed(task_id).await,
                StatusUpdate::Failed { task_id, error } => {
                    db.mark_task_failed(task_id, error).await
                }
            };
            if let Err(e) = result {
                error!(error = %e, "Task status write failed");
            }
        }
        debug!("Status processor exited");
    }

    /// Graceful shutdown: no new tasks are picked up, in-flight tasks run
    /// to completion, workers and the status processor are joined.
    /// Queued-but-unstarted tasks stay `pending` in the store. Idempotent.
    pub async fn stop(&self) {
        let Some(task_tx) = self.task_tx.lock().take() else {
            return;
        };
        info!("Stopping workflow queue");

        let _ = self.shutdown_tx.send(true);
        drop(task_tx);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.worker_handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Queue worker join failed");
            }
        }

        // Workers are gone; close the status channel and drain the writer
        let status_tx = self.status_tx.lock().take();
        drop(status_tx);
        let status_handle = self.status_handle.lock().take();
        if let Some(handle) = status_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Status processor join failed");
            }
        }

        info!("Workflow queue stopped");
    }

    /// Current metrics snapshot
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        let queue_size = self
            .task_tx
            .lock()
            .as_ref()
            .map(|tx| self.config.capacity - tx.capacity())
            .unwrap_or(0);

        QueueMetricsSnapshot {
            tasks_enqueued: self.metrics.tasks_enqueued.load(Ordering::Relaxed),
            tasks_completed: self.metrics.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.metrics.tasks_failed.load(Ordering::Relaxed),
            active_tasks: self.metrics.active_tasks.load(Ordering::Relaxed),
            queue_size,
            workers: self.config.workers,
            avg_queue_time_ms: QueueMetrics::average(
                &self.metrics.queue_time_total_ms,
                &self.metrics.queue_time_samples,
            ),
            avg_execution_time_ms: QueueMetrics::average(
                &self.metrics.exec_time_total_ms,
                &self.metrics.exec_time_samples,
            ),
        }
    }
}
