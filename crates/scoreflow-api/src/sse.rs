// Event streaming HTTP routes (SSE)
//
// The broker adapts the in-process event bus to persistent
// text/event-stream responses. Every client owns a bounded queue; the
// bus-side handler has a one-second budget to enqueue and drops the event
// otherwise, so a stalled client can never block publishers.

use std::collections::HashMap;
use std::convert::Infallible;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scoreflow_core::{EventBus, EventType, SubscriptionFilter};

/// Per-client queue capacity
const CLIENT_QUEUE_CAPACITY: usize = 100;
/// Budget for handing an event to a client queue
const ENQUEUE_BUDGET: Duration = Duration::from_secs(1);
/// Comment-frame keepalive interval
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

struct ClientHandle {
    subscription_id: String,
}

/// Fans bus events out to connected SSE clients
pub struct SseBroker {
    bus: Arc<EventBus>,
    clients: RwLock<HashMap<String, ClientHandle>>,
    closed: AtomicBool,
}

impl SseBroker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            clients: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a client and return its id plus the frame stream
    /// (a `connected` frame first, then matching events as JSON)
    ///
    /// Returns None when the broker or the bus is shut down.
    pub fn attach_client(
        self: &Arc<Self>,
        app_filter: String,
        event_types: Vec<EventType>,
    ) -> Option<(String, BoxStream<'static, String>)> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let client_id = Uuid::now_v7().to_string();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);

        let handler_client = client_id.clone();
        let subscription_id = self.bus.subscribe(
            SubscriptionFilter {
                app_name: app_filter,
                event_types,
            },
            move |event| {
                let tx = tx.clone();
                let client_id = handler_client.clone();
                async move {
                    if tokio::time::timeout(ENQUEUE_BUDGET, tx.send(event))
                        .await
                        .is_err()
                    {
                        warn!(client_id = %client_id, "SSE client queue full, dropping event");
                    }
                }
            },
        );
        if subscription_id.is_empty() {
            return None;
        }

        self.clients.write().insert(
            client_id.clone(),
            ClientHandle {
                subscription_id: subscription_id.clone(),
            },
        );
        info!(client_id = %client_id, "SSE client connected");

        // Dropping the stream (client went away) deregisters the client
        let guard = ClientGuard {
            broker: Arc::clone(self),
            client_id: client_id.clone(),
        };

        let connected = serde_json::json!({
            "type": "connected",
            "client_id": client_id,
        })
        .to_string();

        let frames = stream::once(async move { connected })
            .chain(ReceiverStream::new(rx).map(move |event| {
                let _keep_alive = &guard;
                serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string())
            }))
            .boxed();

        Some((client_id, frames))
    }

    async fn deregister(&self, client_id: &str) {
        let handle = self.clients.write().remove(client_id);
        if let Some(handle) = handle {
            self.bus.unsubscribe(&handle.subscription_id).await;
            info!(client_id = %client_id, "SSE client disconnected");
        }
    }

    /// Disconnect every client; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<(String, ClientHandle)> = self.clients.write().drain().collect();
        for (client_id, handle) in drained {
            self.bus.unsubscribe(&handle.subscription_id).await;
            debug!(client_id = %client_id, "SSE client closed by shutdown");
        }
        info!("SSE broker closed");
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }
}

struct ClientGuard {
    broker: Arc<SseBroker>,
    client_id: String,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let broker = Arc::clone(&self.broker);
        let client_id = self.client_id.clone();
        tokio::spawn(async move {
            broker.deregister(&client_id).await;
        });
    }
}

// ============================================
// App State and Routes
// ============================================

/// App state for event streaming routes
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<SseBroker>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/events", get(stream_events))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct EventStreamParams {
    /// Filter to one app; empty or absent means all apps
    #[serde(default)]
    pub app: Option<String>,
    /// CSV of event types; empty or absent means all types
    #[serde(default)]
    pub types: Option<String>,
}

/// GET /api/events - persistent event stream
pub async fn stream_events(
    State(state): State<AppState>,
    Query(params): Query<EventStreamParams>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, String)> {
    let app_filter = params.app.unwrap_or_default();
    let mut event_types = Vec::new();
    for raw in params
        .types
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        let event_type = EventType::from_str(raw).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
        event_types.push(event_type);
    }

    let (client_id, frames) = state
        .broker
        .attach_client(app_filter, event_types)
        .ok_or((
            StatusCode::SERVICE_UNAVAILABLE,
            "event stream shutting down".to_string(),
        ))?;

    debug!(client_id = %client_id, "Starting event stream");

    let stream = frames.map(|json| Ok(SseEvent::default().data(json)));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoreflow_core::Event;

    async fn next_frame(stream: &mut BoxStream<'static, String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_app_filtering_between_clients() {
        let bus = Arc::new(EventBus::new());
        let broker = Arc::new(SseBroker::new(bus.clone()));

        let (client_a, mut stream_a) = broker.attach_client("app1".into(), vec![]).unwrap();
        let (client_b, mut stream_b) = broker.attach_client("app2".into(), vec![]).unwrap();
        assert_ne!(client_a, client_b);
        assert_eq!(broker.client_count(), 2);

        // Both receive the initial connected frame
        let connected_a = next_frame(&mut stream_a).await.unwrap();
        assert!(connected_a.contains("\"type\":\"connected\""));
        assert!(connected_a.contains(&client_a));
        let connected_b = next_frame(&mut stream_b).await.unwrap();
        assert!(connected_b.contains(&client_b));

        bus.publish(Event::new(EventType::ResourceActive, "app1", "test"));
        bus.publish(Event::new(EventType::ResourceActive, "app2", "test"));
        bus.publish(Event::new(EventType::ResourceActive, "app3", "test"));

        // A sees only app1, B only app2, app3 goes nowhere
        let frame_a = next_frame(&mut stream_a).await.unwrap();
        assert!(frame_a.contains("\"app_name\":\"app1\""));
        let frame_b = next_frame(&mut stream_b).await.unwrap();
        assert!(frame_b.contains("\"app_name\":\"app2\""));

        assert!(next_frame(&mut stream_a).await.is_none());
        assert!(next_frame(&mut stream_b).await.is_none());

        broker.close().await;
        bus.close().await;
    }

    #[tokio::test]
    async fn test_type_filtering() {
        let bus = Arc::new(EventBus::new());
        let broker = Arc::new(SseBroker::new(bus.clone()));

        let (_, mut stream) = broker
            .attach_client(String::new(), vec![EventType::WorkflowCompleted])
            .unwrap();
        next_frame(&mut stream).await.unwrap(); // connected

        bus.publish(Event::new(EventType::WorkflowStarted, "demo", "test"));
        bus.publish(Event::new(EventType::WorkflowCompleted, "demo", "test"));

        let frame = next_frame(&mut stream).await.unwrap();
        assert!(frame.contains("workflow.completed"));
        assert!(next_frame(&mut stream).await.is_none());

        broker.close().await;
        bus.close().await;
    }

    #[tokio::test]
    async fn test_dropped_stream_deregisters_client() {
        let bus = Arc::new(EventBus::new());
        let broker = Arc::new(SseBroker::new(bus.clone()));

        let (_, mut stream) = broker.attach_client(String::new(), vec![]).unwrap();
        next_frame(&mut stream).await.unwrap();
        assert_eq!(broker.client_count(), 1);

        drop(stream);
        // Deregistration happens on a spawned task
        for _ in 0..40 {
            if broker.client_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(broker.client_count(), 0);
        assert_eq!(bus.subscriber_count(), 0);

        broker.close().await;
    }

    #[tokio::test]
    async fn test_closed_broker_rejects_clients() {
        let bus = Arc::new(EventBus::new());
        let broker = Arc::new(SseBroker::new(bus.clone()));

        broker.close().await;
        broker.close().await; // idempotent

        assert!(broker.attach_client(String::new(), vec![]).is_none());
    }
}
