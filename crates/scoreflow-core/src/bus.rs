// In-process publish/subscribe bus
//
// Every subscriber owns a bounded queue drained by its own worker task, so
// publishers never block: when a subscriber's queue is full the event is
// dropped for that subscriber (warn + counter) and delivery continues.
// Handler panics are caught per invocation and taint only that delivery.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{Event, EventType};

/// Default per-subscriber queue capacity
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Boxed async event handler
pub type EventHandler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Filter deciding which events a subscriber receives
///
/// An empty `app_name` matches every app; an empty `event_types` list
/// matches every type.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub app_name: String,
    pub event_types: Vec<EventType>,
}

impl SubscriptionFilter {
    /// Match all events
    pub fn all() -> Self {
        Self::default()
    }

    /// Match events for a single app (empty = all apps)
    pub fn for_app(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            event_types: vec![],
        }
    }

    /// Restrict to a set of event types (empty = all types)
    pub fn with_types(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = event_types;
        self
    }

    /// Whether an event passes this filter
    pub fn matches(&self, event: &Event) -> bool {
        let app_ok = self.app_name.is_empty() || self.app_name == event.app_name;
        let type_ok = self.event_types.is_empty() || self.event_types.contains(&event.event_type);
        app_ok && type_ok
    }
}

struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Event>,
    worker: JoinHandle<()>,
}

/// Process-wide event bus
///
/// Delivery is asynchronous with respect to publishers, best-effort and
/// at-most-once. Per subscriber, events that are not dropped arrive in
/// publish order.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Subscriber>>,
    queue_capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus with a custom per-subscriber queue capacity
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Publish an event to all matching subscribers
    ///
    /// Never blocks the caller. Publishing to a closed bus is a no-op.
    pub fn publish(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            warn!(event_type = %event.event_type, "Publish on closed event bus ignored");
            return;
        }

        let subscribers = self.subscribers.read();
        for (id, subscriber) in subscribers.iter() {
            if !subscriber.filter.matches(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription_id = %id,
                        event_type = %event.event_type,
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Subscriber is shutting down; unsubscribe will reap it
                    debug!(subscription_id = %id, "Subscriber channel closed");
                }
            }
        }
    }

    /// Register a handler and return its subscription id
    ///
    /// Subscribing to a closed bus fails and returns an empty id.
    pub fn subscribe<F, Fut>(&self, filter: SubscriptionFilter, handler: F) -> String
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            warn!("Subscribe on closed event bus rejected");
            return String::new();
        }

        let id = Uuid::now_v7().to_string();
        let (tx, mut rx) = mpsc::channel::<Event>(self.queue_capacity);
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));

        let worker_id = id.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let fut = handler(event);
                if std::panic::AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    warn!(subscription_id = %worker_id, "Event handler panicked");
                }
            }
            debug!(subscription_id = %worker_id, "Subscriber worker exited");
        });

        self.subscribers
            .write()
            .insert(id.clone(), Subscriber { filter, tx, worker });

        id
    }

    /// Remove a subscription, stopping and joining its worker
    ///
    /// Idempotent: unknown ids are a no-op.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        let subscriber = self.subscribers.write().remove(subscription_id);
        if let Some(subscriber) = subscriber {
            // Dropping the sender lets the worker drain its queue and exit
            drop(subscriber.tx);
            if let Err(e) = subscriber.worker.await {
                warn!(subscription_id = %subscription_id, error = %e, "Subscriber worker join failed");
            }
        }
    }

    /// Stop all subscribers and reject further publishes and subscriptions
    ///
    /// Idempotent; the second call is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<(String, Subscriber)> = self.subscribers.write().drain().collect();
        for (id, subscriber) in drained {
            drop(subscriber.tx);
            if let Err(e) = subscriber.worker.await {
                warn!(subscription_id = %id, error = %e, "Subscriber worker join failed");
            }
        }
        debug!("Event bus closed");
    }

    /// Number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Total events dropped to slow subscribers since construction
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the bus has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collector() -> (Arc<Mutex<Vec<Event>>>, impl Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Clone) {
        let received: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handler = move |event: Event| -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(event);
            })
        };
        (received, handler)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscriber() {
        let bus = EventBus::new();
        let (received, handler) = collector();
        bus.subscribe(SubscriptionFilter::for_app("app1"), handler);

        bus.publish(Event::new(EventType::ResourceCreated, "app1", "test"));
        bus.publish(Event::new(EventType::ResourceCreated, "app2", "test"));
        settle().await;

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].app_name, "app1");

        bus.close().await;
    }

    #[tokio::test]
    async fn test_type_filter() {
        let bus = EventBus::new();
        let (received, handler) = collector();
        bus.subscribe(
            SubscriptionFilter::all().with_types(vec![EventType::WorkflowCompleted]),
            handler,
        );

        bus.publish(Event::new(EventType::WorkflowStarted, "demo", "test"));
        bus.publish(Event::new(EventType::WorkflowCompleted, "demo", "test"));
        settle().await;

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::WorkflowCompleted);

        bus.close().await;
    }

    #[tokio::test]
    async fn test_per_subscriber_order_preserved() {
        let bus = EventBus::new();
        let (received, handler) = collector();
        bus.subscribe(SubscriptionFilter::all(), handler);

        for i in 0..20 {
            bus.publish(Event::new(EventType::StepProgress, "demo", "test").with_data("seq", i));
        }
        settle().await;

        let events = received.lock().unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.data["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, (0..20).collect::<Vec<i64>>());

        bus.close().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_is_idempotent() {
        let bus = EventBus::new();
        let (received, handler) = collector();
        let id = bus.subscribe(SubscriptionFilter::all(), handler);
        assert_eq!(bus.subscriber_count(), 1);

        bus.unsubscribe(&id).await;
        bus.unsubscribe(&id).await;
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(Event::new(EventType::ResourceCreated, "demo", "test"));
        settle().await;
        assert!(received.lock().unwrap().is_empty());

        bus.close().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_affect_others() {
        let bus = EventBus::new();
        bus.subscribe(SubscriptionFilter::all(), |_event| async {
            panic!("handler bug");
        });
        let (received, handler) = collector();
        bus.subscribe(SubscriptionFilter::all(), handler);

        bus.publish(Event::new(EventType::ResourceCreated, "demo", "test"));
        bus.publish(Event::new(EventType::ResourceActive, "demo", "test"));
        settle().await;

        assert_eq!(received.lock().unwrap().len(), 2);

        bus.close().await;
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_but_does_not_block() {
        let bus = EventBus::with_capacity(1);
        bus.subscribe(SubscriptionFilter::all(), |_event| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        // First event is picked up by the worker, second fills the queue,
        // the rest are dropped; publish never blocks.
        for _ in 0..10 {
            bus.publish(Event::new(EventType::StepProgress, "demo", "test"));
        }
        assert!(bus.dropped_count() > 0);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_subscribe_and_ignores_publish() {
        let bus = EventBus::new();
        bus.close().await;
        bus.close().await; // idempotent

        let id = bus.subscribe(SubscriptionFilter::all(), |_event| async {});
        assert!(id.is_empty());

        // No panic, no delivery
        bus.publish(Event::new(EventType::ResourceCreated, "demo", "test"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
