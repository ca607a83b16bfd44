//! Service change events and bounded subscriber dispatch
//!
//! TigerStyle: Each subscriber owns a fixed-depth queue and one worker task.
//! Publishing never waits on a subscriber; a full queue drops the event for
//! that subscriber and counts the drop.

use crate::service::ServiceDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// =============================================================================
// Event Types
// =============================================================================

/// Kind of service change
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    ServiceRegistered,
    ServiceDeregistered,
    ServiceUpdated,
    ServiceHealthy,
    ServiceUnhealthy,
    ServiceStateChanged,
    HealthCheckPassed,
    HealthCheckFailed,
    /// Published through `notify_service_change`
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ServiceRegistered => "service_registered",
            Self::ServiceDeregistered => "service_deregistered",
            Self::ServiceUpdated => "service_updated",
            Self::ServiceHealthy => "service_healthy",
            Self::ServiceUnhealthy => "service_unhealthy",
            Self::ServiceStateChanged => "service_state_changed",
            Self::HealthCheckPassed => "health_check_passed",
            Self::HealthCheckFailed => "health_check_failed",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "service_registered" => Self::ServiceRegistered,
            "service_deregistered" => Self::ServiceDeregistered,
            "service_updated" => Self::ServiceUpdated,
            "service_healthy" => Self::ServiceHealthy,
            "service_unhealthy" => Self::ServiceUnhealthy,
            "service_state_changed" => Self::ServiceStateChanged,
            "health_check_passed" => Self::HealthCheckPassed,
            "health_check_failed" => Self::HealthCheckFailed,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_type: EventType,
    pub service: ServiceDescriptor,
    pub timestamp_ms: u64,
    pub message: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl ServiceEvent {
    pub fn new(
        event_type: EventType,
        service: ServiceDescriptor,
        timestamp_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            service,
            timestamp_ms,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Restricts which events a subscriber receives; empty fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub service_name: Option<String>,
    pub event_type: Option<EventType>,
}

impl EventFilter {
    pub fn for_service(name: impl Into<String>) -> Self {
        Self {
            service_name: Some(name.into()),
            event_type: None,
        }
    }

    pub fn for_type(event_type: EventType) -> Self {
        Self {
            service_name: None,
            event_type: Some(event_type),
        }
    }

    pub fn matches(&self, event: &ServiceEvent) -> bool {
        if let Some(name) = &self.service_name {
            if &event.service.name != name {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Subscriber callback; runs on the subscriber's own worker task
pub type EventCallback = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Delivery counters for one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub id: SubscriptionId,
    pub delivered: u64,
    pub dropped: u64,
    pub panicked: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    panicked: AtomicU64,
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Arc<ServiceEvent>>,
    counters: Arc<Counters>,
    _worker: JoinHandle<()>,
}

/// Fans events out to subscribers and keeps a bounded history
pub struct EventDispatcher {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    history: Mutex<VecDeque<ServiceEvent>>,
    history_count_max: usize,
    queue_depth_max: usize,
    next_id: AtomicU64,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("history_count_max", &self.history_count_max)
            .field("queue_depth_max", &self.queue_depth_max)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    pub fn new(queue_depth_max: usize, history_count_max: usize) -> Self {
        assert!(queue_depth_max > 0, "queue depth must be positive");
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(history_count_max.min(1024))),
            history_count_max,
            queue_depth_max,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback and spawn its worker
    ///
    /// Must be called from within a tokio runtime.
    pub async fn subscribe(&self, filter: EventFilter, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::channel::<Arc<ServiceEvent>>(self.queue_depth_max);
        let counters = Arc::new(Counters::default());

        let worker_counters = counters.clone();
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event)));
                match outcome {
                    Ok(()) => {
                        worker_counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        worker_counters.panicked.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscription = %id,
                            event_type = %event.event_type,
                            service_id = %event.service.id,
                            "event subscriber panicked"
                        );
                    }
                }
            }
            debug!(subscription = %id, "event subscriber worker exited");
        });

        self.subscribers.write().await.insert(
            id,
            Subscriber {
                filter,
                tx,
                counters,
                _worker: worker,
            },
        );
        debug!(subscription = %id, "event subscriber added");
        id
    }

    /// Remove a subscriber; its worker drains queued events and exits
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().await.remove(&id).is_some()
    }

    /// Remove every subscriber
    pub async fn unsubscribe_all(&self) -> usize {
        let mut subscribers = self.subscribers.write().await;
        let count = subscribers.len();
        subscribers.clear();
        count
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn stats(&self, id: SubscriptionId) -> Option<SubscriptionStats> {
        self.subscribers.read().await.get(&id).map(|s| SubscriptionStats {
            id,
            delivered: s.counters.delivered.load(Ordering::Relaxed),
            dropped: s.counters.dropped.load(Ordering::Relaxed),
            panicked: s.counters.panicked.load(Ordering::Relaxed),
        })
    }

    /// Record the event and enqueue it for every matching subscriber
    pub async fn publish(&self, event: ServiceEvent) {
        {
            let mut history = self.history.lock().await;
            if self.history_count_max > 0 {
                while history.len() >= self.history_count_max {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        let event = Arc::new(event);
        let subscribers = self.subscribers.read().await;
        for (id, subscriber) in subscribers.iter() {
            if !subscriber.filter.matches(&event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    subscriber.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = %id,
                        event_type = %event.event_type,
                        "subscriber queue full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(subscription = %id, "subscriber worker gone, event dropped");
                }
            }
        }
    }

    /// Most recent events, oldest first; `limit` of zero returns all retained
    pub async fn history(&self, limit: usize) -> Vec<ServiceEvent> {
        let history = self.history.lock().await;
        let skip = if limit == 0 {
            0
        } else {
            history.len().saturating_sub(limit)
        };
        history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(event_type: EventType, name: &str) -> ServiceEvent {
        ServiceEvent::new(
            event_type,
            ServiceDescriptor::new("svc-1", name, "127.0.0.1", 80),
            1,
            "test",
        )
    }

    async fn wait_for(counter: &AtomicU64, expected: u64) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "timed out waiting for {} (have {})",
            expected,
            counter.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_event_type_roundtrip_names() {
        assert_eq!(EventType::from("service_registered"), EventType::ServiceRegistered);
        assert_eq!(
            EventType::from("plugin_reloaded"),
            EventType::Custom("plugin_reloaded".into())
        );
        assert_eq!(EventType::HealthCheckFailed.to_string(), "health_check_failed");

        let json = serde_json::to_string(&EventType::ServiceUpdated).unwrap();
        assert_eq!(json, "\"service_updated\"");
    }

    #[test]
    fn test_filter_matching() {
        let e = event(EventType::ServiceRegistered, "api");
        assert!(EventFilter::default().matches(&e));
        assert!(EventFilter::for_service("api").matches(&e));
        assert!(!EventFilter::for_service("db").matches(&e));
        assert!(EventFilter::for_type(EventType::ServiceRegistered).matches(&e));
        assert!(!EventFilter::for_type(EventType::ServiceUpdated).matches(&e));
    }

    #[tokio::test]
    async fn test_delivery_respects_filter() {
        let dispatcher = EventDispatcher::new(16, 100);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        dispatcher
            .subscribe(
                EventFilter::for_service("api"),
                Arc::new(move |_e| {
                    seen_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        dispatcher.publish(event(EventType::ServiceRegistered, "api")).await;
        dispatcher.publish(event(EventType::ServiceRegistered, "db")).await;
        dispatcher.publish(event(EventType::ServiceUpdated, "api")).await;

        wait_for(&seen, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let dispatcher = EventDispatcher::new(16, 100);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let id = dispatcher
            .subscribe(
                EventFilter::default(),
                Arc::new(move |e| {
                    if e.event_type == EventType::ServiceRegistered {
                        panic!("subscriber failure");
                    }
                    seen_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        dispatcher.publish(event(EventType::ServiceRegistered, "api")).await;
        dispatcher.publish(event(EventType::ServiceUpdated, "api")).await;

        wait_for(&seen, 1).await;
        let mut stats = dispatcher.stats(id).await.unwrap();
        for _ in 0..100 {
            if stats.delivered == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            stats = dispatcher.stats(id).await.unwrap();
        }
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_drops_instead_of_blocking() {
        let dispatcher = EventDispatcher::new(1, 100);
        let id = dispatcher
            .subscribe(
                EventFilter::default(),
                Arc::new(|_e| std::thread::sleep(Duration::from_millis(200))),
            )
            .await;

        // At most one event is held by the slow worker and one sits in the
        // queue; the rest are dropped without blocking the publisher.
        let started = std::time::Instant::now();
        for _ in 0..10 {
            dispatcher.publish(event(EventType::ServiceUpdated, "api")).await;
        }
        assert!(started.elapsed() < Duration::from_millis(150));

        let stats = dispatcher.stats(id).await.unwrap();
        assert!(stats.dropped >= 8, "dropped {}", stats.dropped);
        dispatcher.unsubscribe(id).await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let dispatcher = EventDispatcher::new(4, 3);
        for i in 0..5u64 {
            let mut e = event(EventType::ServiceUpdated, "api");
            e.timestamp_ms = i;
            dispatcher.publish(e).await;
        }
        let history = dispatcher.history(0).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp_ms, 2);
        assert_eq!(history[2].timestamp_ms, 4);

        let last = dispatcher.history(1).await;
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].timestamp_ms, 4);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let dispatcher = EventDispatcher::new(4, 10);
        let id = dispatcher
            .subscribe(EventFilter::default(), Arc::new(|_e| {}))
            .await;
        dispatcher
            .subscribe(EventFilter::default(), Arc::new(|_e| {}))
            .await;
        assert_eq!(dispatcher.subscriber_count().await, 2);
        assert!(dispatcher.unsubscribe(id).await);
        assert!(!dispatcher.unsubscribe(id).await);
        assert_eq!(dispatcher.unsubscribe_all().await, 1);
        assert_eq!(dispatcher.subscriber_count().await, 0);
    }
}
