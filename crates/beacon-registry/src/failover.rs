//! Circuit breakers, retry backoff and failover
//!
//! TigerStyle: Explicit state machine per instance, time read through the
//! injected clock, bounded exponential backoff.

use crate::error::{RegistryError, RegistryResult};
use crate::health::{HealthCheckOutcome, HealthChecker};
use crate::metrics::MetricsManager;
use crate::store::ServiceStore;
pub use beacon_core::config::FailoverConfig;
use beacon_core::constants::FAILOVER_EVENT_CHANNEL_CAPACITY;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Per-instance failover settings
pub type InstanceFailoverConfig = FailoverConfig;

// =============================================================================
// Breaker and Retry State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub instance_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub last_failure_ms: Option<u64>,
    /// When an Open breaker admits its half-open probe
    pub next_retry_ms: u64,
    /// Whether the single half-open probe has been handed out
    pub half_open_probe_granted: bool,
}

impl CircuitBreaker {
    fn new(instance_id: &str, config: &FailoverConfig) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: config.failure_threshold,
            recovery_timeout_ms: config.recovery_timeout_ms,
            last_failure_ms: None,
            next_retry_ms: 0,
            half_open_probe_granted: false,
        }
    }

    /// Whether a call would be admitted now, without claiming the probe
    fn would_admit(&self, now_ms: u64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => now_ms >= self.next_retry_ms,
            CircuitState::HalfOpen => !self.half_open_probe_granted,
        }
    }

    fn open(&mut self, now_ms: u64) {
        self.state = CircuitState::Open;
        self.next_retry_ms = now_ms + self.recovery_timeout_ms;
        self.half_open_probe_granted = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_probe_granted = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempts: u32,
    pub last_attempt_ms: Option<u64>,
    pub next_retry_ms: u64,
    pub current_delay_ms: u64,
}

/// `min(max_retry_delay, retry_delay × multiplier^(attempts-1))`
pub fn backoff_delay_ms(config: &FailoverConfig, attempts: u32) -> u64 {
    debug_assert!(attempts > 0);
    let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay = config.retry_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    if !delay.is_finite() || delay >= config.max_retry_delay_ms as f64 {
        config.max_retry_delay_ms
    } else {
        delay as u64
    }
}

// =============================================================================
// Results and Events
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverResult {
    pub success: bool,
    pub original_id: String,
    pub failover_id: Option<String>,
    pub reason: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverEventType {
    CircuitOpened,
    CircuitClosed,
    CircuitHalfOpen,
    ServiceFailed,
    ServiceRecovered,
    RetryExhausted,
    FailoverTriggered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub event_type: FailoverEventType,
    pub instance_id: String,
    pub timestamp_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverStatistics {
    pub configured_instances: usize,
    pub breakers_by_state: HashMap<CircuitState, usize>,
    pub instances_in_retry: usize,
    pub total_failures: u64,
    pub failovers_triggered: u64,
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Debug)]
struct Entry {
    config: FailoverConfig,
    breaker: CircuitBreaker,
    retry: RetryState,
    /// Set while a recovery probe runs; at most one per instance
    recovering: Arc<AtomicBool>,
}

impl Entry {
    fn guards_calls(&self) -> bool {
        self.config.enabled && self.config.circuit_breaker_enabled
    }
}

/// Clears the in-flight recovery flag when the attempt ends or is dropped
struct RecoveryGuard(Arc<AtomicBool>);

impl RecoveryGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Tracks breaker and retry state per configured instance
pub struct FailoverManager {
    store: Arc<ServiceStore>,
    health: Option<Arc<HealthChecker>>,
    metrics: Option<Arc<MetricsManager>>,
    entries: RwLock<HashMap<String, Entry>>,
    events_tx: broadcast::Sender<FailoverEvent>,
    failovers_triggered: AtomicU64,
}

impl fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverManager")
            .field("has_health_checker", &self.health.is_some())
            .field("has_metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl FailoverManager {
    pub fn new(store: Arc<ServiceStore>) -> Self {
        let (events_tx, _) = broadcast::channel(FAILOVER_EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            health: None,
            metrics: None,
            entries: RwLock::new(HashMap::new()),
            events_tx,
            failovers_triggered: AtomicU64::new(0),
        }
    }

    /// Probe through this checker during recovery
    pub fn with_health_checker(mut self, health: Arc<HealthChecker>) -> Self {
        self.health = Some(health);
        self
    }

    /// Forward call outcomes to this manager
    pub fn with_metrics(mut self, metrics: Arc<MetricsManager>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn now_ms(&self) -> u64 {
        self.store.io().now_ms()
    }

    fn emit(&self, event_type: FailoverEventType, instance_id: &str, message: String) {
        let event = FailoverEvent {
            event_type,
            instance_id: instance_id.to_string(),
            timestamp_ms: self.now_ms(),
            message,
        };
        // No receivers is not an error.
        let _ = self.events_tx.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<FailoverEvent> {
        self.events_tx.subscribe()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Create or replace an instance's breaker and retry state
    pub async fn configure(&self, instance_id: &str, config: FailoverConfig) -> RegistryResult<()> {
        config.validate()?;
        let entry = Entry {
            breaker: CircuitBreaker::new(instance_id, &config),
            retry: RetryState::default(),
            recovering: Arc::new(AtomicBool::new(false)),
            config,
        };
        self.entries
            .write()
            .await
            .insert(instance_id.to_string(), entry);
        info!(instance_id = %instance_id, "failover configured");
        Ok(())
    }

    pub async fn remove(&self, instance_id: &str) -> RegistryResult<()> {
        self.entries
            .write()
            .await
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::not_found("failover config", instance_id))
    }

    /// Drop state for instances no longer in the store
    pub async fn prune_deregistered(&self) -> usize {
        let ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            if self.store.instance(&id).await.is_none()
                && self.entries.write().await.remove(&id).is_some()
            {
                removed += 1;
            }
        }
        removed
    }

    pub async fn get_config(&self, instance_id: &str) -> RegistryResult<FailoverConfig> {
        self.read_entry(instance_id, |e| e.config.clone()).await
    }

    pub async fn get_circuit_breaker(&self, instance_id: &str) -> RegistryResult<CircuitBreaker> {
        self.read_entry(instance_id, |e| e.breaker.clone()).await
    }

    pub async fn get_retry_state(&self, instance_id: &str) -> RegistryResult<RetryState> {
        self.read_entry(instance_id, |e| e.retry.clone()).await
    }

    async fn read_entry<T>(&self, instance_id: &str, f: impl FnOnce(&Entry) -> T) -> RegistryResult<T> {
        self.entries
            .read()
            .await
            .get(instance_id)
            .map(f)
            .ok_or_else(|| RegistryError::not_found("failover config", instance_id))
    }

    // =========================================================================
    // Call Gating
    // =========================================================================

    /// Whether a call to the instance is admitted now
    ///
    /// An expired Open breaker moves to HalfOpen and admits exactly one probe.
    pub async fn can_make_call(&self, instance_id: &str) -> bool {
        let now_ms = self.now_ms();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(instance_id) else {
            return true;
        };
        if !entry.guards_calls() {
            return true;
        }

        let breaker = &mut entry.breaker;
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now_ms < breaker.next_retry_ms {
                    return false;
                }
                breaker.state = CircuitState::HalfOpen;
                breaker.half_open_probe_granted = true;
                info!(instance_id = %instance_id, "circuit half-open");
                self.emit(
                    FailoverEventType::CircuitHalfOpen,
                    instance_id,
                    "recovery timeout elapsed, admitting probe".into(),
                );
                true
            }
            CircuitState::HalfOpen => {
                if breaker.half_open_probe_granted {
                    false
                } else {
                    breaker.half_open_probe_granted = true;
                    true
                }
            }
        }
    }

    /// `can_make_call` as a `Result`
    pub async fn ensure_call_permitted(&self, instance_id: &str) -> RegistryResult<()> {
        if self.can_make_call(instance_id).await {
            return Ok(());
        }
        let retry_at_ms = self
            .entries
            .read()
            .await
            .get(instance_id)
            .map_or(0, |e| e.breaker.next_retry_ms);
        Err(RegistryError::CircuitOpen {
            instance_id: instance_id.to_string(),
            retry_at_ms,
        })
    }

    /// Feed one call outcome into the breaker and, if attached, metrics
    pub async fn record_service_call(&self, instance_id: &str, success: bool, duration: Duration) {
        if let Some(metrics) = &self.metrics {
            let name = match self.store.instance(instance_id).await {
                Some(instance) => instance.name().to_string(),
                None => instance_id.to_string(),
            };
            metrics.record_call(instance_id, &name, success, duration).await;
        }

        let now_ms = self.now_ms();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(instance_id) else {
            return;
        };
        if !entry.guards_calls() {
            return;
        }

        let breaker = &mut entry.breaker;
        if success {
            match breaker.state {
                CircuitState::Closed => breaker.failure_count = 0,
                CircuitState::HalfOpen => {
                    breaker.close();
                    info!(instance_id = %instance_id, "circuit closed");
                    self.emit(
                        FailoverEventType::CircuitClosed,
                        instance_id,
                        "half-open probe succeeded".into(),
                    );
                    self.emit(
                        FailoverEventType::ServiceRecovered,
                        instance_id,
                        "service recovered".into(),
                    );
                }
                CircuitState::Open => {}
            }
            return;
        }

        breaker.failure_count = breaker.failure_count.saturating_add(1);
        breaker.last_failure_ms = Some(now_ms);
        match breaker.state {
            CircuitState::Closed if breaker.failure_count >= breaker.failure_threshold => {
                breaker.open(now_ms);
                warn!(
                    instance_id = %instance_id,
                    failures = breaker.failure_count,
                    retry_at_ms = breaker.next_retry_ms,
                    "circuit opened"
                );
                self.emit(
                    FailoverEventType::CircuitOpened,
                    instance_id,
                    format!("{} consecutive failures", breaker.failure_count),
                );
                self.emit(
                    FailoverEventType::ServiceFailed,
                    instance_id,
                    "failure threshold reached".into(),
                );
            }
            CircuitState::HalfOpen => {
                breaker.open(now_ms);
                warn!(instance_id = %instance_id, "half-open probe failed, circuit reopened");
                self.emit(
                    FailoverEventType::CircuitOpened,
                    instance_id,
                    "half-open probe failed".into(),
                );
            }
            _ => {}
        }
    }

    /// Operator override of a breaker's state
    pub async fn update_circuit_breaker_state(
        &self,
        instance_id: &str,
        state: CircuitState,
    ) -> RegistryResult<()> {
        let now_ms = self.now_ms();
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(instance_id)
            .ok_or_else(|| RegistryError::not_found("failover config", instance_id))?;
        let event_type = match state {
            CircuitState::Closed => {
                entry.breaker.close();
                FailoverEventType::CircuitClosed
            }
            CircuitState::Open => {
                entry.breaker.open(now_ms);
                FailoverEventType::CircuitOpened
            }
            CircuitState::HalfOpen => {
                entry.breaker.state = CircuitState::HalfOpen;
                entry.breaker.half_open_probe_granted = false;
                FailoverEventType::CircuitHalfOpen
            }
        };
        info!(instance_id = %instance_id, state = %state, "circuit state forced");
        self.emit(event_type, instance_id, format!("state set to {}", state));
        Ok(())
    }

    // =========================================================================
    // Recovery and Failover
    // =========================================================================

    /// Probe a failed instance once, honoring retry limits and backoff
    pub async fn attempt_recovery(&self, instance_id: &str) -> RegistryResult<FailoverResult> {
        let now_ms = self.now_ms();
        let _guard = {
            let entries = self.entries.write().await;
            let entry = entries
                .get(instance_id)
                .ok_or_else(|| RegistryError::not_found("failover config", instance_id))?;
            if entry.retry.attempts >= entry.config.max_retries {
                let attempts = entry.retry.attempts;
                drop(entries);
                warn!(instance_id = %instance_id, attempts, "retries exhausted");
                self.emit(
                    FailoverEventType::RetryExhausted,
                    instance_id,
                    format!("gave up after {} attempts", attempts),
                );
                return Err(RegistryError::RetryExhausted {
                    instance_id: instance_id.to_string(),
                    attempts,
                });
            }
            if now_ms < entry.retry.next_retry_ms {
                return Err(RegistryError::unavailable(format!(
                    "retry not due for {} until {}ms",
                    instance_id, entry.retry.next_retry_ms
                )));
            }
            let guard = RecoveryGuard::acquire(&entry.recovering).ok_or_else(|| {
                RegistryError::unavailable(format!("recovery already running for {}", instance_id))
            })?;
            guard
        };

        let (healthy, reason) = self.probe(instance_id).await;

        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(instance_id)
            .ok_or_else(|| RegistryError::not_found("failover config", instance_id))?;
        let mut metadata = HashMap::new();

        if healthy {
            entry.retry = RetryState::default();
            let was_closed = entry.breaker.state == CircuitState::Closed;
            entry.breaker.close();
            drop(entries);

            info!(instance_id = %instance_id, "service recovered");
            if !was_closed {
                self.emit(
                    FailoverEventType::CircuitClosed,
                    instance_id,
                    "recovery probe succeeded".into(),
                );
            }
            self.emit(
                FailoverEventType::ServiceRecovered,
                instance_id,
                "recovery probe succeeded".into(),
            );
            return Ok(FailoverResult {
                success: true,
                original_id: instance_id.to_string(),
                failover_id: None,
                reason: "service recovered".into(),
                timestamp_ms: now_ms,
                metadata,
            });
        }

        entry.retry.attempts += 1;
        entry.retry.last_attempt_ms = Some(now_ms);
        entry.retry.current_delay_ms = backoff_delay_ms(&entry.config, entry.retry.attempts);
        entry.retry.next_retry_ms = now_ms + entry.retry.current_delay_ms;
        entry.breaker.failure_count = entry.breaker.failure_count.saturating_add(1);
        entry.breaker.last_failure_ms = Some(now_ms);

        metadata.insert("attempts".into(), json!(entry.retry.attempts));
        metadata.insert("next_retry_ms".into(), json!(entry.retry.next_retry_ms));
        metadata.insert("delay_ms".into(), json!(entry.retry.current_delay_ms));
        debug!(
            instance_id = %instance_id,
            attempts = entry.retry.attempts,
            delay_ms = entry.retry.current_delay_ms,
            "recovery attempt failed"
        );

        Ok(FailoverResult {
            success: false,
            original_id: instance_id.to_string(),
            failover_id: None,
            reason,
            timestamp_ms: now_ms,
            metadata,
        })
    }

    async fn probe(&self, instance_id: &str) -> (bool, String) {
        if let Some(health) = &self.health {
            match health.check_health(instance_id).await {
                Ok(HealthCheckOutcome::Passed) => return (true, String::new()),
                Ok(HealthCheckOutcome::Failed { reason }) => return (false, reason),
                Ok(HealthCheckOutcome::Skipped) => {}
                Err(e) => return (false, e.to_string()),
            }
        }
        match self.store.instance(instance_id).await {
            Some(instance) if instance.is_healthy().await => (true, String::new()),
            Some(instance) => (false, format!("instance is {}", instance.health().await)),
            None => (false, "instance not registered".into()),
        }
    }

    /// Pick a healthy replacement for a failed instance
    ///
    /// No alternative is reported as an unsuccessful result.
    pub async fn attempt_failover(
        &self,
        service_name: &str,
        failed_id: &str,
    ) -> RegistryResult<FailoverResult> {
        let now_ms = self.now_ms();
        let candidates: Vec<String> = self
            .store
            .healthy_instances(service_name)
            .await
            .into_iter()
            .map(|i| i.id().to_string())
            .filter(|id| id != failed_id)
            .collect();

        let alternatives_count = candidates.len();
        let admitted: Vec<String> = {
            let entries = self.entries.read().await;
            candidates
                .into_iter()
                .filter(|id| {
                    entries
                        .get(id)
                        .map_or(true, |e| !e.guards_calls() || e.breaker.would_admit(now_ms))
                })
                .collect()
        };

        let mut metadata = HashMap::new();
        metadata.insert("alternatives_count".into(), json!(alternatives_count));
        metadata.insert("admitted_count".into(), json!(admitted.len()));

        let mut chosen = None;
        for id in &admitted {
            if self.can_make_call(id).await {
                chosen = Some(id.clone());
                break;
            }
        }

        let Some(failover_id) = chosen else {
            warn!(service_name = %service_name, failed_id = %failed_id, "no failover target");
            return Ok(FailoverResult {
                success: false,
                original_id: failed_id.to_string(),
                failover_id: None,
                reason: "no healthy alternatives".into(),
                timestamp_ms: now_ms,
                metadata,
            });
        };

        self.failovers_triggered.fetch_add(1, Ordering::Relaxed);
        info!(
            service_name = %service_name,
            failed_id = %failed_id,
            failover_id = %failover_id,
            "failover triggered"
        );
        self.emit(
            FailoverEventType::FailoverTriggered,
            failed_id,
            format!("traffic moved to {}", failover_id),
        );
        Ok(FailoverResult {
            success: true,
            original_id: failed_id.to_string(),
            failover_id: Some(failover_id),
            reason: "failed over to healthy instance".into(),
            timestamp_ms: now_ms,
            metadata,
        })
    }

    pub async fn statistics(&self) -> FailoverStatistics {
        let entries = self.entries.read().await;
        let mut breakers_by_state = HashMap::new();
        let mut instances_in_retry = 0;
        let mut total_failures = 0;
        for entry in entries.values() {
            *breakers_by_state.entry(entry.breaker.state).or_insert(0) += 1;
            if entry.retry.attempts > 0 {
                instances_in_retry += 1;
            }
            total_failures += u64::from(entry.breaker.failure_count);
        }
        FailoverStatistics {
            configured_instances: entries.len(),
            breakers_by_state,
            instances_in_retry,
            total_failures,
            failovers_triggered: self.failovers_triggered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::service::{HealthState, ServiceDescriptor};
    use beacon_core::config::{MetricsConfig, RegistryConfig};
    use beacon_core::io::{IoContext, ManualClock};

    async fn setup() -> (Arc<ManualClock>, Arc<ServiceStore>, FailoverManager) {
        let clock = Arc::new(ManualClock::new(10_000));
        let io = IoContext::manual(clock.clone(), 1);
        let store = Arc::new(ServiceStore::with_io(RegistryConfig::default(), io));
        for id in ["a", "b", "c"] {
            store
                .register(ServiceDescriptor::new(id, "api", "127.0.0.1", 8080))
                .await
                .unwrap();
        }
        let manager = FailoverManager::new(store.clone());
        (clock, store, manager)
    }

    fn config(threshold: u32) -> FailoverConfig {
        FailoverConfig {
            failure_threshold: threshold,
            recovery_timeout_ms: 1_000,
            ..FailoverConfig::default()
        }
    }

    #[test]
    fn test_backoff() {
        let config = FailoverConfig {
            retry_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 1_000,
            ..FailoverConfig::default()
        };
        assert_eq!(backoff_delay_ms(&config, 1), 100);
        assert_eq!(backoff_delay_ms(&config, 2), 200);
        assert_eq!(backoff_delay_ms(&config, 3), 400);
        assert_eq!(backoff_delay_ms(&config, 5), 1_000);
        assert_eq!(backoff_delay_ms(&config, 200), 1_000);
    }

    #[tokio::test]
    async fn test_unconfigured_is_permitted() {
        let (_clock, _store, manager) = setup().await;
        assert!(manager.can_make_call("a").await);
        let err = manager.get_circuit_breaker("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_breaker_transitions() {
        let (clock, _store, manager) = setup().await;
        manager.configure("a", config(3)).await.unwrap();
        let mut events = manager.subscribe_events();

        for _ in 0..2 {
            manager.record_service_call("a", false, Duration::from_millis(5)).await;
        }
        assert_eq!(
            manager.get_circuit_breaker("a").await.unwrap().state,
            CircuitState::Closed
        );

        manager.record_service_call("a", false, Duration::from_millis(5)).await;
        let breaker = manager.get_circuit_breaker("a").await.unwrap();
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.next_retry_ms, 11_000);
        assert!(!manager.can_make_call("a").await);
        assert_eq!(
            manager.ensure_call_permitted("a").await.unwrap_err().kind(),
            ErrorKind::CircuitOpen
        );

        clock.advance_ms(1_000);
        assert!(manager.can_make_call("a").await);
        assert_eq!(
            manager.get_circuit_breaker("a").await.unwrap().state,
            CircuitState::HalfOpen
        );
        assert!(!manager.can_make_call("a").await);

        manager.record_service_call("a", true, Duration::from_millis(5)).await;
        let breaker = manager.get_circuit_breaker("a").await.unwrap();
        assert_eq!(breaker.state, CircuitState::Closed);
        assert_eq!(breaker.failure_count, 0);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.event_type);
        }
        assert_eq!(
            seen,
            vec![
                FailoverEventType::CircuitOpened,
                FailoverEventType::ServiceFailed,
                FailoverEventType::CircuitHalfOpen,
                FailoverEventType::CircuitClosed,
                FailoverEventType::ServiceRecovered,
            ]
        );
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (clock, _store, manager) = setup().await;
        manager.configure("a", config(1)).await.unwrap();
        manager.record_service_call("a", false, Duration::ZERO).await;
        clock.advance_ms(1_000);
        assert!(manager.can_make_call("a").await);

        manager.record_service_call("a", false, Duration::ZERO).await;
        let breaker = manager.get_circuit_breaker("a").await.unwrap();
        assert_eq!(breaker.state, CircuitState::Open);
        assert_eq!(breaker.next_retry_ms, 12_000);
    }

    #[tokio::test]
    async fn test_success_resets_failures_when_closed() {
        let (_clock, _store, manager) = setup().await;
        manager.configure("a", config(3)).await.unwrap();
        manager.record_service_call("a", false, Duration::ZERO).await;
        manager.record_service_call("a", false, Duration::ZERO).await;
        manager.record_service_call("a", true, Duration::ZERO).await;
        manager.record_service_call("a", false, Duration::ZERO).await;
        assert_eq!(
            manager.get_circuit_breaker("a").await.unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_disabled_breaker_always_admits() {
        let (_clock, _store, manager) = setup().await;
        let config = FailoverConfig {
            circuit_breaker_enabled: false,
            failure_threshold: 1,
            ..FailoverConfig::default()
        };
        manager.configure("a", config).await.unwrap();
        manager.record_service_call("a", false, Duration::ZERO).await;
        assert!(manager.can_make_call("a").await);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (_clock, _store, manager) = setup().await;
        let err = manager.configure("a", config(0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_force_state() {
        let (_clock, _store, manager) = setup().await;
        manager.configure("a", config(5)).await.unwrap();
        manager
            .update_circuit_breaker_state("a", CircuitState::Open)
            .await
            .unwrap();
        assert!(!manager.can_make_call("a").await);
        manager
            .update_circuit_breaker_state("a", CircuitState::Closed)
            .await
            .unwrap();
        assert!(manager.can_make_call("a").await);
        assert!(manager
            .update_circuit_breaker_state("zz", CircuitState::Open)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_recovery_backoff_and_exhaustion() {
        let (clock, store, manager) = setup().await;
        let config = FailoverConfig {
            max_retries: 2,
            retry_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 10_000,
            ..FailoverConfig::default()
        };
        manager.configure("a", config).await.unwrap();
        store.set_health_state("a", HealthState::Unhealthy).await.unwrap();

        let first = manager.attempt_recovery("a").await.unwrap();
        assert!(!first.success);
        let retry = manager.get_retry_state("a").await.unwrap();
        assert_eq!(retry.attempts, 1);
        assert_eq!(retry.next_retry_ms, 10_100);

        let err = manager.attempt_recovery("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        clock.advance_ms(100);
        manager.attempt_recovery("a").await.unwrap();
        let retry = manager.get_retry_state("a").await.unwrap();
        assert_eq!(retry.attempts, 2);
        assert_eq!(retry.current_delay_ms, 200);

        clock.advance_ms(1_000);
        let err = manager.attempt_recovery("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
    }

    #[tokio::test]
    async fn test_recovery_success_resets() {
        let (clock, store, manager) = setup().await;
        manager.configure("a", config(1)).await.unwrap();
        store.set_health_state("a", HealthState::Unhealthy).await.unwrap();
        manager.record_service_call("a", false, Duration::ZERO).await;
        manager.attempt_recovery("a").await.unwrap();

        store.set_health_state("a", HealthState::Healthy).await.unwrap();
        clock.advance_ms(FailoverConfig::default().retry_delay_ms);

        let result = manager.attempt_recovery("a").await.unwrap();
        assert!(result.success);
        assert_eq!(manager.get_retry_state("a").await.unwrap(), RetryState::default());
        assert_eq!(
            manager.get_circuit_breaker("a").await.unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_recovery_runs_once_at_a_time() {
        let (_clock, store, manager) = setup().await;
        manager.configure("a", config(1)).await.unwrap();
        store.set_health_state("a", HealthState::Unhealthy).await.unwrap();

        let flag = manager.entries.read().await["a"].recovering.clone();
        let held = RecoveryGuard::acquire(&flag).unwrap();
        let err = manager.attempt_recovery("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(manager.get_retry_state("a").await.unwrap().attempts, 0);

        drop(held);
        let result = manager.attempt_recovery("a").await.unwrap();
        assert!(!result.success);
        assert_eq!(manager.get_retry_state("a").await.unwrap().attempts, 1);
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_attempt_failover() {
        let (_clock, store, manager) = setup().await;
        manager.configure("b", config(1)).await.unwrap();
        manager.record_service_call("b", false, Duration::ZERO).await;

        let result = manager.attempt_failover("api", "a").await.unwrap();
        assert!(result.success);
        assert_eq!(result.failover_id.as_deref(), Some("c"));
        assert_eq!(result.metadata["alternatives_count"], json!(2));
        assert_eq!(result.metadata["admitted_count"], json!(1));

        store.set_health_state("c", HealthState::Unhealthy).await.unwrap();
        let result = manager.attempt_failover("api", "a").await.unwrap();
        assert!(!result.success);
        assert!(result.failover_id.is_none());
    }

    #[tokio::test]
    async fn test_metrics_forwarding_and_statistics() {
        let (_clock, store, manager) = setup().await;
        let metrics = Arc::new(MetricsManager::new(MetricsConfig::default(), store.io().clone()));
        let manager = manager.with_metrics(metrics.clone());
        manager.configure("a", config(1)).await.unwrap();
        manager.record_service_call("a", false, Duration::from_millis(10)).await;

        let m = metrics.get_metrics("a").await.unwrap();
        assert_eq!(m.service_name, "api");
        assert_eq!(m.failed_requests, 1);

        let stats = manager.statistics().await;
        assert_eq!(stats.configured_instances, 1);
        assert_eq!(stats.breakers_by_state[&CircuitState::Open], 1);
        assert_eq!(stats.total_failures, 1);

        manager.remove("a").await.unwrap();
        assert!(manager.remove("a").await.is_err());
    }
}
