//! Health checker
//!
//! TigerStyle: Probes never block the loop. Each tick spawns at most one
//! probe per instance and returns; stop waits a bounded time, then aborts.

use crate::error::RegistryResult;
use crate::service::{HealthCheckSpec, HealthProtocol, ServiceDescriptor};
use crate::store::ServiceStore;
use crate::task::{PeriodicTask, StopOutcome};
use beacon_core::config::HealthConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of an on-demand check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    Passed,
    Failed { reason: String },
    /// Instance has no enabled health check
    Skipped,
}

// =============================================================================
// Probe Ledger
// =============================================================================

/// Which instances have a probe in flight and when each was last started
#[derive(Debug, Default)]
struct ProbeLedger {
    in_flight: HashSet<String>,
    last_started_ms: HashMap<String, u64>,
}

type SharedLedger = Arc<StdMutex<ProbeLedger>>;

/// Clears the in-flight mark when the probe finishes or is aborted
struct InFlightGuard {
    ledger: SharedLedger,
    service_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.in_flight.remove(&self.service_id);
    }
}

// =============================================================================
// Checker
// =============================================================================

struct Inner {
    store: Arc<ServiceStore>,
    config: HealthConfig,
    client: reqwest::Client,
    probes: Mutex<JoinSet<()>>,
    ledger: SharedLedger,
}

/// Periodically probes every instance with an enabled health check
pub struct HealthChecker {
    inner: Arc<Inner>,
    task: Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new(store: Arc<ServiceStore>, config: HealthConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                client: reqwest::Client::new(),
                probes: Mutex::new(JoinSet::new()),
                ledger: Arc::new(StdMutex::new(ProbeLedger::default())),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Start the probe loop; a no-op when already running
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(PeriodicTask::is_running) {
            debug!("health checker already running");
            return;
        }

        let inner = self.inner.clone();
        let interval = Duration::from_millis(self.inner.config.interval_ms);
        *task = Some(PeriodicTask::spawn("health-checker", interval, move || {
            let inner = inner.clone();
            async move { inner.tick().await }
        }));
        info!(interval_ms = self.inner.config.interval_ms, "health checker started");
    }

    /// Stop the loop and all in-flight probes within `stop_grace_ms`
    pub async fn stop(&self) -> StopOutcome {
        let Some(mut task) = self.task.lock().await.take() else {
            return StopOutcome::NotRunning;
        };

        let grace = Duration::from_millis(self.inner.config.stop_grace_ms);
        let deadline = Instant::now() + grace;
        let mut outcome = task.stop(grace).await;

        let mut probes = self.inner.probes.lock().await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = tokio::time::timeout(remaining, async {
            while probes.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pending = probes.len(), "aborting in-flight health probes");
            probes.abort_all();
            while probes.join_next().await.is_some() {}
            outcome = StopOutcome::Aborted;
        }

        info!(outcome = ?outcome, "health checker stopped");
        outcome
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(PeriodicTask::is_running)
    }

    /// Probe one instance now and apply the outcome
    pub async fn check_health(&self, service_id: &str) -> RegistryResult<HealthCheckOutcome> {
        let instance = self.inner.store.require_instance(service_id).await?;
        let descriptor = instance.descriptor().await;
        let Some(spec) = descriptor.health_check.clone().filter(|s| s.enabled) else {
            return Ok(HealthCheckOutcome::Skipped);
        };
        self.inner.run_probe(&descriptor, &spec).await
    }
}

impl Inner {
    async fn tick(self: Arc<Self>) {
        let now_ms = self.store.io().now_ms();
        let instances = self.store.all_instances().await;

        let mut due = Vec::new();
        let mut live_ids = HashSet::with_capacity(instances.len());
        for instance in instances {
            let descriptor = instance.descriptor().await;
            live_ids.insert(descriptor.id.clone());
            if let Some(spec) = descriptor.health_check.clone().filter(|s| s.enabled) {
                due.push((descriptor, spec));
            }
        }

        let mut scheduled = Vec::with_capacity(due.len());
        {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.last_started_ms.retain(|id, _| live_ids.contains(id));
            for (descriptor, spec) in due {
                if ledger.in_flight.contains(&descriptor.id) {
                    continue;
                }
                let not_yet_due = ledger
                    .last_started_ms
                    .get(&descriptor.id)
                    .is_some_and(|last| now_ms.saturating_sub(*last) < spec.interval_ms);
                if not_yet_due {
                    continue;
                }
                ledger.in_flight.insert(descriptor.id.clone());
                ledger.last_started_ms.insert(descriptor.id.clone(), now_ms);
                scheduled.push((descriptor, spec));
            }
        }

        let mut probes = self.probes.lock().await;
        while let Some(finished) = probes.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    warn!(error = %e, "health probe panicked");
                }
            }
        }

        if !scheduled.is_empty() {
            debug!(count = scheduled.len(), "spawning health probes");
        }
        for (descriptor, spec) in scheduled {
            let guard = InFlightGuard {
                ledger: self.ledger.clone(),
                service_id: descriptor.id.clone(),
            };
            let inner = self.clone();
            probes.spawn(async move {
                let _guard = guard;
                if let Err(e) = inner.run_probe(&descriptor, &spec).await {
                    // Deregistered while the probe was running.
                    debug!(service_id = %descriptor.id, error = %e, "probe result discarded");
                }
            });
        }
    }

    async fn run_probe(
        &self,
        descriptor: &ServiceDescriptor,
        spec: &HealthCheckSpec,
    ) -> RegistryResult<HealthCheckOutcome> {
        let timeout_ms = if spec.timeout_ms == 0 {
            self.config.probe_timeout_ms_default
        } else {
            spec.timeout_ms
        };
        let threshold = if spec.failure_threshold == 0 {
            self.config.failure_threshold_default
        } else {
            spec.failure_threshold
        };

        let result = probe(&self.client, spec, descriptor, Duration::from_millis(timeout_ms)).await;
        match result {
            Ok(()) => {
                self.store
                    .record_probe_result(&descriptor.id, true, threshold, None)
                    .await?;
                Ok(HealthCheckOutcome::Passed)
            }
            Err(reason) => {
                debug!(service_id = %descriptor.id, reason = %reason, "health probe failed");
                self.store
                    .record_probe_result(&descriptor.id, false, threshold, Some(&reason))
                    .await?;
                Ok(HealthCheckOutcome::Failed { reason })
            }
        }
    }
}

// =============================================================================
// Probes
// =============================================================================

/// Run one probe; the error carries a human-readable reason
async fn probe(
    client: &reqwest::Client,
    spec: &HealthCheckSpec,
    descriptor: &ServiceDescriptor,
    timeout: Duration,
) -> Result<(), String> {
    let target = spec.target(&descriptor.address, descriptor.port);
    match spec.protocol {
        HealthProtocol::Http => probe_http(client, &spec.http_method, &target, timeout).await,
        // gRPC health is checked as TCP reachability.
        HealthProtocol::Tcp | HealthProtocol::Grpc => probe_tcp(&target, timeout).await,
    }
}

async fn probe_http(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    timeout: Duration,
) -> Result<(), String> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid http method: {}", method))?;
    let response = client
        .request(method, url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                format!("timed out after {}ms", timeout.as_millis())
            } else {
                format!("request failed: {}", e)
            }
        })?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(format!("unexpected status {}", status.as_u16()))
    }
}

async fn probe_tcp(target: &str, timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(format!("connect to {} failed: {}", target, e)),
        Err(_) => Err(format!("connect to {} timed out after {}ms", target, timeout.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::service::HealthState;
    use beacon_core::config::RegistryConfig;
    use tokio::net::TcpListener;

    fn setup(config: HealthConfig) -> (Arc<ServiceStore>, HealthChecker) {
        let store = Arc::new(ServiceStore::new(RegistryConfig::default()));
        let checker = HealthChecker::new(store.clone(), config);
        (store, checker)
    }

    fn fast_config() -> HealthConfig {
        HealthConfig {
            interval_ms: 20,
            probe_timeout_ms_default: 500,
            stop_grace_ms: 500,
            ..HealthConfig::default()
        }
    }

    async fn wait_for_state(store: &ServiceStore, id: &str, state: HealthState) -> bool {
        for _ in 0..200 {
            if store.get_service(id).await.map(|s| s.health).ok() == Some(state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_http_probe_passes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;

        let (store, checker) = setup(fast_config());
        let spec = HealthCheckSpec::http(Some(format!("{}/health", server.url())));
        store
            .register(ServiceDescriptor::new("svc-1", "api", "127.0.0.1", 8080).with_health_check(spec))
            .await
            .unwrap();

        let outcome = checker.check_health("svc-1").await.unwrap();
        assert_eq!(outcome, HealthCheckOutcome::Passed);
        let snapshot = store.get_service("svc-1").await.unwrap();
        assert_eq!(snapshot.health, HealthState::Healthy);
        assert!(snapshot.last_healthy_ms.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_probe_fails_on_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let (store, checker) = setup(fast_config());
        let spec = HealthCheckSpec::http(Some(format!("{}/health", server.url())))
            .with_failure_threshold(2);
        store
            .register(ServiceDescriptor::new("svc-1", "api", "127.0.0.1", 8080).with_health_check(spec))
            .await
            .unwrap();

        let outcome = checker.check_health("svc-1").await.unwrap();
        assert!(matches!(outcome, HealthCheckOutcome::Failed { ref reason } if reason.contains("503")));
        let snapshot = store.get_service("svc-1").await.unwrap();
        assert_eq!(snapshot.health, HealthState::Registered);
        assert_eq!(snapshot.consecutive_failures, 1);

        checker.check_health("svc-1").await.unwrap();
        let snapshot = store.get_service("svc-1").await.unwrap();
        assert_eq!(snapshot.health, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_http_probe_uses_configured_method() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("HEAD", "/ping")
            .with_status(204)
            .create_async()
            .await;

        let (store, checker) = setup(fast_config());
        let spec = HealthCheckSpec::http(Some(format!("{}/ping", server.url()))).with_method("head");
        store
            .register(ServiceDescriptor::new("svc-1", "api", "127.0.0.1", 8080).with_health_check(spec))
            .await
            .unwrap();

        assert_eq!(
            checker.check_health("svc-1").await.unwrap(),
            HealthCheckOutcome::Passed
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (store, checker) = setup(fast_config());
        store
            .register(
                ServiceDescriptor::new("svc-1", "api", "127.0.0.1", port)
                    .with_health_check(HealthCheckSpec::tcp()),
            )
            .await
            .unwrap();
        assert_eq!(
            checker.check_health("svc-1").await.unwrap(),
            HealthCheckOutcome::Passed
        );

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);
        store
            .register(
                ServiceDescriptor::new("svc-2", "api", "127.0.0.1", closed_port)
                    .with_health_check(HealthCheckSpec::grpc().with_failure_threshold(1)),
            )
            .await
            .unwrap();
        let outcome = checker.check_health("svc-2").await.unwrap();
        assert!(matches!(outcome, HealthCheckOutcome::Failed { .. }));
        assert_eq!(
            store.get_service("svc-2").await.unwrap().health,
            HealthState::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_check_health_skipped_and_missing() {
        let (store, checker) = setup(fast_config());
        store
            .register(ServiceDescriptor::new("svc-1", "api", "127.0.0.1", 8080))
            .await
            .unwrap();
        assert_eq!(
            checker.check_health("svc-1").await.unwrap(),
            HealthCheckOutcome::Skipped
        );
        let err = checker.check_health("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_loop_marks_healthy_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (store, checker) = setup(fast_config());
        store
            .register(
                ServiceDescriptor::new("svc-1", "api", "127.0.0.1", port)
                    .with_health_check(HealthCheckSpec::tcp().with_interval_ms(0)),
            )
            .await
            .unwrap();

        checker.start().await;
        checker.start().await;
        assert!(checker.is_running().await);
        assert!(wait_for_state(&store, "svc-1", HealthState::Healthy).await);

        let outcome = checker.stop().await;
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(!checker.is_running().await);
        assert_eq!(checker.stop().await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_loop_marks_unhealthy() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let (store, checker) = setup(fast_config());
        store
            .register(
                ServiceDescriptor::new("svc-1", "api", "127.0.0.1", port).with_health_check(
                    HealthCheckSpec::tcp()
                        .with_interval_ms(0)
                        .with_failure_threshold(2),
                ),
            )
            .await
            .unwrap();

        checker.start().await;
        assert!(wait_for_state(&store, "svc-1", HealthState::Unhealthy).await);
        checker.stop().await;
    }
}
