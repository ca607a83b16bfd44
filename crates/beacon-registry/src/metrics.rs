//! Call metrics and threshold alerts
//!
//! TigerStyle: Bounded alert history, alert handlers isolated from panics
//! and detached from the recording path.

use crate::error::{RegistryError, RegistryResult};
use async_trait::async_trait;
use beacon_core::config::MetricsConfig;
use beacon_core::constants::RESPONSE_TIME_EMA_ALPHA;
use beacon_core::io::IoContext;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fmt::Write as _;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

// =============================================================================
// Metrics Types
// =============================================================================

/// Call statistics for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub service_id: String,
    pub service_name: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Exponential moving average
    pub average_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub last_request_ms: u64,
    pub uptime_ms: u64,
    /// Percentage in [0, 100]
    pub error_rate: f64,
    /// Requests per second since the manager started
    pub throughput: f64,
}

impl ServiceMetrics {
    fn new(service_id: &str, service_name: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            service_name: service_name.to_string(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_response_time_ms: 0.0,
            min_response_time_ms: 0.0,
            max_response_time_ms: 0.0,
            last_request_ms: 0,
            uptime_ms: 0,
            error_rate: 0.0,
            throughput: 0.0,
        }
    }

    fn record(&mut self, success: bool, duration_ms: f64, now_ms: u64, elapsed_ms: u64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.last_request_ms = now_ms;

        if self.total_requests == 1 {
            self.min_response_time_ms = duration_ms;
            self.max_response_time_ms = duration_ms;
            self.average_response_time_ms = duration_ms;
        } else {
            self.min_response_time_ms = self.min_response_time_ms.min(duration_ms);
            self.max_response_time_ms = self.max_response_time_ms.max(duration_ms);
            self.average_response_time_ms = RESPONSE_TIME_EMA_ALPHA * duration_ms
                + (1.0 - RESPONSE_TIME_EMA_ALPHA) * self.average_response_time_ms;
        }

        self.error_rate = error_rate(self.failed_requests, self.total_requests);
        self.throughput = throughput(self.total_requests, elapsed_ms);
        self.uptime_ms = elapsed_ms;
        debug_assert_eq!(
            self.successful_requests + self.failed_requests,
            self.total_requests
        );
    }
}

/// Metrics summed across every instance of a service name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub service_name: String,
    pub instance_count: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean of the instances' moving averages
    pub average_response_time_ms: f64,
    pub min_response_time_ms: f64,
    pub max_response_time_ms: f64,
    pub last_request_ms: u64,
    pub error_rate: f64,
    pub throughput: f64,
}

fn error_rate(failed: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        failed as f64 / total as f64 * 100.0
    }
}

fn throughput(total: u64, elapsed_ms: u64) -> f64 {
    total as f64 / (elapsed_ms.max(1) as f64 / 1000.0)
}

// =============================================================================
// Alert Types
// =============================================================================

/// Opt-in limits for one instance; `None` disables that check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub max_response_time_ms: Option<f64>,
    /// Percentage in [0, 100]
    pub max_error_rate: Option<f64>,
    /// Requests per second
    pub min_throughput: Option<f64>,
    pub enabled: bool,
}

impl AlertThresholds {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_max_response_time_ms(mut self, ms: f64) -> Self {
        self.max_response_time_ms = Some(ms);
        self
    }

    pub fn with_max_error_rate(mut self, percent: f64) -> Self {
        self.max_error_rate = Some(percent);
        self
    }

    pub fn with_min_throughput(mut self, per_second: f64) -> Self {
        self.min_throughput = Some(per_second);
        self
    }

    pub fn validate(&self) -> RegistryResult<()> {
        if let Some(rate) = self.max_error_rate {
            if !(0.0..=100.0).contains(&rate) {
                return Err(RegistryError::invalid_input(
                    "max_error_rate",
                    format!("{} is outside [0, 100]", rate),
                ));
            }
        }
        if let Some(ms) = self.max_response_time_ms {
            if ms.is_nan() || ms < 0.0 {
                return Err(RegistryError::invalid_input(
                    "max_response_time_ms",
                    "must be non-negative",
                ));
            }
        }
        if let Some(tps) = self.min_throughput {
            if tps.is_nan() || tps < 0.0 {
                return Err(RegistryError::invalid_input(
                    "min_throughput",
                    "must be non-negative",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HealthCheck,
    Performance,
    Availability,
    Dependency,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
    Suppressed,
}

/// A raised alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAlert {
    /// `{service_id}-{sequence}`
    pub id: String,
    pub service_id: String,
    pub service_name: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
    pub triggered_at_ms: u64,
    pub resolved_at_ms: Option<u64>,
    pub status: AlertStatus,
}

impl ServiceAlert {
    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

/// Receives alert lifecycle notifications
#[async_trait]
pub trait AlertHandler: Send + Sync {
    async fn on_alert(&self, alert: &ServiceAlert);

    async fn on_resolved(&self, _alert: &ServiceAlert) {}
}

/// Threshold metric that produced an alert, kept in `details["metric"]`
const METRIC_RESPONSE_TIME: &str = "response_time";
const METRIC_ERROR_RATE: &str = "error_rate";
const METRIC_THROUGHPUT: &str = "throughput";

struct Breach {
    metric: &'static str,
    alert_type: AlertType,
    severity: AlertSeverity,
    message: String,
    observed: f64,
    limit: f64,
}

// =============================================================================
// Export
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Prometheus,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "prometheus" => Ok(Self::Prometheus),
            "csv" => Ok(Self::Csv),
            _ => Err(RegistryError::unsupported("export format", s)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Prometheus => "prometheus",
            Self::Csv => "csv",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsStatistics {
    pub tracked_services: usize,
    pub total_requests: u64,
    pub total_failures: u64,
    pub overall_error_rate: f64,
    pub active_alerts: usize,
    pub total_alerts: usize,
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Debug, Default)]
struct AlertBook {
    by_id: HashMap<String, ServiceAlert>,
    /// Alert IDs, oldest first
    order: VecDeque<String>,
    next_sequence: u64,
}

/// Records call outcomes and raises threshold alerts
pub struct MetricsManager {
    config: MetricsConfig,
    io: IoContext,
    started_at_ms: u64,
    metrics: RwLock<HashMap<String, ServiceMetrics>>,
    thresholds: RwLock<HashMap<String, AlertThresholds>>,
    alerts: RwLock<AlertBook>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
}

impl fmt::Debug for MetricsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsManager")
            .field("config", &self.config)
            .field("started_at_ms", &self.started_at_ms)
            .finish_non_exhaustive()
    }
}

impl MetricsManager {
    pub fn new(config: MetricsConfig, io: IoContext) -> Self {
        let started_at_ms = io.now_ms();
        Self {
            config,
            io,
            started_at_ms,
            metrics: RwLock::new(HashMap::new()),
            thresholds: RwLock::new(HashMap::new()),
            alerts: RwLock::new(AlertBook::default()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms)
    }

    /// Record one call and evaluate the instance's thresholds
    pub async fn record_call(
        &self,
        service_id: &str,
        service_name: &str,
        success: bool,
        duration: Duration,
    ) -> ServiceMetrics {
        let now_ms = self.io.now_ms();
        let duration_ms = duration.as_micros() as f64 / 1000.0;

        let snapshot = {
            let mut metrics = self.metrics.write().await;
            let entry = metrics
                .entry(service_id.to_string())
                .or_insert_with(|| ServiceMetrics::new(service_id, service_name));
            entry.record(success, duration_ms, now_ms, self.elapsed_ms(now_ms));
            entry.clone()
        };

        debug!(
            service_id = %service_id,
            success,
            duration_ms,
            error_rate = snapshot.error_rate,
            "service call recorded"
        );

        self.evaluate_thresholds(&snapshot, duration_ms).await;
        snapshot
    }

    async fn evaluate_thresholds(&self, metrics: &ServiceMetrics, duration_ms: f64) {
        let Some(thresholds) = self
            .thresholds
            .read()
            .await
            .get(&metrics.service_id)
            .cloned()
            .filter(|t| t.enabled)
        else {
            return;
        };

        let mut breaches = Vec::new();
        let mut cleared = Vec::new();

        if let Some(limit) = thresholds.max_response_time_ms {
            if duration_ms > limit {
                breaches.push(Breach {
                    metric: METRIC_RESPONSE_TIME,
                    alert_type: AlertType::Performance,
                    severity: AlertSeverity::High,
                    message: format!(
                        "response time {:.1}ms exceeds threshold {:.1}ms",
                        duration_ms, limit
                    ),
                    observed: duration_ms,
                    limit,
                });
            } else {
                cleared.push(METRIC_RESPONSE_TIME);
            }
        }
        if let Some(limit) = thresholds.max_error_rate {
            if metrics.error_rate > limit {
                breaches.push(Breach {
                    metric: METRIC_ERROR_RATE,
                    alert_type: AlertType::Availability,
                    severity: AlertSeverity::Critical,
                    message: format!(
                        "error rate {:.2}% exceeds threshold {:.2}%",
                        metrics.error_rate, limit
                    ),
                    observed: metrics.error_rate,
                    limit,
                });
            } else {
                cleared.push(METRIC_ERROR_RATE);
            }
        }
        if let Some(limit) = thresholds.min_throughput {
            if metrics.throughput < limit {
                breaches.push(Breach {
                    metric: METRIC_THROUGHPUT,
                    alert_type: AlertType::Performance,
                    severity: AlertSeverity::Medium,
                    message: format!(
                        "throughput {:.2} req/s below threshold {:.2} req/s",
                        metrics.throughput, limit
                    ),
                    observed: metrics.throughput,
                    limit,
                });
            } else {
                cleared.push(METRIC_THROUGHPUT);
            }
        }

        for breach in breaches {
            let mut details = HashMap::new();
            details.insert("metric".to_string(), json!(breach.metric));
            details.insert(breach.metric.to_string(), json!(breach.observed));
            details.insert("threshold".to_string(), json!(breach.limit));
            self.raise(
                &metrics.service_id,
                &metrics.service_name,
                breach.alert_type,
                breach.severity,
                breach.message,
                details,
            )
            .await;
        }

        if self.config.auto_resolve_alerts && !cleared.is_empty() {
            self.auto_resolve(&metrics.service_id, &cleared).await;
        }
    }

    async fn auto_resolve(&self, service_id: &str, metrics: &[&str]) {
        let ids: Vec<String> = {
            let book = self.alerts.read().await;
            book.by_id
                .values()
                .filter(|a| a.is_active() && a.service_id == service_id)
                .filter(|a| {
                    a.details
                        .get("metric")
                        .and_then(|m| m.as_str())
                        .is_some_and(|m| metrics.contains(&m))
                })
                .map(|a| a.id.clone())
                .collect()
        };
        for id in ids {
            if let Ok(alert) = self.resolve_alert(&id).await {
                debug!(alert_id = %alert.id, "alert auto-resolved");
            }
        }
    }

    pub async fn set_thresholds(
        &self,
        service_id: &str,
        thresholds: AlertThresholds,
    ) -> RegistryResult<()> {
        thresholds.validate()?;
        self.thresholds
            .write()
            .await
            .insert(service_id.to_string(), thresholds);
        Ok(())
    }

    pub async fn get_thresholds(&self, service_id: &str) -> Option<AlertThresholds> {
        self.thresholds.read().await.get(service_id).cloned()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_metrics(&self, service_id: &str) -> RegistryResult<ServiceMetrics> {
        self.metrics
            .read()
            .await
            .get(service_id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("metrics", service_id))
    }

    /// Every tracked instance, ordered by ID
    pub async fn all_metrics(&self) -> Vec<ServiceMetrics> {
        let mut all: Vec<ServiceMetrics> = self.metrics.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        all
    }

    pub async fn aggregated_metrics(&self, service_name: &str) -> RegistryResult<AggregatedMetrics> {
        let instances: Vec<ServiceMetrics> = self
            .metrics
            .read()
            .await
            .values()
            .filter(|m| m.service_name == service_name)
            .cloned()
            .collect();
        if instances.is_empty() {
            return Err(RegistryError::not_found("metrics for service", service_name));
        }

        let mut total_requests = 0;
        let mut successful_requests = 0;
        let mut failed_requests = 0;
        let mut average_sum = 0.0;
        let mut min_response_time_ms = f64::MAX;
        let mut max_response_time_ms: f64 = 0.0;
        let mut last_request_ms = 0;
        for m in &instances {
            total_requests += m.total_requests;
            successful_requests += m.successful_requests;
            failed_requests += m.failed_requests;
            average_sum += m.average_response_time_ms;
            min_response_time_ms = min_response_time_ms.min(m.min_response_time_ms);
            max_response_time_ms = max_response_time_ms.max(m.max_response_time_ms);
            last_request_ms = last_request_ms.max(m.last_request_ms);
        }

        let now_ms = self.io.now_ms();
        Ok(AggregatedMetrics {
            service_name: service_name.to_string(),
            instance_count: instances.len(),
            total_requests,
            successful_requests,
            failed_requests,
            average_response_time_ms: average_sum / instances.len() as f64,
            min_response_time_ms,
            max_response_time_ms,
            last_request_ms,
            error_rate: error_rate(failed_requests, total_requests),
            throughput: throughput(total_requests, self.elapsed_ms(now_ms)),
        })
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    pub async fn add_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Raise an alert; every call creates a new one
    pub async fn create_alert(
        &self,
        service_id: &str,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        details: HashMap<String, serde_json::Value>,
    ) -> RegistryResult<ServiceAlert> {
        if service_id.is_empty() {
            return Err(RegistryError::invalid_input(
                "service_id",
                "alert needs a service ID",
            ));
        }
        let service_name = self
            .metrics
            .read()
            .await
            .get(service_id)
            .map(|m| m.service_name.clone())
            .unwrap_or_default();
        Ok(self
            .raise(service_id, &service_name, alert_type, severity, message.into(), details)
            .await)
    }

    async fn raise(
        &self,
        service_id: &str,
        service_name: &str,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: String,
        details: HashMap<String, serde_json::Value>,
    ) -> ServiceAlert {
        let now_ms = self.io.now_ms();
        let alert = {
            let mut book = self.alerts.write().await;
            book.next_sequence += 1;
            let alert = ServiceAlert {
                id: format!("{}-{}", service_id, book.next_sequence),
                service_id: service_id.to_string(),
                service_name: service_name.to_string(),
                alert_type,
                severity,
                message,
                details,
                triggered_at_ms: now_ms,
                resolved_at_ms: None,
                status: AlertStatus::Active,
            };
            book.order.push_back(alert.id.clone());
            book.by_id.insert(alert.id.clone(), alert.clone());
            while book.order.len() > self.config.alert_history_count_max {
                if let Some(oldest) = book.order.pop_front() {
                    book.by_id.remove(&oldest);
                }
            }
            debug_assert_eq!(book.order.len(), book.by_id.len());
            alert
        };

        warn!(
            alert_id = %alert.id,
            service_id = %service_id,
            severity = ?alert.severity,
            message = %alert.message,
            "alert raised"
        );
        self.notify(&alert, false).await;
        alert
    }

    /// Each handler runs on its own task so a slow handler never delays the caller
    async fn notify(&self, alert: &ServiceAlert, resolved: bool) {
        let handlers: Vec<Arc<dyn AlertHandler>> = self.handlers.read().await.clone();
        for handler in handlers {
            let alert = alert.clone();
            tokio::spawn(async move {
                let call = async {
                    if resolved {
                        handler.on_resolved(&alert).await
                    } else {
                        handler.on_alert(&alert).await
                    }
                };
                if AssertUnwindSafe(call).catch_unwind().await.is_err() {
                    error!(alert_id = %alert.id, "alert handler panicked");
                }
            });
        }
    }

    /// Resolve an Active alert
    pub async fn resolve_alert(&self, alert_id: &str) -> RegistryResult<ServiceAlert> {
        let alert = self.close_alert(alert_id, AlertStatus::Resolved).await?;
        info!(alert_id = %alert_id, "alert resolved");
        self.notify(&alert, true).await;
        Ok(alert)
    }

    /// Silence an Active alert without resolving it
    pub async fn suppress_alert(&self, alert_id: &str) -> RegistryResult<ServiceAlert> {
        let alert = self.close_alert(alert_id, AlertStatus::Suppressed).await?;
        info!(alert_id = %alert_id, "alert suppressed");
        Ok(alert)
    }

    async fn close_alert(&self, alert_id: &str, status: AlertStatus) -> RegistryResult<ServiceAlert> {
        let now_ms = self.io.now_ms();
        let mut book = self.alerts.write().await;
        let alert = book
            .by_id
            .get_mut(alert_id)
            .filter(|a| a.is_active())
            .ok_or_else(|| RegistryError::not_found("active alert", alert_id))?;
        alert.status = status;
        alert.resolved_at_ms = Some(now_ms);
        Ok(alert.clone())
    }

    /// Active alerts, optionally for one instance, oldest first
    pub async fn active_alerts(&self, service_id: Option<&str>) -> Vec<ServiceAlert> {
        let book = self.alerts.read().await;
        book.order
            .iter()
            .filter_map(|id| book.by_id.get(id))
            .filter(|a| a.is_active())
            .filter(|a| service_id.map_or(true, |id| a.service_id == id))
            .cloned()
            .collect()
    }

    /// Alerts triggered within `[since_ms, until_ms]`, oldest first
    pub async fn alert_history(&self, since_ms: u64, until_ms: u64) -> Vec<ServiceAlert> {
        let book = self.alerts.read().await;
        book.order
            .iter()
            .filter_map(|id| book.by_id.get(id))
            .filter(|a| a.triggered_at_ms >= since_ms && a.triggered_at_ms <= until_ms)
            .cloned()
            .collect()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub async fn statistics(&self) -> MetricsStatistics {
        let (tracked_services, total_requests, total_failures) = {
            let metrics = self.metrics.read().await;
            let requests = metrics.values().map(|m| m.total_requests).sum();
            let failures = metrics.values().map(|m| m.failed_requests).sum();
            (metrics.len(), requests, failures)
        };
        let book = self.alerts.read().await;
        MetricsStatistics {
            tracked_services,
            total_requests,
            total_failures,
            overall_error_rate: error_rate(total_failures, total_requests),
            active_alerts: book.by_id.values().filter(|a| a.is_active()).count(),
            total_alerts: book.by_id.len(),
        }
    }

    /// Drop metrics idle past `retention` and closed alerts older than it
    pub async fn cleanup(&self, retention: Duration) -> usize {
        let cutoff = self
            .io
            .now_ms()
            .saturating_sub(retention.as_millis() as u64);

        let metrics_removed = {
            let mut metrics = self.metrics.write().await;
            let before = metrics.len();
            metrics.retain(|_, m| m.last_request_ms >= cutoff);
            before - metrics.len()
        };

        let alerts_removed = {
            let mut book = self.alerts.write().await;
            let before = book.by_id.len();
            book.by_id.retain(|_, a| {
                a.is_active() || a.resolved_at_ms.unwrap_or(a.triggered_at_ms) >= cutoff
            });
            let AlertBook { by_id, order, .. } = &mut *book;
            order.retain(|id| by_id.contains_key(id));
            before - by_id.len()
        };

        if metrics_removed + alerts_removed > 0 {
            info!(metrics_removed, alerts_removed, "metrics cleanup completed");
        }
        metrics_removed + alerts_removed
    }

    pub async fn export(&self, format: ExportFormat) -> RegistryResult<String> {
        let metrics = self.all_metrics().await;
        let now_ms = self.io.now_ms();
        match format {
            ExportFormat::Json => {
                let document = json!({
                    "generated_at": format_timestamp(now_ms),
                    "uptime_ms": self.elapsed_ms(now_ms),
                    "services": metrics,
                });
                serde_json::to_string_pretty(&document)
                    .map_err(|e| RegistryError::invalid_input("metrics", e.to_string()))
            }
            ExportFormat::Prometheus => Ok(render_prometheus(&metrics)),
            ExportFormat::Csv => Ok(render_csv(&metrics)),
        }
    }
}

fn format_timestamp(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn render_prometheus(metrics: &[ServiceMetrics]) -> String {
    type Field = fn(&ServiceMetrics) -> f64;
    let families: [(&str, &str, &str, Field); 6] = [
        ("beacon_service_requests_total", "counter", "Total calls recorded", |m| {
            m.total_requests as f64
        }),
        ("beacon_service_requests_failed_total", "counter", "Failed calls recorded", |m| {
            m.failed_requests as f64
        }),
        ("beacon_service_response_time_ms", "gauge", "Moving average response time", |m| {
            m.average_response_time_ms
        }),
        ("beacon_service_response_time_max_ms", "gauge", "Slowest recorded call", |m| {
            m.max_response_time_ms
        }),
        ("beacon_service_error_rate_percent", "gauge", "Failed calls as a percentage", |m| {
            m.error_rate
        }),
        ("beacon_service_throughput_rps", "gauge", "Calls per second", |m| m.throughput),
    ];

    let mut out = String::new();
    for (name, kind, help, value) in families {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} {}", name, kind);
        for m in metrics {
            let _ = writeln!(
                out,
                "{}{{service_id=\"{}\",service_name=\"{}\"}} {}",
                name,
                escape_label(&m.service_id),
                escape_label(&m.service_name),
                value(m)
            );
        }
    }
    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn render_csv(metrics: &[ServiceMetrics]) -> String {
    let mut out = String::from(
        "service_id,service_name,total_requests,successful_requests,failed_requests,\
         average_response_time_ms,min_response_time_ms,max_response_time_ms,error_rate,\
         throughput,last_request\n",
    );
    for m in metrics {
        let _ = writeln!(
            out,
            "{},{},{},{},{},{:.3},{:.3},{:.3},{:.2},{:.3},{}",
            csv_field(&m.service_id),
            csv_field(&m.service_name),
            m.total_requests,
            m.successful_requests,
            m.failed_requests,
            m.average_response_time_ms,
            m.min_response_time_ms,
            m.max_response_time_ms,
            m.error_rate,
            m.throughput,
            format_timestamp(m.last_request_ms),
        );
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
