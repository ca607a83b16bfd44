//! Configuration for Beacon
//!
//! TigerStyle: Explicit defaults, validation, reasonable limits.

use crate::constants::*;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for a Beacon registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Store and event dispatch configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Health checker configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Load balancer configuration
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Default failover settings applied when none are given per instance
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Metrics and alerting configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Extended registry feature toggles and cleanup
    #[serde(default)]
    pub extended: ExtendedConfig,
}

impl BeaconConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.health.validate()?;
        self.balancer.validate()?;
        self.failover.validate()?;
        self.metrics.validate()?;
        self.extended.validate()?;
        Ok(())
    }

    /// Parse from JSON and validate
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Short intervals and grace periods for tests
    pub fn for_testing() -> Self {
        Self {
            health: HealthConfig {
                interval_ms: 20,
                probe_timeout_ms_default: 200,
                stop_grace_ms: 500,
                failure_threshold_default: HEALTH_FAILURE_THRESHOLD_DEFAULT,
            },
            extended: ExtendedConfig {
                cleanup_interval_ms: 20,
                stop_grace_ms: 500,
                ..ExtendedConfig::default()
            },
            ..Self::default()
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Store and event dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Number of recent events kept for `event_history`
    #[serde(default = "default_event_history_count")]
    pub event_history_count_max: usize,

    /// Depth of each subscriber's queue; events beyond it are dropped
    #[serde(default = "default_subscriber_queue_depth")]
    pub subscriber_queue_depth_max: usize,
}

fn default_event_history_count() -> usize {
    EVENT_HISTORY_COUNT_DEFAULT
}

fn default_subscriber_queue_depth() -> usize {
    SUBSCRIBER_QUEUE_DEPTH_DEFAULT
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            event_history_count_max: default_event_history_count(),
            subscriber_queue_depth_max: default_subscriber_queue_depth(),
        }
    }
}

impl RegistryConfig {
    fn validate(&self) -> Result<()> {
        if self.event_history_count_max > EVENT_HISTORY_COUNT_MAX {
            return Err(Error::invalid_configuration(
                "registry.event_history_count_max",
                format!(
                    "{} exceeds limit {}",
                    self.event_history_count_max, EVENT_HISTORY_COUNT_MAX
                ),
            ));
        }
        if self.subscriber_queue_depth_max == 0
            || self.subscriber_queue_depth_max > SUBSCRIBER_QUEUE_DEPTH_MAX
        {
            return Err(Error::invalid_configuration(
                "registry.subscriber_queue_depth_max",
                format!("must be in 1..={}", SUBSCRIBER_QUEUE_DEPTH_MAX),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Health
// =============================================================================

/// Health checker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between sweeps (milliseconds)
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// Probe timeout used when a health check does not set one (milliseconds)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms_default: u64,

    /// Bounded wait when stopping the loop (milliseconds)
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Failure threshold used when a health check sets zero
    #[serde(default = "default_health_failure_threshold")]
    pub failure_threshold_default: u32,
}

fn default_health_interval_ms() -> u64 {
    HEALTH_CHECK_INTERVAL_MS_DEFAULT
}

fn default_probe_timeout_ms() -> u64 {
    HEALTH_PROBE_TIMEOUT_MS_DEFAULT
}

fn default_stop_grace_ms() -> u64 {
    TASK_STOP_GRACE_MS_DEFAULT
}

fn default_health_failure_threshold() -> u32 {
    HEALTH_FAILURE_THRESHOLD_DEFAULT
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            probe_timeout_ms_default: default_probe_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            failure_threshold_default: default_health_failure_threshold(),
        }
    }
}

impl HealthConfig {
    fn validate(&self) -> Result<()> {
        if !(HEALTH_CHECK_INTERVAL_MS_MIN..=HEALTH_CHECK_INTERVAL_MS_MAX)
            .contains(&self.interval_ms)
        {
            return Err(Error::invalid_configuration(
                "health.interval_ms",
                format!(
                    "must be in {}..={}",
                    HEALTH_CHECK_INTERVAL_MS_MIN, HEALTH_CHECK_INTERVAL_MS_MAX
                ),
            ));
        }
        if self.probe_timeout_ms_default == 0 {
            return Err(Error::invalid_configuration(
                "health.probe_timeout_ms_default",
                "must be positive",
            ));
        }
        if self.failure_threshold_default == 0 {
            return Err(Error::invalid_configuration(
                "health.failure_threshold_default",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Balancer
// =============================================================================

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Virtual nodes per instance on the consistent hash ring
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes_count: u32,

    /// Samples retained per instance for response time tracking
    #[serde(default = "default_sample_window")]
    pub sample_window_count: usize,

    /// Tracker state older than this is evicted by cleanup (milliseconds)
    #[serde(default = "default_stale_retention_ms")]
    pub stale_retention_ms: u64,
}

fn default_virtual_nodes() -> u32 {
    HASH_RING_VIRTUAL_NODES_COUNT_DEFAULT
}

fn default_sample_window() -> usize {
    BALANCER_SAMPLE_WINDOW_COUNT_DEFAULT
}

fn default_stale_retention_ms() -> u64 {
    BALANCER_STALE_RETENTION_MS_DEFAULT
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            virtual_nodes_count: default_virtual_nodes(),
            sample_window_count: default_sample_window(),
            stale_retention_ms: default_stale_retention_ms(),
        }
    }
}

impl BalancerConfig {
    fn validate(&self) -> Result<()> {
        if self.virtual_nodes_count == 0
            || self.virtual_nodes_count > HASH_RING_VIRTUAL_NODES_COUNT_MAX
        {
            return Err(Error::invalid_configuration(
                "balancer.virtual_nodes_count",
                format!("must be in 1..={}", HASH_RING_VIRTUAL_NODES_COUNT_MAX),
            ));
        }
        if self.sample_window_count == 0
            || self.sample_window_count > BALANCER_SAMPLE_WINDOW_COUNT_MAX
        {
            return Err(Error::invalid_configuration(
                "balancer.sample_window_count",
                format!("must be in 1..={}", BALANCER_SAMPLE_WINDOW_COUNT_MAX),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Failover
// =============================================================================

/// Per-instance failover and circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Recovery attempts before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between recovery attempts (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Multiplier applied per failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cap on the delay between recovery attempts (milliseconds)
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,

    /// Consecutive failures that open the circuit
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before allowing a probe (milliseconds)
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    FAILOVER_MAX_RETRIES_DEFAULT
}

fn default_retry_delay_ms() -> u64 {
    FAILOVER_RETRY_DELAY_MS_DEFAULT
}

fn default_backoff_multiplier() -> f64 {
    FAILOVER_BACKOFF_MULTIPLIER_DEFAULT
}

fn default_max_retry_delay_ms() -> u64 {
    FAILOVER_RETRY_DELAY_MS_MAX_DEFAULT
}

fn default_circuit_failure_threshold() -> u32 {
    CIRCUIT_FAILURE_THRESHOLD_DEFAULT
}

fn default_recovery_timeout_ms() -> u64 {
    CIRCUIT_RECOVERY_TIMEOUT_MS_DEFAULT
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            circuit_breaker_enabled: true,
            failure_threshold: default_circuit_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl FailoverConfig {
    /// Validate a failover configuration
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::invalid_configuration(
                "failover.failure_threshold",
                "must be at least 1",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_configuration(
                "failover.backoff_multiplier",
                "must be a finite value >= 1.0",
            ));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(Error::invalid_configuration(
                "failover.max_retry_delay_ms",
                format!(
                    "{} is below retry_delay_ms {}",
                    self.max_retry_delay_ms, self.retry_delay_ms
                ),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Metrics and alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Idle metrics and resolved alerts older than this are dropped (milliseconds)
    #[serde(default = "default_metrics_retention_ms")]
    pub retention_ms: u64,

    /// Alerts retained in history
    #[serde(default = "default_alert_history_count")]
    pub alert_history_count_max: usize,

    /// Resolve active alerts once their threshold is no longer breached
    #[serde(default)]
    pub auto_resolve_alerts: bool,
}

fn default_metrics_retention_ms() -> u64 {
    METRICS_RETENTION_MS_DEFAULT
}

fn default_alert_history_count() -> usize {
    ALERT_HISTORY_COUNT_DEFAULT
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_metrics_retention_ms(),
            alert_history_count_max: default_alert_history_count(),
            auto_resolve_alerts: false,
        }
    }
}

impl MetricsConfig {
    fn validate(&self) -> Result<()> {
        if self.alert_history_count_max == 0 || self.alert_history_count_max > ALERT_HISTORY_COUNT_MAX
        {
            return Err(Error::invalid_configuration(
                "metrics.alert_history_count_max",
                format!("must be in 1..={}", ALERT_HISTORY_COUNT_MAX),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Extended
// =============================================================================

/// Extended registry feature toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedConfig {
    #[serde(default = "default_true")]
    pub enable_version_management: bool,

    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    #[serde(default = "default_true")]
    pub enable_failover: bool,

    /// Allow strategies beyond round robin, weighted, least connections and random
    #[serde(default = "default_true")]
    pub enable_extended_lb: bool,

    /// Interval between cleanup sweeps (milliseconds)
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Bounded wait when stopping the cleanup loop (milliseconds)
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_cleanup_interval_ms() -> u64 {
    CLEANUP_INTERVAL_MS_DEFAULT
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        Self {
            enable_version_management: true,
            enable_metrics: true,
            enable_failover: true,
            enable_extended_lb: true,
            cleanup_interval_ms: default_cleanup_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl ExtendedConfig {
    fn validate(&self) -> Result<()> {
        if self.cleanup_interval_ms < CLEANUP_INTERVAL_MS_MIN {
            return Err(Error::invalid_configuration(
                "extended.cleanup_interval_ms",
                format!("must be at least {}", CLEANUP_INTERVAL_MS_MIN),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BeaconConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.health.interval_ms, 30_000);
        assert_eq!(config.balancer.virtual_nodes_count, 150);
        assert!(!config.metrics.auto_resolve_alerts);
        assert!(config.extended.enable_extended_lb);
    }

    #[test]
    fn test_testing_config_is_valid() {
        assert!(BeaconConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = BeaconConfig::from_json_str(
            r#"{"health": {"interval_ms": 1000}, "metrics": {"auto_resolve_alerts": true}}"#,
        )
        .unwrap();
        assert_eq!(config.health.interval_ms, 1000);
        assert_eq!(config.health.stop_grace_ms, TASK_STOP_GRACE_MS_DEFAULT);
        assert!(config.metrics.auto_resolve_alerts);
        assert_eq!(config.failover.max_retries, FAILOVER_MAX_RETRIES_DEFAULT);
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let result = BeaconConfig::from_json_str(r#"{"health": {"interval_ms": 1}}"#);
        match result {
            Err(Error::InvalidConfiguration { field, .. }) => {
                assert_eq!(field, "health.interval_ms")
            }
            other => panic!("expected invalid configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_failover_validation() {
        let mut config = FailoverConfig::default();
        assert!(config.validate().is_ok());

        config.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        config.backoff_multiplier = 2.0;
        config.failure_threshold = 0;
        assert!(config.validate().is_err());

        config.failure_threshold = 3;
        config.max_retry_delay_ms = 10;
        config.retry_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_virtual_nodes_rejected() {
        let mut config = BeaconConfig::default();
        config.balancer.virtual_nodes_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let result = BeaconConfig::from_json_str("{");
        assert!(matches!(result, Err(Error::ConfigurationParseFailed { .. })));
    }
}
