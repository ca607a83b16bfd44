//! TigerStyle constants for Beacon
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Service Descriptor Limits
// =============================================================================

/// Maximum length of a service instance ID in bytes
pub const SERVICE_ID_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of a logical service name in bytes
pub const SERVICE_NAME_LENGTH_BYTES_MAX: usize = 128;

/// Maximum number of tags on a single service descriptor
pub const SERVICE_TAGS_COUNT_MAX: usize = 64;

/// Maximum number of declared dependencies on a single service descriptor
pub const SERVICE_DEPENDENCIES_COUNT_MAX: usize = 64;

/// Lowest valid port number
pub const SERVICE_PORT_MIN: u16 = 1;

// =============================================================================
// Event Dispatch Limits
// =============================================================================

/// Default depth of each subscriber's event queue
pub const SUBSCRIBER_QUEUE_DEPTH_DEFAULT: usize = 256;

/// Maximum depth of a subscriber's event queue
pub const SUBSCRIBER_QUEUE_DEPTH_MAX: usize = 65_536;

/// Default number of events retained in the registry's event history
pub const EVENT_HISTORY_COUNT_DEFAULT: usize = 1000;

/// Maximum number of events retained in the registry's event history
pub const EVENT_HISTORY_COUNT_MAX: usize = 100_000;

// =============================================================================
// Health Check Limits
// =============================================================================

/// Default interval between health check sweeps in milliseconds (30 sec)
pub const HEALTH_CHECK_INTERVAL_MS_DEFAULT: u64 = 30 * 1000;

/// Minimum interval between health check sweeps in milliseconds
pub const HEALTH_CHECK_INTERVAL_MS_MIN: u64 = 10;

/// Maximum interval between health check sweeps in milliseconds (1 hour)
pub const HEALTH_CHECK_INTERVAL_MS_MAX: u64 = 60 * 60 * 1000;

/// Default timeout for a single probe in milliseconds (5 sec)
pub const HEALTH_PROBE_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

/// Default consecutive probe failures before an instance is unhealthy
pub const HEALTH_FAILURE_THRESHOLD_DEFAULT: u32 = 3;

/// Default grace period for stopping a background loop in milliseconds (5 sec)
pub const TASK_STOP_GRACE_MS_DEFAULT: u64 = 5 * 1000;

// =============================================================================
// Load Balancer Limits
// =============================================================================

/// Default number of virtual nodes per instance on the hash ring
pub const HASH_RING_VIRTUAL_NODES_COUNT_DEFAULT: u32 = 150;

/// Maximum number of virtual nodes per instance on the hash ring
pub const HASH_RING_VIRTUAL_NODES_COUNT_MAX: u32 = 10_000;

/// Default number of samples retained per instance by balancer trackers
pub const BALANCER_SAMPLE_WINDOW_COUNT_DEFAULT: usize = 100;

/// Maximum number of samples retained per instance by balancer trackers
pub const BALANCER_SAMPLE_WINDOW_COUNT_MAX: usize = 10_000;

/// Default age after which balancer tracker state is evicted (1 hour)
pub const BALANCER_STALE_RETENTION_MS_DEFAULT: u64 = 60 * 60 * 1000;

/// Smoothing factor for exponentially averaged response times
pub const RESPONSE_TIME_EMA_ALPHA: f64 = 0.1;

// =============================================================================
// Failover Limits
// =============================================================================

/// Default maximum recovery attempts per instance
pub const FAILOVER_MAX_RETRIES_DEFAULT: u32 = 3;

/// Default base delay between recovery attempts in milliseconds (1 sec)
pub const FAILOVER_RETRY_DELAY_MS_DEFAULT: u64 = 1000;

/// Default cap on the delay between recovery attempts in milliseconds (30 sec)
pub const FAILOVER_RETRY_DELAY_MS_MAX_DEFAULT: u64 = 30 * 1000;

/// Default multiplier applied to the retry delay after each failed attempt
pub const FAILOVER_BACKOFF_MULTIPLIER_DEFAULT: f64 = 2.0;

/// Default consecutive failures before a circuit opens
pub const CIRCUIT_FAILURE_THRESHOLD_DEFAULT: u32 = 5;

/// Default time an open circuit waits before allowing a probe (60 sec)
pub const CIRCUIT_RECOVERY_TIMEOUT_MS_DEFAULT: u64 = 60 * 1000;

/// Capacity of the failover event broadcast channel
pub const FAILOVER_EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Metrics Limits
// =============================================================================

/// Default retention for idle metrics and resolved alerts (24 hours)
pub const METRICS_RETENTION_MS_DEFAULT: u64 = 24 * 60 * 60 * 1000;

/// Default number of alerts retained in alert history
pub const ALERT_HISTORY_COUNT_DEFAULT: usize = 10_000;

/// Maximum number of alerts retained in alert history
pub const ALERT_HISTORY_COUNT_MAX: usize = 1_000_000;

// =============================================================================
// Extended Registry Limits
// =============================================================================

/// Default interval between cleanup sweeps in milliseconds (5 min)
pub const CLEANUP_INTERVAL_MS_DEFAULT: u64 = 5 * 60 * 1000;

/// Minimum interval between cleanup sweeps in milliseconds
pub const CLEANUP_INTERVAL_MS_MIN: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_within_limits() {
        assert!(SUBSCRIBER_QUEUE_DEPTH_DEFAULT <= SUBSCRIBER_QUEUE_DEPTH_MAX);
        assert!(EVENT_HISTORY_COUNT_DEFAULT <= EVENT_HISTORY_COUNT_MAX);
        assert!(HEALTH_CHECK_INTERVAL_MS_DEFAULT >= HEALTH_CHECK_INTERVAL_MS_MIN);
        assert!(HEALTH_CHECK_INTERVAL_MS_DEFAULT <= HEALTH_CHECK_INTERVAL_MS_MAX);
        assert!(HASH_RING_VIRTUAL_NODES_COUNT_DEFAULT <= HASH_RING_VIRTUAL_NODES_COUNT_MAX);
        assert!(BALANCER_SAMPLE_WINDOW_COUNT_DEFAULT <= BALANCER_SAMPLE_WINDOW_COUNT_MAX);
        assert!(FAILOVER_RETRY_DELAY_MS_DEFAULT <= FAILOVER_RETRY_DELAY_MS_MAX_DEFAULT);
        assert!(ALERT_HISTORY_COUNT_DEFAULT <= ALERT_HISTORY_COUNT_MAX);
    }

    #[test]
    fn test_ema_alpha_in_unit_interval() {
        assert!(RESPONSE_TIME_EMA_ALPHA > 0.0 && RESPONSE_TIME_EMA_ALPHA < 1.0);
    }
}
