//! Beacon Registry
//!
//! In-memory service registry for Beacon.
//!
//! # Overview
//!
//! The registry provides:
//! - Registration, discovery and dependency resolution
//! - Active HTTP/TCP health checking
//! - Nine load balancing strategies
//! - Circuit breakers, recovery and failover
//! - Per-instance call metrics with threshold alerts
//! - Semantic version tracking and compatibility checks
//!
//! # TigerStyle
//! - One authoritative store, everything else derived from it
//! - Bounded event queues (slow subscribers drop, never block)
//! - Background loops stop within a bounded grace period

pub mod balancer;
pub mod error;
pub mod events;
pub mod extended;
pub mod failover;
pub mod health;
pub mod metrics;
pub mod service;
pub mod store;
pub mod task;
pub mod version;

pub use balancer::{
    HashRing, InstanceLoadStats, LoadBalancer, LoadBalancingStats, LoadSample, SelectionContext,
    Strategy,
};
pub use error::{ErrorKind, RegistryError, RegistryResult};
pub use events::{EventFilter, EventType, ServiceEvent, SubscriptionId, SubscriptionStats};
pub use extended::{
    CleanupReport, ExtendedRegistry, ExtendedRegistryStats, ServiceGroup, ServiceNode,
    ServiceTopology,
};
pub use failover::{
    backoff_delay_ms, CircuitBreaker, CircuitState, FailoverConfig, FailoverEvent, FailoverEventType,
    FailoverManager, FailoverResult, FailoverStatistics, InstanceFailoverConfig, RetryState,
};
pub use health::{HealthCheckOutcome, HealthChecker};
pub use metrics::{
    AggregatedMetrics, AlertHandler, AlertSeverity, AlertStatus, AlertThresholds, AlertType,
    ExportFormat, MetricsManager, MetricsStatistics, ServiceAlert, ServiceMetrics,
};
pub use service::{
    HealthCheckSpec, HealthProtocol, HealthState, InstanceState, ServiceDescriptor,
    ServiceInstance, ServiceSnapshot,
};
pub use store::{RegistryStats, ServiceQuery, ServiceStore, ServiceUpdate};
pub use task::{PeriodicTask, StopOutcome};
pub use version::{
    is_compatible, CompatibilityReport, CompatibilityRule, DeprecationInfo, SemVer,
    ServiceVersionInfo, VersionManager, VersionStatistics,
};
