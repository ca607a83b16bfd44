//! Service descriptors and live instances
//!
//! TigerStyle: Validated descriptors, explicit health lifecycle, per-instance
//! locks independent of the store's collection locks.

use crate::error::{RegistryError, RegistryResult};
use beacon_core::constants::{
    SERVICE_DEPENDENCIES_COUNT_MAX, SERVICE_ID_LENGTH_BYTES_MAX, SERVICE_NAME_LENGTH_BYTES_MAX,
    SERVICE_PORT_MIN, SERVICE_TAGS_COUNT_MAX,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Metadata key holding an instance's availability zone
pub const METADATA_ZONE_KEY: &str = "zone";

// =============================================================================
// Health Check Specification
// =============================================================================

/// Probe protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthProtocol {
    Http,
    Tcp,
    /// Probed as TCP reachability
    Grpc,
}

impl FromStr for HealthProtocol {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            "grpc" => Ok(Self::Grpc),
            _ => Err(RegistryError::unsupported("health check protocol", s)),
        }
    }
}

impl fmt::Display for HealthProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Tcp => write!(f, "tcp"),
            Self::Grpc => write!(f, "grpc"),
        }
    }
}

/// How an instance is probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub protocol: HealthProtocol,
    /// URL for HTTP, `host:port` for TCP/gRPC; derived from the descriptor when absent
    pub endpoint: Option<String>,
    /// HTTP method for HTTP probes
    pub http_method: String,
    /// Advisory per-instance interval (milliseconds); the sweep interval governs
    pub interval_ms: u64,
    /// Probe timeout (milliseconds); zero means the checker default
    pub timeout_ms: u64,
    /// Consecutive failures before the instance is marked unhealthy; zero means the checker default
    pub failure_threshold: u32,
    pub enabled: bool,
}

impl HealthCheckSpec {
    fn with_protocol(protocol: HealthProtocol) -> Self {
        Self {
            protocol,
            endpoint: None,
            http_method: "GET".to_string(),
            interval_ms: 0,
            timeout_ms: 0,
            failure_threshold: 0,
            enabled: true,
        }
    }

    /// HTTP probe; `endpoint` of `None` probes `http://{address}:{port}/health`
    pub fn http(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            ..Self::with_protocol(HealthProtocol::Http)
        }
    }

    /// TCP connect probe against the instance address
    pub fn tcp() -> Self {
        Self::with_protocol(HealthProtocol::Tcp)
    }

    /// gRPC probe (TCP reachability) against the instance address
    pub fn grpc() -> Self {
        Self::with_protocol(HealthProtocol::Grpc)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = method.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Resolve the probe target for an instance
    pub fn target(&self, address: &str, port: u16) -> String {
        match (&self.endpoint, self.protocol) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, HealthProtocol::Http) => format!("http://{}:{}/health", address, port),
            (None, HealthProtocol::Tcp | HealthProtocol::Grpc) => format!("{}:{}", address, port),
        }
    }
}

// =============================================================================
// Service Descriptor
// =============================================================================

/// Registration payload for a service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Globally unique instance ID
    pub id: String,
    /// Logical service name shared by interchangeable instances
    pub name: String,
    /// Semantic version string
    pub version: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub health_check: Option<HealthCheckSpec>,
    /// Names of services this instance requires
    pub dependencies: Vec<String>,
    pub weight: u32,
    /// Set by the store on registration (Unix ms)
    pub registered_at_ms: u64,
    /// Set by the store on registration and update (Unix ms)
    pub updated_at_ms: u64,
}

impl ServiceDescriptor {
    /// Create a descriptor with weight 1 and no health check
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "0.0.0".to_string(),
            address: address.into(),
            port,
            tags: Vec::new(),
            metadata: HashMap::new(),
            health_check: None,
            dependencies: Vec::new(),
            weight: 1,
            registered_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn with_health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Availability zone from metadata
    pub fn zone(&self) -> Option<&str> {
        self.metadata.get(METADATA_ZONE_KEY).map(String::as_str)
    }

    /// Whether a probe is configured and enabled
    pub fn has_enabled_health_check(&self) -> bool {
        self.health_check.as_ref().is_some_and(|hc| hc.enabled)
    }

    /// Validate registration invariants
    pub fn validate(&self) -> RegistryResult<()> {
        if self.id.is_empty() {
            return Err(RegistryError::invalid_input("id", "service ID cannot be empty"));
        }
        if self.id.len() > SERVICE_ID_LENGTH_BYTES_MAX {
            return Err(RegistryError::invalid_input(
                "id",
                format!(
                    "length {} exceeds limit {}",
                    self.id.len(),
                    SERVICE_ID_LENGTH_BYTES_MAX
                ),
            ));
        }
        if self.name.is_empty() {
            return Err(RegistryError::invalid_input(
                "name",
                "service name cannot be empty",
            ));
        }
        if self.name.len() > SERVICE_NAME_LENGTH_BYTES_MAX {
            return Err(RegistryError::invalid_input(
                "name",
                format!(
                    "length {} exceeds limit {}",
                    self.name.len(),
                    SERVICE_NAME_LENGTH_BYTES_MAX
                ),
            ));
        }
        validate_address(&self.address)?;
        validate_port(self.port)?;
        if self.tags.len() > SERVICE_TAGS_COUNT_MAX {
            return Err(RegistryError::invalid_input(
                "tags",
                format!("{} tags exceeds limit {}", self.tags.len(), SERVICE_TAGS_COUNT_MAX),
            ));
        }
        if self.dependencies.len() > SERVICE_DEPENDENCIES_COUNT_MAX {
            return Err(RegistryError::invalid_input(
                "dependencies",
                format!(
                    "{} dependencies exceeds limit {}",
                    self.dependencies.len(),
                    SERVICE_DEPENDENCIES_COUNT_MAX
                ),
            ));
        }
        if self.dependencies.iter().any(|d| d.is_empty()) {
            return Err(RegistryError::invalid_input(
                "dependencies",
                "dependency name cannot be empty",
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_address(address: &str) -> RegistryResult<()> {
    if address.is_empty() {
        return Err(RegistryError::invalid_input(
            "address",
            "service address cannot be empty",
        ));
    }
    Ok(())
}

pub(crate) fn validate_port(port: u16) -> RegistryResult<()> {
    if port < SERVICE_PORT_MIN {
        return Err(RegistryError::invalid_input(
            "port",
            format!("{} is outside 1..=65535", port),
        ));
    }
    Ok(())
}

// =============================================================================
// Health State
// =============================================================================

/// Health lifecycle of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Registering,
    /// Awaiting its first passing probe
    Registered,
    Healthy,
    Unhealthy,
    Deregistering,
    /// Terminal
    Deregistered,
}

impl HealthState {
    /// Eligible for discovery and selection
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// No further transitions are allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deregistered)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registering => write!(f, "registering"),
            Self::Registered => write!(f, "registered"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Deregistering => write!(f, "deregistering"),
            Self::Deregistered => write!(f, "deregistered"),
        }
    }
}

/// Mutable runtime state of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    pub health: HealthState,
    pub last_healthy_ms: Option<u64>,
    pub last_seen_ms: u64,
    pub consecutive_failures: u32,
}

/// Result of applying one probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTransition {
    pub old: HealthState,
    pub new: HealthState,
    pub consecutive_failures: u32,
}

impl ProbeTransition {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

// =============================================================================
// Service Instance
// =============================================================================

/// A registered instance with its runtime state
///
/// `id` and `name` never change after registration and are readable without
/// locking. The descriptor and state each sit behind their own lock.
#[derive(Debug)]
pub struct ServiceInstance {
    id: String,
    name: String,
    descriptor: RwLock<ServiceDescriptor>,
    state: RwLock<InstanceState>,
    active_connections: AtomicU64,
}

impl ServiceInstance {
    pub(crate) fn new(descriptor: ServiceDescriptor, now_ms: u64) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            descriptor: RwLock::new(descriptor),
            state: RwLock::new(InstanceState {
                health: HealthState::Registering,
                last_healthy_ms: None,
                last_seen_ms: now_ms,
                consecutive_failures: 0,
            }),
            active_connections: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn descriptor(&self) -> ServiceDescriptor {
        self.descriptor.read().await.clone()
    }

    pub async fn state(&self) -> InstanceState {
        self.state.read().await.clone()
    }

    pub async fn health(&self) -> HealthState {
        self.state.read().await.health
    }

    pub async fn is_healthy(&self) -> bool {
        self.health().await.is_healthy()
    }

    pub async fn weight(&self) -> u32 {
        self.descriptor.read().await.weight
    }

    pub fn connections(&self) -> u64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn increment_connections(&self) -> u64 {
        self.active_connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Saturates at zero
    pub fn decrement_connections(&self) -> u64 {
        let mut current = self.active_connections.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(1);
            match self.active_connections.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Set the health state, returning the previous one
    ///
    /// A terminal instance ignores further transitions.
    pub(crate) async fn set_health(&self, health: HealthState, now_ms: u64) -> HealthState {
        let mut state = self.state.write().await;
        let old = state.health;
        if old.is_terminal() {
            return old;
        }
        state.health = health;
        if health.is_healthy() {
            state.last_healthy_ms = Some(now_ms);
            state.consecutive_failures = 0;
        }
        old
    }

    /// Apply one probe outcome
    ///
    /// Success resets the failure counter and marks the instance healthy.
    /// Failure increments the counter and marks it unhealthy once the
    /// counter reaches `failure_threshold`.
    pub(crate) async fn record_probe(
        &self,
        success: bool,
        failure_threshold: u32,
        now_ms: u64,
    ) -> ProbeTransition {
        debug_assert!(failure_threshold > 0);
        let mut state = self.state.write().await;
        let old = state.health;
        state.last_seen_ms = now_ms;

        if old.is_terminal() || old == HealthState::Deregistering {
            return ProbeTransition {
                old,
                new: old,
                consecutive_failures: state.consecutive_failures,
            };
        }

        if success {
            state.consecutive_failures = 0;
            state.health = HealthState::Healthy;
            state.last_healthy_ms = Some(now_ms);
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if state.consecutive_failures >= failure_threshold {
                state.health = HealthState::Unhealthy;
            }
        }

        ProbeTransition {
            old,
            new: state.health,
            consecutive_failures: state.consecutive_failures,
        }
    }

    /// Mutate the descriptor under its lock
    pub(crate) async fn update_descriptor<F>(&self, apply: F) -> ServiceDescriptor
    where
        F: FnOnce(&mut ServiceDescriptor),
    {
        let mut descriptor = self.descriptor.write().await;
        apply(&mut descriptor);
        debug_assert_eq!(descriptor.id, self.id);
        debug_assert_eq!(descriptor.name, self.name);
        descriptor.clone()
    }

    /// Point-in-time copy of descriptor and state
    pub async fn snapshot(&self) -> ServiceSnapshot {
        let descriptor = self.descriptor().await;
        let state = self.state().await;
        ServiceSnapshot {
            descriptor,
            health: state.health,
            last_healthy_ms: state.last_healthy_ms,
            last_seen_ms: state.last_seen_ms,
            consecutive_failures: state.consecutive_failures,
            active_connections: self.connections(),
        }
    }
}

/// Plain-value view of an instance returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub descriptor: ServiceDescriptor,
    pub health: HealthState,
    pub last_healthy_ms: Option<u64>,
    pub last_seen_ms: u64,
    pub consecutive_failures: u32,
    pub active_connections: u64,
}

impl ServiceSnapshot {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("svc-1", "api", "10.0.0.1", 8080)
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(descriptor().validate().is_ok());

        let mut d = descriptor();
        d.id.clear();
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.name.clear();
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.address.clear();
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.port = 0;
        let err = d.validate().unwrap_err();
        assert!(err.to_string().contains("port"));

        let mut d = descriptor();
        d.id = "x".repeat(SERVICE_ID_LENGTH_BYTES_MAX + 1);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("HTTP".parse::<HealthProtocol>().unwrap(), HealthProtocol::Http);
        assert_eq!("tcp".parse::<HealthProtocol>().unwrap(), HealthProtocol::Tcp);
        assert_eq!("gRPC".parse::<HealthProtocol>().unwrap(), HealthProtocol::Grpc);
        let err = "udp".parse::<HealthProtocol>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unsupported);
    }

    #[test]
    fn test_probe_target() {
        assert_eq!(
            HealthCheckSpec::http(None).target("10.0.0.1", 8080),
            "http://10.0.0.1:8080/health"
        );
        assert_eq!(HealthCheckSpec::tcp().target("10.0.0.1", 9000), "10.0.0.1:9000");
        assert_eq!(
            HealthCheckSpec::grpc()
                .with_endpoint("grpc.local:50051")
                .target("ignored", 1),
            "grpc.local:50051"
        );
    }

    #[test]
    fn test_health_state_display() {
        assert_eq!(HealthState::Healthy.to_string(), "healthy");
        assert_eq!(HealthState::Deregistering.to_string(), "deregistering");
        assert!(HealthState::Deregistered.is_terminal());
    }

    #[tokio::test]
    async fn test_probe_threshold() {
        let instance = ServiceInstance::new(descriptor(), 0);
        instance.set_health(HealthState::Healthy, 1).await;

        let t = instance.record_probe(false, 3, 2).await;
        assert_eq!(t.new, HealthState::Healthy);
        assert_eq!(t.consecutive_failures, 1);
        instance.record_probe(false, 3, 3).await;
        let t = instance.record_probe(false, 3, 4).await;
        assert_eq!(t.new, HealthState::Unhealthy);
        assert!(t.changed());

        let t = instance.record_probe(true, 3, 5).await;
        assert_eq!(t.new, HealthState::Healthy);
        assert_eq!(t.consecutive_failures, 0);

        let state = instance.state().await;
        assert_eq!(state.last_healthy_ms, Some(5));
        assert_eq!(state.last_seen_ms, 5);
    }

    #[tokio::test]
    async fn test_terminal_state_sticks() {
        let instance = ServiceInstance::new(descriptor(), 0);
        instance.set_health(HealthState::Deregistered, 1).await;
        instance.set_health(HealthState::Healthy, 2).await;
        assert_eq!(instance.health().await, HealthState::Deregistered);

        let t = instance.record_probe(true, 1, 3).await;
        assert!(!t.changed());
    }

    #[test]
    fn test_connections_saturate() {
        let instance = ServiceInstance::new(descriptor(), 0);
        assert_eq!(instance.decrement_connections(), 0);
        assert_eq!(instance.increment_connections(), 1);
        assert_eq!(instance.increment_connections(), 2);
        assert_eq!(instance.decrement_connections(), 1);
        assert_eq!(instance.connections(), 1);
    }
}
