//! Load balancer
//!
//! TigerStyle: Closed strategy set, one exhaustive dispatch, candidates read
//! fresh from the store on every call.

mod ring;
mod trackers;

pub use ring::{ring_hash, HashRing};
pub use trackers::{LoadSample, LoadTracker, ResponseTimeTracker};

use crate::error::{RegistryError, RegistryResult};
use crate::service::{HealthState, ServiceInstance, ServiceSnapshot};
use crate::store::ServiceStore;
use beacon_core::config::BalancerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

// =============================================================================
// Strategy
// =============================================================================

/// Instance selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    Random,
    ConsistentHash,
    IpHash,
    ResponseTime,
    LeastLoad,
    Geographic,
}

impl Strategy {
    pub const ALL: [Strategy; 9] = [
        Strategy::RoundRobin,
        Strategy::WeightedRoundRobin,
        Strategy::LeastConnections,
        Strategy::Random,
        Strategy::ConsistentHash,
        Strategy::IpHash,
        Strategy::ResponseTime,
        Strategy::LeastLoad,
        Strategy::Geographic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::Random => "random",
            Self::ConsistentHash => "consistent_hash",
            Self::IpHash => "ip_hash",
            Self::ResponseTime => "response_time",
            Self::LeastLoad => "least_load",
            Self::Geographic => "geographic",
        }
    }

    /// Strategies that need no client context or telemetry
    pub fn is_basic(&self) -> bool {
        matches!(
            self,
            Self::RoundRobin | Self::WeightedRoundRobin | Self::LeastConnections | Self::Random
        )
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| RegistryError::unsupported("load balancing strategy", s))
    }
}

// =============================================================================
// Selection Context
// =============================================================================

/// Client attributes consulted by the affinity and locality strategies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
    pub client_zone: Option<String>,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.client_zone = Some(zone.into());
        self
    }

    /// Affinity key: session, then user, then client IP
    pub fn hash_key(&self) -> &str {
        self.session_id
            .as_deref()
            .or(self.user_id.as_deref())
            .or(self.client_ip.as_deref())
            .unwrap_or("default")
    }
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceLoadStats {
    pub id: String,
    pub endpoint: String,
    pub state: HealthState,
    pub weight: u32,
    pub connections: u64,
    pub avg_response_time_ms: Option<f64>,
    pub load_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingStats {
    pub service_name: String,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub total_connections: u64,
    pub instances: Vec<InstanceLoadStats>,
}

// =============================================================================
// Load Balancer
// =============================================================================

#[derive(Debug)]
struct CachedRing {
    /// Sorted instance IDs the ring was built from
    signature: Vec<String>,
    ring: HashRing,
    last_used_ms: u64,
}

/// Picks one healthy instance per call under a chosen strategy
#[derive(Debug)]
pub struct LoadBalancer {
    store: Arc<ServiceStore>,
    config: BalancerConfig,
    /// Next index per service name
    round_robin: Mutex<HashMap<String, usize>>,
    /// Accumulators per service name, per instance
    weighted: Mutex<HashMap<String, HashMap<String, i64>>>,
    rings: RwLock<HashMap<String, CachedRing>>,
    response_times: RwLock<HashMap<String, ResponseTimeTracker>>,
    loads: RwLock<HashMap<String, LoadTracker>>,
    usage: Mutex<HashMap<Strategy, u64>>,
}

impl LoadBalancer {
    pub fn new(store: Arc<ServiceStore>, config: BalancerConfig) -> Self {
        Self {
            store,
            config,
            round_robin: Mutex::new(HashMap::new()),
            weighted: Mutex::new(HashMap::new()),
            rings: RwLock::new(HashMap::new()),
            response_times: RwLock::new(HashMap::new()),
            loads: RwLock::new(HashMap::new()),
            usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Select one healthy instance of `name`
    pub async fn select(
        &self,
        name: &str,
        strategy: Strategy,
        context: &SelectionContext,
    ) -> RegistryResult<ServiceSnapshot> {
        let candidates = self.store.healthy_instances(name).await;
        if candidates.is_empty() {
            return Err(RegistryError::NoInstances {
                name: name.to_string(),
                reason: "no healthy instances".into(),
            });
        }

        let index = if candidates.len() == 1 && !matches!(
            strategy,
            Strategy::RoundRobin | Strategy::WeightedRoundRobin
        ) {
            0
        } else {
            match strategy {
                Strategy::RoundRobin => self.round_robin(name, &candidates).await,
                Strategy::WeightedRoundRobin => self.weighted_round_robin(name, &candidates).await,
                Strategy::LeastConnections => least_connections(&candidates),
                Strategy::Random => self.store.io().rng.choose_index(candidates.len()),
                Strategy::ConsistentHash => {
                    self.consistent_hash(name, &candidates, context.hash_key())
                        .await
                }
                Strategy::IpHash => self.ip_hash(&candidates, context.client_ip.as_deref()),
                Strategy::ResponseTime => self.fastest(&candidates).await,
                Strategy::LeastLoad => self.least_loaded(&candidates).await,
                Strategy::Geographic => {
                    self.geographic(&candidates, context.client_zone.as_deref())
                        .await
                }
            }
        };
        debug_assert!(index < candidates.len());

        *self.usage.lock().await.entry(strategy).or_default() += 1;
        let selected = candidates[index].snapshot().await;
        debug!(
            service_name = %name,
            service_id = %selected.id(),
            strategy = %strategy,
            candidates = candidates.len(),
            "instance selected"
        );
        Ok(selected)
    }

    async fn round_robin(&self, name: &str, candidates: &[Arc<ServiceInstance>]) -> usize {
        let mut counters = self.round_robin.lock().await;
        let counter = counters.entry(name.to_string()).or_insert(0);
        let index = *counter % candidates.len();
        *counter = (index + 1) % candidates.len();
        index
    }

    /// Smooth weighted round robin
    async fn weighted_round_robin(&self, name: &str, candidates: &[Arc<ServiceInstance>]) -> usize {
        let mut weights = Vec::with_capacity(candidates.len());
        for instance in candidates {
            weights.push(i64::from(instance.weight().await));
        }
        let total: i64 = weights.iter().sum();
        if total == 0 {
            return self.round_robin(name, candidates).await;
        }

        let mut all = self.weighted.lock().await;
        let accumulators = all.entry(name.to_string()).or_default();
        accumulators.retain(|id, _| candidates.iter().any(|c| c.id() == id));

        let mut best: Option<(usize, i64)> = None;
        for (index, (instance, weight)) in candidates.iter().zip(&weights).enumerate() {
            let current = accumulators.entry(instance.id().to_string()).or_insert(0);
            *current += weight;
            if best.map_or(true, |(_, value)| *current > value) {
                best = Some((index, *current));
            }
        }

        let (winner, _) = best.unwrap_or((0, 0));
        if let Some(current) = accumulators.get_mut(candidates[winner].id()) {
            *current -= total;
        }
        winner
    }

    async fn consistent_hash(
        &self,
        name: &str,
        candidates: &[Arc<ServiceInstance>],
        key: &str,
    ) -> usize {
        let mut signature: Vec<String> = candidates.iter().map(|c| c.id().to_string()).collect();
        signature.sort();
        let now_ms = self.store.io().now_ms();

        let mut rings = self.rings.write().await;
        let cached = rings
            .entry(name.to_string())
            .and_modify(|cached| {
                if cached.signature != signature {
                    debug!(service_name = %name, nodes = signature.len(), "rebuilding hash ring");
                    cached.ring = HashRing::new(&signature, self.config.virtual_nodes_count);
                    cached.signature = signature.clone();
                }
            })
            .or_insert_with(|| CachedRing {
                ring: HashRing::new(&signature, self.config.virtual_nodes_count),
                signature: signature.clone(),
                last_used_ms: now_ms,
            });
        cached.last_used_ms = now_ms;

        cached
            .ring
            .lookup(key)
            .and_then(|owner| candidates.iter().position(|c| c.id() == owner))
            .unwrap_or(0)
    }

    fn ip_hash(&self, candidates: &[Arc<ServiceInstance>], client_ip: Option<&str>) -> usize {
        let parsed = client_ip.and_then(|ip| ip.parse::<IpAddr>().ok());
        match parsed {
            Some(IpAddr::V4(ip)) => crc32fast::hash(&ip.octets()) as usize % candidates.len(),
            Some(IpAddr::V6(ip)) => crc32fast::hash(&ip.octets()) as usize % candidates.len(),
            None => self.store.io().rng.choose_index(candidates.len()),
        }
    }

    /// Lowest EMA among instances with samples, else the first without
    async fn fastest(&self, candidates: &[Arc<ServiceInstance>]) -> usize {
        let trackers = self.response_times.read().await;
        let mut best: Option<(usize, f64)> = None;
        let mut first_unsampled: Option<usize> = None;
        for (index, instance) in candidates.iter().enumerate() {
            match trackers.get(instance.id()).and_then(ResponseTimeTracker::ema_ms) {
                Some(ema) => {
                    if best.map_or(true, |(_, value)| ema < value) {
                        best = Some((index, ema));
                    }
                }
                None => {
                    first_unsampled.get_or_insert(index);
                }
            }
        }
        best.map(|(index, _)| index)
            .or(first_unsampled)
            .unwrap_or(0)
    }

    async fn least_loaded(&self, candidates: &[Arc<ServiceInstance>]) -> usize {
        let loads = self.loads.read().await;
        let mut best: Option<(usize, f64)> = None;
        for (index, instance) in candidates.iter().enumerate() {
            let score = loads.get(instance.id()).map_or(0.0, LoadTracker::score);
            if best.map_or(true, |(_, value)| score < value) {
                best = Some((index, score));
            }
        }
        best.map_or(0, |(index, _)| index)
    }

    async fn geographic(&self, candidates: &[Arc<ServiceInstance>], zone: Option<&str>) -> usize {
        let rng = &self.store.io().rng;
        if let Some(zone) = zone {
            let mut matches = Vec::new();
            for (index, instance) in candidates.iter().enumerate() {
                if instance.descriptor().await.zone() == Some(zone) {
                    matches.push(index);
                }
            }
            if !matches.is_empty() {
                return matches[rng.choose_index(matches.len())];
            }
        }
        rng.choose_index(candidates.len())
    }

    // =========================================================================
    // Trackers
    // =========================================================================

    /// Record one observed response time for an instance
    pub async fn record_response_time(&self, service_id: &str, duration: Duration) {
        let now_ms = self.store.io().now_ms();
        let mut trackers = self.response_times.write().await;
        trackers
            .entry(service_id.to_string())
            .or_insert_with(|| ResponseTimeTracker::new(self.config.sample_window_count))
            .record(duration.as_micros() as f64 / 1000.0, now_ms);
    }

    pub async fn average_response_time_ms(&self, service_id: &str) -> Option<f64> {
        self.response_times
            .read()
            .await
            .get(service_id)
            .and_then(ResponseTimeTracker::ema_ms)
    }

    /// Replace the load report for an instance
    pub async fn update_service_load(&self, service_id: &str, sample: LoadSample) -> RegistryResult<()> {
        sample.validate()?;
        let now_ms = self.store.io().now_ms();
        self.loads
            .write()
            .await
            .insert(service_id.to_string(), LoadTracker::new(sample, now_ms));
        Ok(())
    }

    pub async fn load_score(&self, service_id: &str) -> Option<f64> {
        self.loads.read().await.get(service_id).map(LoadTracker::score)
    }

    /// Evict tracker entries and cached rings idle for longer than `max_age`
    pub async fn cleanup_stale_data(&self, max_age: Duration) -> usize {
        let cutoff = self
            .store
            .io()
            .now_ms()
            .saturating_sub(max_age.as_millis() as u64);
        let mut evicted = 0;

        {
            let mut trackers = self.response_times.write().await;
            let before = trackers.len();
            trackers.retain(|_, t| t.last_updated_ms() >= cutoff);
            evicted += before - trackers.len();
        }
        {
            let mut loads = self.loads.write().await;
            let before = loads.len();
            loads.retain(|_, l| l.last_updated_ms >= cutoff);
            evicted += before - loads.len();
        }
        {
            let mut rings = self.rings.write().await;
            let before = rings.len();
            rings.retain(|_, r| r.last_used_ms >= cutoff);
            evicted += before - rings.len();
        }

        if evicted > 0 {
            info!(evicted, "evicted stale load balancing data");
        }
        evicted
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub async fn load_balancing_stats(&self, name: &str) -> RegistryResult<LoadBalancingStats> {
        let instances = self.store.instances_named(name).await;
        if instances.is_empty() {
            return Err(RegistryError::NoInstances {
                name: name.to_string(),
                reason: "no instances registered".into(),
            });
        }

        let trackers = self.response_times.read().await;
        let loads = self.loads.read().await;
        let mut stats = Vec::with_capacity(instances.len());
        let mut healthy_instances = 0;
        let mut total_connections = 0;
        for instance in &instances {
            let snapshot = instance.snapshot().await;
            if snapshot.is_healthy() {
                healthy_instances += 1;
            }
            total_connections += snapshot.active_connections;
            stats.push(InstanceLoadStats {
                id: snapshot.descriptor.id.clone(),
                endpoint: snapshot.descriptor.endpoint(),
                state: snapshot.health,
                weight: snapshot.descriptor.weight,
                connections: snapshot.active_connections,
                avg_response_time_ms: trackers
                    .get(instance.id())
                    .and_then(ResponseTimeTracker::ema_ms),
                load_score: loads.get(instance.id()).map(LoadTracker::score),
            });
        }

        Ok(LoadBalancingStats {
            service_name: name.to_string(),
            total_instances: instances.len(),
            healthy_instances,
            total_connections,
            instances: stats,
        })
    }

    /// Successful selections per strategy
    pub async fn strategy_usage(&self) -> HashMap<Strategy, u64> {
        self.usage.lock().await.clone()
    }
}

/// Fewest active connections; the first wins ties
fn least_connections(candidates: &[Arc<ServiceInstance>]) -> usize {
    let mut best = 0;
    let mut best_connections = u64::MAX;
    for (index, instance) in candidates.iter().enumerate() {
        let connections = instance.connections();
        if connections < best_connections {
            best = index;
            best_connections = connections;
        }
    }
    best
}
