//! Registry store
//!
//! TigerStyle: Two-tier locking. The collection locks guard the by-ID and
//! by-name indexes and are held only long enough to clone instance handles;
//! health and descriptor fields sit behind each instance's own locks.
//!
//! Lock order is always `services` before `by_name` before any instance lock.

use crate::error::{RegistryError, RegistryResult};
use crate::events::{
    EventDispatcher, EventFilter, EventType, ServiceEvent, SubscriptionId, SubscriptionStats,
};
use crate::service::{
    validate_address, validate_port, HealthState, ProbeTransition, ServiceDescriptor,
    ServiceInstance, ServiceSnapshot,
};
use beacon_core::config::RegistryConfig;
use beacon_core::io::IoContext;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// =============================================================================
// Query and Update Types
// =============================================================================

/// Filter for `query`; every populated field must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceQuery {
    pub name: Option<String>,
    /// All of these tags must be present
    #[serde(default)]
    pub tags: Vec<String>,
    /// All of these key/value pairs must be present
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub healthy_only: bool,
}

impl ServiceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
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

    pub fn healthy_only(mut self) -> Self {
        self.healthy_only = true;
        self
    }

    fn matches(&self, snapshot: &ServiceSnapshot) -> bool {
        let d = &snapshot.descriptor;
        if let Some(name) = &self.name {
            if &d.name != name {
                return false;
            }
        }
        if !self.tags.iter().all(|t| d.tags.contains(t)) {
            return false;
        }
        if !self
            .metadata
            .iter()
            .all(|(k, v)| d.metadata.get(k) == Some(v))
        {
            return false;
        }
        !self.healthy_only || snapshot.is_healthy()
    }
}

/// Partial update; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<HashMap<String, String>>,
    pub weight: Option<u32>,
}

impl ServiceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_none()
            && self.port.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
            && self.weight.is_none()
    }

    fn validate(&self) -> RegistryResult<()> {
        if let Some(address) = &self.address {
            validate_address(address)?;
        }
        if let Some(port) = self.port {
            validate_port(port)?;
        }
        Ok(())
    }

    fn field_names(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.address.is_some() {
            fields.push("address");
        }
        if self.port.is_some() {
            fields.push("port");
        }
        if self.tags.is_some() {
            fields.push("tags");
        }
        if self.metadata.is_some() {
            fields.push("metadata");
        }
        if self.weight.is_some() {
            fields.push("weight");
        }
        fields
    }
}

/// Point-in-time registry counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub healthy_services: usize,
    /// Everything not healthy, including instances awaiting a first probe
    pub unhealthy_services: usize,
    pub services_by_state: HashMap<HealthState, usize>,
    pub services_by_name: HashMap<String, usize>,
    pub uptime_ms: u64,
    pub last_updated_ms: u64,
}

// =============================================================================
// Store
// =============================================================================

/// Authoritative in-memory directory of service instances
#[derive(Debug)]
pub struct ServiceStore {
    /// Instances by ID
    services: RwLock<HashMap<String, Arc<ServiceInstance>>>,
    /// Instances by name, in registration order
    by_name: RwLock<HashMap<String, Vec<Arc<ServiceInstance>>>>,
    events: EventDispatcher,
    io: IoContext,
    started_at_ms: u64,
    shut_down: AtomicBool,
}

impl Default for ServiceStore {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ServiceStore {
    /// Create a store with production I/O providers
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_io(config, IoContext::production())
    }

    /// Create a store with injected I/O providers
    pub fn with_io(config: RegistryConfig, io: IoContext) -> Self {
        let started_at_ms = io.now_ms();
        Self {
            services: RwLock::new(HashMap::new()),
            by_name: RwLock::new(HashMap::new()),
            events: EventDispatcher::new(
                config.subscriber_queue_depth_max,
                config.event_history_count_max,
            ),
            io,
            started_at_ms,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn io(&self) -> &IoContext {
        &self.io
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a new instance
    ///
    /// Instances without an enabled health check become healthy immediately;
    /// the rest wait in `Registered` for their first passing probe.
    pub async fn register(&self, mut descriptor: ServiceDescriptor) -> RegistryResult<()> {
        if self.is_shut_down() {
            return Err(RegistryError::unavailable("registry is shut down"));
        }
        descriptor.validate()?;

        let now_ms = self.io.now_ms();
        descriptor.registered_at_ms = now_ms;
        descriptor.updated_at_ms = now_ms;

        let instance = Arc::new(ServiceInstance::new(descriptor.clone(), now_ms));
        {
            let mut services = self.services.write().await;
            if services.contains_key(&descriptor.id) {
                warn!(
                    service_id = %descriptor.id,
                    service_name = %descriptor.name,
                    "registration rejected, service already exists"
                );
                return Err(RegistryError::ServiceAlreadyExists {
                    service_id: descriptor.id,
                });
            }
            let mut by_name = self.by_name.write().await;
            services.insert(descriptor.id.clone(), instance.clone());
            by_name
                .entry(descriptor.name.clone())
                .or_default()
                .push(instance.clone());
        }

        let initial = if descriptor.has_enabled_health_check() {
            HealthState::Registered
        } else {
            HealthState::Healthy
        };
        instance.set_health(initial, now_ms).await;

        info!(
            service_id = %descriptor.id,
            service_name = %descriptor.name,
            endpoint = %descriptor.endpoint(),
            weight = descriptor.weight,
            state = %initial,
            "service registered"
        );

        let message = format!("service {} registered", descriptor.name);
        let event = ServiceEvent::new(EventType::ServiceRegistered, descriptor.clone(), now_ms, message)
            .with_detail("address", descriptor.endpoint())
            .with_detail("tags", json!(descriptor.tags))
            .with_detail("weight", descriptor.weight)
            .with_detail("state", initial.to_string());
        self.events.publish(event).await;
        Ok(())
    }

    /// Remove an instance from every index
    pub async fn deregister(&self, service_id: &str) -> RegistryResult<ServiceDescriptor> {
        let now_ms = self.io.now_ms();
        let instance = {
            let mut services = self.services.write().await;
            let instance = services
                .remove(service_id)
                .ok_or_else(|| RegistryError::service_not_found(service_id))?;
            instance.set_health(HealthState::Deregistering, now_ms).await;

            let mut by_name = self.by_name.write().await;
            if let Some(group) = by_name.get_mut(instance.name()) {
                group.retain(|i| i.id() != service_id);
                if group.is_empty() {
                    by_name.remove(instance.name());
                }
            }
            instance
        };
        instance.set_health(HealthState::Deregistered, now_ms).await;

        let descriptor = instance.descriptor().await;
        info!(
            service_id = %descriptor.id,
            service_name = %descriptor.name,
            "service deregistered"
        );

        let message = format!("service {} deregistered", descriptor.name);
        self.events
            .publish(ServiceEvent::new(
                EventType::ServiceDeregistered,
                descriptor.clone(),
                now_ms,
                message,
            ))
            .await;
        Ok(descriptor)
    }

    /// Apply a partial update to an instance's descriptor
    pub async fn update_service(
        &self,
        service_id: &str,
        update: ServiceUpdate,
    ) -> RegistryResult<ServiceDescriptor> {
        update.validate()?;
        let instance = self.require_instance(service_id).await?;
        let now_ms = self.io.now_ms();
        let fields = update.field_names();

        let descriptor = instance
            .update_descriptor(|d| {
                if let Some(address) = update.address {
                    d.address = address;
                }
                if let Some(port) = update.port {
                    d.port = port;
                }
                if let Some(tags) = update.tags {
                    d.tags = tags;
                }
                if let Some(metadata) = update.metadata {
                    d.metadata = metadata;
                }
                if let Some(weight) = update.weight {
                    d.weight = weight;
                }
                d.updated_at_ms = now_ms;
            })
            .await;

        info!(service_id = %service_id, fields = ?fields, "service updated");

        let message = format!("service {} updated", descriptor.name);
        let event = ServiceEvent::new(EventType::ServiceUpdated, descriptor.clone(), now_ms, message)
            .with_detail("fields", json!(fields));
        self.events.publish(event).await;
        Ok(descriptor)
    }

    /// Deregister everything and refuse further registrations
    pub async fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let ids: Vec<String> = self.services.read().await.keys().cloned().collect();
        let mut removed = 0;
        for id in ids {
            match self.deregister(&id).await {
                Ok(_) => removed += 1,
                Err(e) => debug!(service_id = %id, error = %e, "skipped during shutdown"),
            }
        }
        let subscribers = self.events.unsubscribe_all().await;
        info!(removed, subscribers, "registry shut down");
        removed
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Live handle to an instance
    pub async fn instance(&self, service_id: &str) -> Option<Arc<ServiceInstance>> {
        self.services.read().await.get(service_id).cloned()
    }

    pub(crate) async fn require_instance(
        &self,
        service_id: &str,
    ) -> RegistryResult<Arc<ServiceInstance>> {
        self.instance(service_id)
            .await
            .ok_or_else(|| RegistryError::service_not_found(service_id))
    }

    /// Live handles to every instance under a name, in registration order
    pub async fn instances_named(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        self.by_name
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Live handles to the healthy instances under a name
    pub async fn healthy_instances(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        let candidates = self.instances_named(name).await;
        let mut healthy = Vec::with_capacity(candidates.len());
        for instance in candidates {
            if instance.is_healthy().await {
                healthy.push(instance);
            }
        }
        healthy
    }

    /// Live handles to every instance
    pub async fn all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.services.read().await.values().cloned().collect()
    }

    /// Registered service names
    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Healthy instances for a name; unknown names yield an empty list
    pub async fn discover(&self, name: &str) -> Vec<ServiceSnapshot> {
        let mut result = Vec::new();
        for instance in self.healthy_instances(name).await {
            let snapshot = instance.snapshot().await;
            // Health may have changed between the filter and the snapshot.
            if snapshot.is_healthy() {
                result.push(snapshot);
            }
        }
        result
    }

    /// Instances matching the filter; `None` returns everything
    pub async fn query(&self, filter: Option<&ServiceQuery>) -> Vec<ServiceSnapshot> {
        let candidates = match filter.and_then(|f| f.name.as_deref()) {
            Some(name) => self.instances_named(name).await,
            None => self.all_instances().await,
        };
        let mut result = Vec::new();
        for instance in candidates {
            let snapshot = instance.snapshot().await;
            if filter.map_or(true, |f| f.matches(&snapshot)) {
                result.push(snapshot);
            }
        }
        result.sort_by(|a, b| a.id().cmp(b.id()));
        result
    }

    pub async fn get_service(&self, service_id: &str) -> RegistryResult<ServiceSnapshot> {
        Ok(self.require_instance(service_id).await?.snapshot().await)
    }

    /// Every instance, ordered by ID
    pub async fn list_services(&self) -> Vec<ServiceSnapshot> {
        self.query(None).await
    }

    // =========================================================================
    // Runtime State
    // =========================================================================

    /// Force an instance's health state, emitting a transition event
    pub async fn set_health_state(
        &self,
        service_id: &str,
        state: HealthState,
    ) -> RegistryResult<HealthState> {
        let instance = self.require_instance(service_id).await?;
        let now_ms = self.io.now_ms();
        let old = instance.set_health(state, now_ms).await;
        if old != state {
            self.publish_transition(&instance, old, state, now_ms).await;
        }
        Ok(old)
    }

    /// Apply a probe outcome, emitting probe and transition events
    pub async fn record_probe_result(
        &self,
        service_id: &str,
        success: bool,
        failure_threshold: u32,
        reason: Option<&str>,
    ) -> RegistryResult<ProbeTransition> {
        let instance = self.require_instance(service_id).await?;
        let now_ms = self.io.now_ms();
        let transition = instance
            .record_probe(success, failure_threshold.max(1), now_ms)
            .await;
        let descriptor = instance.descriptor().await;

        let (event_type, message) = if success {
            (
                EventType::HealthCheckPassed,
                format!("health check passed for {}", service_id),
            )
        } else {
            (
                EventType::HealthCheckFailed,
                format!("health check failed for {}", service_id),
            )
        };
        let mut event = ServiceEvent::new(event_type, descriptor, now_ms, message)
            .with_detail("consecutive_failures", transition.consecutive_failures);
        if let Some(reason) = reason {
            event = event.with_detail("reason", reason);
        }
        self.events.publish(event).await;

        if transition.changed() {
            self.publish_transition(&instance, transition.old, transition.new, now_ms)
                .await;
        }
        Ok(transition)
    }

    async fn publish_transition(
        &self,
        instance: &ServiceInstance,
        old: HealthState,
        new: HealthState,
        now_ms: u64,
    ) {
        let event_type = match new {
            HealthState::Healthy => EventType::ServiceHealthy,
            HealthState::Unhealthy => EventType::ServiceUnhealthy,
            _ => EventType::ServiceStateChanged,
        };
        match new {
            HealthState::Unhealthy => warn!(
                service_id = %instance.id(),
                old_state = %old,
                "service became unhealthy"
            ),
            _ => info!(
                service_id = %instance.id(),
                old_state = %old,
                new_state = %new,
                "service state changed"
            ),
        }
        let message = format!("service {} changed from {} to {}", instance.id(), old, new);
        let event = ServiceEvent::new(event_type, instance.descriptor().await, now_ms, message)
            .with_detail("service_id", instance.id())
            .with_detail("old_state", old.to_string())
            .with_detail("new_state", new.to_string());
        self.events.publish(event).await;
    }

    pub async fn increment_connections(&self, service_id: &str) -> RegistryResult<u64> {
        Ok(self
            .require_instance(service_id)
            .await?
            .increment_connections())
    }

    pub async fn decrement_connections(&self, service_id: &str) -> RegistryResult<u64> {
        Ok(self
            .require_instance(service_id)
            .await?
            .decrement_connections())
    }

    pub async fn stats(&self) -> RegistryStats {
        let instances = self.all_instances().await;
        let mut services_by_state: HashMap<HealthState, usize> = HashMap::new();
        let mut services_by_name: HashMap<String, usize> = HashMap::new();
        let mut healthy_services = 0;

        for instance in &instances {
            let health = instance.health().await;
            *services_by_state.entry(health).or_default() += 1;
            *services_by_name
                .entry(instance.name().to_string())
                .or_default() += 1;
            if health.is_healthy() {
                healthy_services += 1;
            }
        }

        let now_ms = self.io.now_ms();
        RegistryStats {
            total_services: instances.len(),
            healthy_services,
            unhealthy_services: instances.len() - healthy_services,
            services_by_state,
            services_by_name,
            uptime_ms: now_ms.saturating_sub(self.started_at_ms),
            last_updated_ms: now_ms,
        }
    }

    // =========================================================================
    // Dependencies
    // =========================================================================

    /// Every declared dependency must have at least one healthy instance
    pub async fn check_dependencies(&self, service_id: &str) -> RegistryResult<()> {
        let instance = self.require_instance(service_id).await?;
        let dependencies = instance.descriptor().await.dependencies;

        for dependency in dependencies {
            let candidates = self.instances_named(&dependency).await;
            if candidates.is_empty() {
                return Err(RegistryError::DependencyNotMet {
                    service_id: service_id.to_string(),
                    dependency,
                    reason: "not registered".into(),
                });
            }
            let mut any_healthy = false;
            for candidate in &candidates {
                if candidate.is_healthy().await {
                    any_healthy = true;
                    break;
                }
            }
            if !any_healthy {
                return Err(RegistryError::DependencyNotMet {
                    service_id: service_id.to_string(),
                    dependency,
                    reason: "no healthy instances".into(),
                });
            }
        }
        Ok(())
    }

    /// Order service names so every dependency precedes its dependents
    ///
    /// Edges come from the first registered instance of each name and are
    /// restricted to names in the input. Ties keep input order.
    pub async fn resolve_dependencies(&self, names: &[String]) -> RegistryResult<Vec<String>> {
        let mut order: Vec<String> = Vec::with_capacity(names.len());
        let mut seen: HashSet<&str> = HashSet::with_capacity(names.len());
        for name in names {
            if seen.insert(name.as_str()) {
                order.push(name.clone());
            }
        }

        let mut dependencies: HashMap<String, Vec<String>> = HashMap::with_capacity(order.len());
        for name in &order {
            let first = self.instances_named(name).await.into_iter().next();
            let deps = match first {
                Some(instance) => instance.descriptor().await.dependencies,
                None => Vec::new(),
            };
            dependencies.insert(name.clone(), deps);
        }

        topological_order(&order, &dependencies)
    }

    /// Service name to the union of its instances' dependencies
    pub async fn dependency_graph(&self) -> BTreeMap<String, Vec<String>> {
        let mut graph: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for instance in self.all_instances().await {
            let descriptor = instance.descriptor().await;
            let entry = graph.entry(descriptor.name).or_default();
            entry.extend(descriptor.dependencies);
        }
        for deps in graph.values_mut() {
            deps.sort();
            deps.dedup();
        }
        graph
    }

    /// Fail if the registered services contain a dependency cycle
    pub async fn validate_dependency_graph(&self) -> RegistryResult<()> {
        let names = self.service_names().await;
        self.resolve_dependencies(&names).await.map(|_| ())
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub async fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.subscribe_with_filter(EventFilter::default(), callback)
            .await
    }

    pub async fn subscribe_with_filter<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(filter, Arc::new(callback)).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> RegistryResult<()> {
        if self.events.unsubscribe(id).await {
            Ok(())
        } else {
            Err(RegistryError::not_found("subscription", id.to_string()))
        }
    }

    pub async fn unsubscribe_all(&self) -> usize {
        self.events.unsubscribe_all().await
    }

    pub async fn subscription_stats(&self, id: SubscriptionId) -> RegistryResult<SubscriptionStats> {
        self.events
            .stats(id)
            .await
            .ok_or_else(|| RegistryError::not_found("subscription", id.to_string()))
    }

    /// Publish a caller-defined event about a registered instance
    pub async fn notify_service_change(
        &self,
        service_id: &str,
        event_type: impl Into<EventType>,
        details: HashMap<String, serde_json::Value>,
    ) -> RegistryResult<()> {
        let instance = self.require_instance(service_id).await?;
        let event_type = event_type.into();
        let message = format!("{} for {}", event_type, service_id);
        let mut event =
            ServiceEvent::new(event_type, instance.descriptor().await, self.io.now_ms(), message);
        event.details = details;
        self.events.publish(event).await;
        Ok(())
    }

    /// Most recent events, oldest first
    pub async fn event_history(&self, limit: usize) -> Vec<ServiceEvent> {
        self.events.history(limit).await
    }
}

/// Kahn's algorithm over `names`; `dependencies[n]` lists what `n` needs
fn topological_order(
    names: &[String],
    dependencies: &HashMap<String, Vec<String>>,
) -> RegistryResult<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = names.iter().map(|n| (n.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::with_capacity(names.len());

    for name in names {
        for dep in dependencies.get(name).into_iter().flatten() {
            if in_degree.contains_key(dep.as_str()) {
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
                *in_degree.entry(name.as_str()).or_default() += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| in_degree.get(n) == Some(&0))
        .collect();
    let mut result = Vec::with_capacity(names.len());

    while let Some(current) = queue.pop_front() {
        result.push(current.to_string());
        for &dependent in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }

    if result.len() != names.len() {
        let services: Vec<String> = names
            .iter()
            .filter(|n| in_degree.get(n.as_str()).is_some_and(|d| *d > 0))
            .cloned()
            .collect();
        return Err(RegistryError::DependencyCycle { services });
    }
    Ok(result)
}
