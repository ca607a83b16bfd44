//! Extended registry
//!
//! TigerStyle: One owner for every subsystem, explicit feature gates,
//! bounded background work.
//!
//! `ExtendedRegistry` composes the store, health checker and load balancer
//! with the optional version, metrics and failover managers. Switched-off
//! features answer with `Unavailable` instead of silently doing nothing.

use crate::balancer::{LoadBalancer, LoadBalancingStats, LoadSample, SelectionContext, Strategy};
use crate::error::{RegistryError, RegistryResult};
use crate::events::{EventFilter, ServiceEvent, SubscriptionId};
use crate::failover::{
    CircuitBreaker, CircuitState, FailoverConfig, FailoverManager, FailoverResult,
    FailoverStatistics,
};
use crate::health::{HealthCheckOutcome, HealthChecker};
use crate::metrics::{
    AggregatedMetrics, AlertSeverity, AlertThresholds, AlertType, ExportFormat, MetricsManager,
    MetricsStatistics, ServiceAlert, ServiceMetrics,
};
use crate::service::{ServiceDescriptor, ServiceSnapshot};
use crate::store::{RegistryStats, ServiceQuery, ServiceStore, ServiceUpdate};
use crate::task::{PeriodicTask, StopOutcome};
use crate::version::{CompatibilityReport, SemVer, VersionManager, VersionStatistics};
use beacon_core::config::BeaconConfig;
use beacon_core::io::IoContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Groups, Statistics, Topology
// =============================================================================

#[derive(Debug, Clone)]
struct GroupEntry {
    /// Instance IDs in insertion order
    members: Vec<String>,
    created_at_ms: u64,
}

/// Live view of a group; members deregistered since are omitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub name: String,
    pub created_at_ms: u64,
    pub services: Vec<ServiceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedRegistryStats {
    pub registry: RegistryStats,
    pub versions: Option<VersionStatistics>,
    pub metrics: Option<MetricsStatistics>,
    pub failover: Option<FailoverStatistics>,
    pub group_count: usize,
    pub strategy_usage: HashMap<Strategy, u64>,
}

/// One logical service in the topology graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub name: String,
    pub instances: Vec<String>,
    pub healthy_instances: usize,
    /// Distinct versions across instances, ascending
    pub versions: Vec<String>,
    /// Names this service requires
    pub dependencies: Vec<String>,
    /// Names that require this service
    pub dependents: Vec<String>,
    pub metrics: Option<AggregatedMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTopology {
    pub nodes: BTreeMap<String, ServiceNode>,
    pub groups: BTreeMap<String, Vec<String>>,
    pub generated_at_ms: u64,
}

/// Entries removed by one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub metrics_removed: usize,
    pub balancer_entries_removed: usize,
    pub failover_entries_removed: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.metrics_removed + self.balancer_entries_removed + self.failover_entries_removed
    }
}

// =============================================================================
// Cleanup
// =============================================================================

/// Handles the cleanup loop needs, cloned out of the registry
#[derive(Debug, Clone)]
struct Janitor {
    balancer: Arc<LoadBalancer>,
    metrics: Option<Arc<MetricsManager>>,
    failover: Option<Arc<FailoverManager>>,
    metrics_retention: Duration,
    stale_retention: Duration,
}

impl Janitor {
    async fn sweep(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if let Some(metrics) = &self.metrics {
            report.metrics_removed = metrics.cleanup(self.metrics_retention).await;
        }
        report.balancer_entries_removed =
            self.balancer.cleanup_stale_data(self.stale_retention).await;
        if let Some(failover) = &self.failover {
            report.failover_entries_removed = failover.prune_deregistered().await;
        }
        debug!(removed = report.total(), "cleanup sweep completed");
        report
    }
}

// =============================================================================
// Extended Registry
// =============================================================================

/// Service registry with versioning, metrics, failover and grouping
#[derive(Debug)]
pub struct ExtendedRegistry {
    config: BeaconConfig,
    store: Arc<ServiceStore>,
    health: Arc<HealthChecker>,
    balancer: Arc<LoadBalancer>,
    versions: Option<Arc<VersionManager>>,
    metrics: Option<Arc<MetricsManager>>,
    failover: Option<Arc<FailoverManager>>,
    groups: RwLock<BTreeMap<String, GroupEntry>>,
    cleanup: Mutex<Option<PeriodicTask>>,
}

impl ExtendedRegistry {
    /// Create a registry with production I/O providers
    pub fn new(config: BeaconConfig) -> RegistryResult<Self> {
        Self::with_io(config, IoContext::production())
    }

    /// Create a registry with injected I/O providers
    pub fn with_io(config: BeaconConfig, io: IoContext) -> RegistryResult<Self> {
        config.validate()?;

        let store = Arc::new(ServiceStore::with_io(config.registry.clone(), io.clone()));
        let health = Arc::new(HealthChecker::new(store.clone(), config.health.clone()));
        let balancer = Arc::new(LoadBalancer::new(store.clone(), config.balancer.clone()));
        let toggles = &config.extended;

        let versions = toggles
            .enable_version_management
            .then(|| Arc::new(VersionManager::new(io.clone())));
        let metrics = toggles
            .enable_metrics
            .then(|| Arc::new(MetricsManager::new(config.metrics.clone(), io.clone())));
        // Metrics are fed by record_service_call directly, not through failover.
        let failover = toggles
            .enable_failover
            .then(|| Arc::new(FailoverManager::new(store.clone()).with_health_checker(health.clone())));

        info!(
            version_management = toggles.enable_version_management,
            metrics = toggles.enable_metrics,
            failover = toggles.enable_failover,
            extended_lb = toggles.enable_extended_lb,
            "extended registry created"
        );

        Ok(Self {
            config,
            store,
            health,
            balancer,
            versions,
            metrics,
            failover,
            groups: RwLock::new(BTreeMap::new()),
            cleanup: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ServiceStore> {
        &self.store
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    fn version_manager(&self) -> RegistryResult<&Arc<VersionManager>> {
        self.versions
            .as_ref()
            .ok_or_else(|| RegistryError::feature_disabled("version management"))
    }

    fn metrics_manager(&self) -> RegistryResult<&Arc<MetricsManager>> {
        self.metrics
            .as_ref()
            .ok_or_else(|| RegistryError::feature_disabled("metrics"))
    }

    fn failover_manager(&self) -> RegistryResult<&Arc<FailoverManager>> {
        self.failover
            .as_ref()
            .ok_or_else(|| RegistryError::feature_disabled("failover"))
    }

    // =========================================================================
    // Core Registry
    // =========================================================================

    /// Register an instance; its version is indexed when it parses
    pub async fn register(&self, descriptor: ServiceDescriptor) -> RegistryResult<()> {
        let id = descriptor.id.clone();
        let name = descriptor.name.clone();
        let version = descriptor.version.clone();
        self.store.register(descriptor).await?;

        if let Some(versions) = &self.versions {
            if let Err(err) = versions.register_version(&name, &version, &id).await {
                debug!(service_id = %id, version = %version, error = %err, "version not indexed");
            }
        }
        self.attach_failover(&id).await
    }

    /// Register an instance whose version must be valid semver
    pub async fn register_with_version(&self, descriptor: ServiceDescriptor) -> RegistryResult<SemVer> {
        let versions = self.version_manager()?;
        let version = SemVer::parse(&descriptor.version)?;
        let id = descriptor.id.clone();
        let name = descriptor.name.clone();

        self.store.register(descriptor).await?;
        versions
            .register_version(&name, &version.to_string(), &id)
            .await?;
        self.attach_failover(&id).await?;
        Ok(version)
    }

    async fn attach_failover(&self, service_id: &str) -> RegistryResult<()> {
        if let Some(failover) = &self.failover {
            failover
                .configure(service_id, self.config.failover.clone())
                .await?;
        }
        Ok(())
    }

    /// Deregister an instance and drop it from groups, versions and failover
    pub async fn deregister(&self, service_id: &str) -> RegistryResult<ServiceDescriptor> {
        let descriptor = self.store.deregister(service_id).await?;
        self.forget(&descriptor).await;
        Ok(descriptor)
    }

    async fn forget(&self, descriptor: &ServiceDescriptor) {
        {
            let mut groups = self.groups.write().await;
            for group in groups.values_mut() {
                group.members.retain(|id| id != &descriptor.id);
            }
        }
        if let Some(versions) = &self.versions {
            // Unparseable versions were never indexed.
            let _ = versions
                .deregister_version(&descriptor.name, &descriptor.version, &descriptor.id)
                .await;
        }
        if let Some(failover) = &self.failover {
            let _ = failover.remove(&descriptor.id).await;
        }
    }

    pub async fn update_service(
        &self,
        service_id: &str,
        update: ServiceUpdate,
    ) -> RegistryResult<ServiceDescriptor> {
        self.store.update_service(service_id, update).await
    }

    pub async fn discover(&self, name: &str) -> Vec<ServiceSnapshot> {
        self.store.discover(name).await
    }

    pub async fn query(&self, filter: Option<&ServiceQuery>) -> Vec<ServiceSnapshot> {
        self.store.query(filter).await
    }

    pub async fn get_service(&self, service_id: &str) -> RegistryResult<ServiceSnapshot> {
        self.store.get_service(service_id).await
    }

    pub async fn list_services(&self) -> Vec<ServiceSnapshot> {
        self.store.list_services().await
    }

    pub async fn check_dependencies(&self, service_id: &str) -> RegistryResult<()> {
        self.store.check_dependencies(service_id).await
    }

    pub async fn resolve_dependencies(&self, names: &[String]) -> RegistryResult<Vec<String>> {
        self.store.resolve_dependencies(names).await
    }

    pub async fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(callback).await
    }

    pub async fn subscribe_with_filter<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.store.subscribe_with_filter(filter, callback).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> RegistryResult<()> {
        self.store.unsubscribe(id).await
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn start_health_check(&self) {
        self.health.start().await;
    }

    pub async fn stop_health_check(&self) -> StopOutcome {
        self.health.stop().await
    }

    pub async fn check_health(&self, service_id: &str) -> RegistryResult<HealthCheckOutcome> {
        self.health.check_health(service_id).await
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Select an instance without client context
    pub async fn select_service(
        &self,
        name: &str,
        strategy: Strategy,
    ) -> RegistryResult<ServiceSnapshot> {
        self.select_with_extended_strategy(name, strategy, &SelectionContext::default())
            .await
    }

    /// Select an instance; strategies beyond the basic four need extended LB
    pub async fn select_with_extended_strategy(
        &self,
        name: &str,
        strategy: Strategy,
        context: &SelectionContext,
    ) -> RegistryResult<ServiceSnapshot> {
        if !strategy.is_basic() && !self.config.extended.enable_extended_lb {
            return Err(RegistryError::feature_disabled(&format!(
                "extended load balancing ({})",
                strategy
            )));
        }
        self.balancer.select(name, strategy, context).await
    }

    pub async fn update_service_load(&self, service_id: &str, sample: LoadSample) -> RegistryResult<()> {
        self.balancer.update_service_load(service_id, sample).await
    }

    pub async fn load_balancing_stats(&self, name: &str) -> RegistryResult<LoadBalancingStats> {
        self.balancer.load_balancing_stats(name).await
    }

    // =========================================================================
    // Call Recording
    // =========================================================================

    /// Feed one call outcome to metrics, response-time tracking and failover
    pub async fn record_service_call(
        &self,
        service_id: &str,
        success: bool,
        duration: Duration,
    ) -> RegistryResult<()> {
        let instance = self.store.require_instance(service_id).await?;

        if let Some(metrics) = &self.metrics {
            metrics
                .record_call(service_id, instance.name(), success, duration)
                .await;
        }
        self.balancer.record_response_time(service_id, duration).await;
        if let Some(failover) = &self.failover {
            failover.record_service_call(service_id, success, duration).await;
        }
        Ok(())
    }

    // =========================================================================
    // Versions
    // =========================================================================

    pub async fn get_services_by_version(
        &self,
        name: &str,
        version: &str,
    ) -> RegistryResult<Vec<ServiceSnapshot>> {
        let ids = self.version_manager()?.services_by_version(name, version).await?;
        Ok(self.snapshots(&ids).await)
    }

    /// Healthy instances whose version satisfies `required`
    pub async fn get_compatible_services(
        &self,
        name: &str,
        required: &str,
    ) -> RegistryResult<Vec<ServiceSnapshot>> {
        let ids = self.version_manager()?.compatible_services(name, required).await?;
        Ok(self
            .snapshots(&ids)
            .await
            .into_iter()
            .filter(|snapshot| snapshot.is_healthy())
            .collect())
    }

    pub async fn check_compatibility(
        &self,
        name: &str,
        version: &str,
        required: &str,
    ) -> RegistryResult<CompatibilityReport> {
        self.version_manager()?
            .check_compatibility(name, version, required)
            .await
    }

    pub async fn list_versions(&self, name: &str) -> RegistryResult<Vec<SemVer>> {
        Ok(self.version_manager()?.list_versions(name).await)
    }

    pub async fn deprecate_version(
        &self,
        name: &str,
        version: &str,
        reason: &str,
        replacement: Option<&str>,
    ) -> RegistryResult<()> {
        self.version_manager()?
            .deprecate_version(name, version, reason, replacement)
            .await
    }

    async fn snapshots(&self, ids: &[String]) -> Vec<ServiceSnapshot> {
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(instance) = self.store.instance(id).await {
                snapshots.push(instance.snapshot().await);
            }
        }
        snapshots
    }

    // =========================================================================
    // Metrics and Alerts
    // =========================================================================

    pub async fn get_metrics(&self, service_id: &str) -> RegistryResult<ServiceMetrics> {
        self.metrics_manager()?.get_metrics(service_id).await
    }

    pub async fn aggregated_metrics(&self, name: &str) -> RegistryResult<AggregatedMetrics> {
        self.metrics_manager()?.aggregated_metrics(name).await
    }

    pub async fn set_alert_thresholds(
        &self,
        service_id: &str,
        thresholds: AlertThresholds,
    ) -> RegistryResult<()> {
        self.metrics_manager()?
            .set_thresholds(service_id, thresholds)
            .await
    }

    pub async fn create_alert(
        &self,
        service_id: &str,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        details: HashMap<String, serde_json::Value>,
    ) -> RegistryResult<ServiceAlert> {
        self.metrics_manager()?
            .create_alert(service_id, alert_type, severity, message, details)
            .await
    }

    pub async fn resolve_alert(&self, alert_id: &str) -> RegistryResult<ServiceAlert> {
        self.metrics_manager()?.resolve_alert(alert_id).await
    }

    pub async fn active_alerts(&self, service_id: Option<&str>) -> RegistryResult<Vec<ServiceAlert>> {
        Ok(self.metrics_manager()?.active_alerts(service_id).await)
    }

    pub async fn alert_history(&self, since_ms: u64, until_ms: u64) -> RegistryResult<Vec<ServiceAlert>> {
        Ok(self.metrics_manager()?.alert_history(since_ms, until_ms).await)
    }

    pub async fn export_metrics(&self, format: ExportFormat) -> RegistryResult<String> {
        self.metrics_manager()?.export(format).await
    }

    // =========================================================================
    // Failover
    // =========================================================================

    pub async fn configure_failover(
        &self,
        service_id: &str,
        config: FailoverConfig,
    ) -> RegistryResult<()> {
        self.store.require_instance(service_id).await?;
        self.failover_manager()?.configure(service_id, config).await
    }

    pub async fn get_failover_config(&self, service_id: &str) -> RegistryResult<FailoverConfig> {
        self.failover_manager()?.get_config(service_id).await
    }

    pub async fn get_circuit_breaker(&self, service_id: &str) -> RegistryResult<CircuitBreaker> {
        self.failover_manager()?.get_circuit_breaker(service_id).await
    }

    pub async fn update_circuit_breaker_state(
        &self,
        service_id: &str,
        state: CircuitState,
    ) -> RegistryResult<()> {
        self.failover_manager()?
            .update_circuit_breaker_state(service_id, state)
            .await
    }

    pub async fn can_make_call(&self, service_id: &str) -> RegistryResult<bool> {
        Ok(self.failover_manager()?.can_make_call(service_id).await)
    }

    pub async fn attempt_failover(
        &self,
        name: &str,
        failed_id: &str,
    ) -> RegistryResult<FailoverResult> {
        self.failover_manager()?.attempt_failover(name, failed_id).await
    }

    pub async fn attempt_recovery(&self, service_id: &str) -> RegistryResult<FailoverResult> {
        self.failover_manager()?.attempt_recovery(service_id).await
    }

    // =========================================================================
    // Batch Operations
    // =========================================================================

    /// Validate every descriptor, then register each one
    ///
    /// A validation failure rejects the whole batch; registration failures
    /// are reported per descriptor.
    pub async fn batch_register(
        &self,
        descriptors: Vec<ServiceDescriptor>,
    ) -> RegistryResult<Vec<RegistryResult<()>>> {
        for descriptor in &descriptors {
            descriptor.validate()?;
        }

        let mut results = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            results.push(self.register(descriptor).await);
        }
        debug_assert!(results.len() <= results.capacity());
        Ok(results)
    }

    pub async fn batch_deregister(
        &self,
        service_ids: &[String],
    ) -> Vec<RegistryResult<ServiceDescriptor>> {
        let mut results = Vec::with_capacity(service_ids.len());
        for id in service_ids {
            results.push(self.deregister(id).await);
        }
        results
    }

    pub async fn batch_update(
        &self,
        updates: Vec<(String, ServiceUpdate)>,
    ) -> Vec<RegistryResult<ServiceDescriptor>> {
        let mut results = Vec::with_capacity(updates.len());
        for (id, update) in updates {
            results.push(self.update_service(&id, update).await);
        }
        results
    }

    // =========================================================================
    // Groups and Tags
    // =========================================================================

    /// Create a group from existing instances
    pub async fn create_group(&self, name: &str, service_ids: &[String]) -> RegistryResult<()> {
        if name.is_empty() {
            return Err(RegistryError::invalid_input("group", "name must not be empty"));
        }
        let mut groups = self.groups.write().await;
        if groups.contains_key(name) {
            return Err(RegistryError::ResourceAlreadyExists {
                resource: "group",
                id: name.to_string(),
            });
        }

        let mut members: Vec<String> = Vec::with_capacity(service_ids.len());
        for id in service_ids {
            self.store.require_instance(id).await?;
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        groups.insert(
            name.to_string(),
            GroupEntry {
                members,
                created_at_ms: self.store.io().now_ms(),
            },
        );
        info!(group = %name, "group created");
        Ok(())
    }

    /// Add an instance to a group; adding an existing member is a no-op
    pub async fn add_to_group(&self, name: &str, service_id: &str) -> RegistryResult<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(name)
            .ok_or_else(|| RegistryError::not_found("group", name))?;
        // Checked under the groups lock so a concurrent deregister cannot
        // leave a stale member behind.
        self.store.require_instance(service_id).await?;
        if !group.members.iter().any(|id| id == service_id) {
            group.members.push(service_id.to_string());
        }
        Ok(())
    }

    pub async fn remove_from_group(&self, name: &str, service_id: &str) -> RegistryResult<()> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(name)
            .ok_or_else(|| RegistryError::not_found("group", name))?;
        let before = group.members.len();
        group.members.retain(|id| id != service_id);
        if group.members.len() == before {
            return Err(RegistryError::not_found("group member", service_id));
        }
        Ok(())
    }

    pub async fn delete_group(&self, name: &str) -> RegistryResult<()> {
        self.groups
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::not_found("group", name))
    }

    pub async fn get_group(&self, name: &str) -> RegistryResult<ServiceGroup> {
        let entry = self
            .groups
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::not_found("group", name))?;
        Ok(ServiceGroup {
            name: name.to_string(),
            created_at_ms: entry.created_at_ms,
            services: self.snapshots(&entry.members).await,
        })
    }

    /// Group names, sorted
    pub async fn list_groups(&self) -> Vec<String> {
        self.groups.read().await.keys().cloned().collect()
    }

    /// Instances carrying all (or any) of `tags`; no tags matches everything
    pub async fn get_services_by_tags(&self, tags: &[String], match_all: bool) -> Vec<ServiceSnapshot> {
        self.store
            .list_services()
            .await
            .into_iter()
            .filter(|snapshot| {
                if tags.is_empty() {
                    return true;
                }
                let has = |tag: &String| snapshot.descriptor.tags.contains(tag);
                if match_all {
                    tags.iter().all(has)
                } else {
                    tags.iter().any(has)
                }
            })
            .collect()
    }

    // =========================================================================
    // Statistics and Topology
    // =========================================================================

    pub async fn statistics(&self) -> ExtendedRegistryStats {
        let versions = match &self.versions {
            Some(versions) => Some(versions.statistics().await),
            None => None,
        };
        let metrics = match &self.metrics {
            Some(metrics) => Some(metrics.statistics().await),
            None => None,
        };
        let failover = match &self.failover {
            Some(failover) => Some(failover.statistics().await),
            None => None,
        };

        ExtendedRegistryStats {
            registry: self.store.stats().await,
            versions,
            metrics,
            failover,
            group_count: self.groups.read().await.len(),
            strategy_usage: self.balancer.strategy_usage().await,
        }
    }

    /// Service graph keyed by name, with dependents derived from dependencies
    pub async fn topology(&self) -> ServiceTopology {
        #[derive(Default)]
        struct Acc {
            instances: Vec<String>,
            healthy: usize,
            versions: BTreeSet<SemVerKey>,
            dependencies: BTreeSet<String>,
        }

        let mut by_name: BTreeMap<String, Acc> = BTreeMap::new();
        for snapshot in self.store.list_services().await {
            let acc = by_name.entry(snapshot.descriptor.name.clone()).or_default();
            acc.instances.push(snapshot.descriptor.id.clone());
            if snapshot.is_healthy() {
                acc.healthy += 1;
            }
            acc.versions.insert(SemVerKey::new(&snapshot.descriptor.version));
            acc.dependencies
                .extend(snapshot.descriptor.dependencies.iter().cloned());
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, acc) in &by_name {
            for dependency in &acc.dependencies {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }

        let mut nodes = BTreeMap::new();
        for (name, acc) in by_name {
            let metrics = match &self.metrics {
                Some(metrics) => metrics.aggregated_metrics(&name).await.ok(),
                None => None,
            };
            let node = ServiceNode {
                instances: acc.instances,
                healthy_instances: acc.healthy,
                versions: acc.versions.into_iter().map(|v| v.raw).collect(),
                dependencies: acc.dependencies.into_iter().collect(),
                dependents: dependents
                    .remove(&name)
                    .map(|set| set.into_iter().collect())
                    .unwrap_or_default(),
                metrics,
                name: name.clone(),
            };
            nodes.insert(name, node);
        }

        let groups = self
            .groups
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.members.clone()))
            .collect();

        ServiceTopology {
            nodes,
            groups,
            generated_at_ms: self.store.io().now_ms(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    fn janitor(&self) -> Janitor {
        Janitor {
            balancer: self.balancer.clone(),
            metrics: self.metrics.clone(),
            failover: self.failover.clone(),
            metrics_retention: Duration::from_millis(self.config.metrics.retention_ms),
            stale_retention: Duration::from_millis(self.config.balancer.stale_retention_ms),
        }
    }

    /// Run one cleanup pass now
    pub async fn run_cleanup(&self) -> CleanupReport {
        self.janitor().sweep().await
    }

    /// Start the periodic cleanup loop; a no-op when already running
    pub async fn start_cleanup(&self) {
        let mut task = self.cleanup.lock().await;
        if task.as_ref().is_some_and(PeriodicTask::is_running) {
            return;
        }
        let janitor = self.janitor();
        let interval = Duration::from_millis(self.config.extended.cleanup_interval_ms);
        *task = Some(PeriodicTask::spawn("registry-cleanup", interval, move || {
            let janitor = janitor.clone();
            async move {
                janitor.sweep().await;
            }
        }));
        info!(
            interval_ms = self.config.extended.cleanup_interval_ms,
            "cleanup loop started"
        );
    }

    pub async fn stop_cleanup(&self) -> StopOutcome {
        let Some(mut task) = self.cleanup.lock().await.take() else {
            return StopOutcome::NotRunning;
        };
        task.stop(Duration::from_millis(self.config.extended.stop_grace_ms))
            .await
    }

    pub async fn is_cleanup_running(&self) -> bool {
        self.cleanup
            .lock()
            .await
            .as_ref()
            .is_some_and(PeriodicTask::is_running)
    }

    /// Stop both loops, then deregister everything
    ///
    /// Returns the number of instances deregistered.
    pub async fn shutdown(&self) -> usize {
        let health = self.health.stop().await;
        let cleanup = self.stop_cleanup().await;
        if matches!(health, StopOutcome::Aborted) || matches!(cleanup, StopOutcome::Aborted) {
            warn!(?health, ?cleanup, "background loop aborted during shutdown");
        }

        for snapshot in self.store.list_services().await {
            self.forget(&snapshot.descriptor).await;
        }
        self.groups.write().await.clear();
        let removed = self.store.shutdown().await;
        info!(removed, "extended registry shut down");
        removed
    }
}

/// Orders unparseable versions first, lexically, then the rest semantically
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SemVerKey {
    parsed: Option<SemVer>,
    raw: String,
}

impl SemVerKey {
    fn new(raw: &str) -> Self {
        Self {
            parsed: SemVer::parse(raw).ok(),
            raw: raw.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::service::HealthState;
    use beacon_core::io::ManualClock;

    fn registry() -> ExtendedRegistry {
        ExtendedRegistry::new(BeaconConfig::for_testing()).unwrap()
    }

    fn manual_registry(clock: Arc<ManualClock>) -> ExtendedRegistry {
        ExtendedRegistry::with_io(BeaconConfig::for_testing(), IoContext::manual(clock, 7)).unwrap()
    }

    fn descriptor(id: &str, name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(id, name, "127.0.0.1", 8080)
    }

    fn ids(snapshots: &[ServiceSnapshot]) -> Vec<&str> {
        snapshots.iter().map(ServiceSnapshot::id).collect()
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = BeaconConfig::for_testing();
        config.failover.failure_threshold = 0;
        let err = ExtendedRegistry::new(config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_versioned_registration() {
        let registry = registry();
        registry
            .register_with_version(descriptor("a", "api").with_version("1.2.0"))
            .await
            .unwrap();
        registry
            .register_with_version(descriptor("b", "api").with_version("2.0.0"))
            .await
            .unwrap();

        let err = registry
            .register_with_version(descriptor("c", "api").with_version("two"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(registry.get_service("c").await.is_err());

        let v1 = registry.get_services_by_version("api", "1.2.0").await.unwrap();
        assert_eq!(ids(&v1), vec!["a"]);
        let compatible = registry.get_compatible_services("api", "1.0.0").await.unwrap();
        assert_eq!(ids(&compatible), vec!["a"]);

        registry.deregister("a").await.unwrap();
        assert_eq!(
            registry.list_versions("api").await.unwrap(),
            vec![SemVer::new(2, 0, 0)]
        );
    }

    #[tokio::test]
    async fn test_disabled_features_are_unavailable() {
        let mut config = BeaconConfig::for_testing();
        config.extended.enable_version_management = false;
        config.extended.enable_metrics = false;
        config.extended.enable_failover = false;
        config.extended.enable_extended_lb = false;
        let registry = ExtendedRegistry::new(config).unwrap();
        registry.register(descriptor("a", "api")).await.unwrap();

        let errors = [
            registry.list_versions("api").await.unwrap_err(),
            registry.get_metrics("a").await.unwrap_err(),
            registry.get_circuit_breaker("a").await.unwrap_err(),
            registry
                .select_service("api", Strategy::ConsistentHash)
                .await
                .unwrap_err(),
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::Unavailable);
        }

        // Basic strategies and call recording still work.
        assert_eq!(
            registry
                .select_service("api", Strategy::RoundRobin)
                .await
                .unwrap()
                .id(),
            "a"
        );
        registry
            .record_service_call("a", true, Duration::from_millis(5))
            .await
            .unwrap();
        let stats = registry.statistics().await;
        assert!(stats.versions.is_none() && stats.metrics.is_none() && stats.failover.is_none());
    }

    #[tokio::test]
    async fn test_record_service_call_fans_out() {
        let registry = registry();
        registry.register(descriptor("a", "api")).await.unwrap();

        registry
            .record_service_call("a", true, Duration::from_millis(100))
            .await
            .unwrap();
        registry
            .record_service_call("a", false, Duration::from_millis(200))
            .await
            .unwrap();

        let metrics = registry.get_metrics("a").await.unwrap();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert!(registry
            .load_balancer()
            .average_response_time_ms("a")
            .await
            .is_some());
        let breaker = registry.get_circuit_breaker("a").await.unwrap();
        assert_eq!(breaker.failure_count, 1);

        let err = registry
            .record_service_call("ghost", true, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_breaker_opens_through_facade() {
        let registry = registry();
        registry.register(descriptor("a", "api")).await.unwrap();
        registry.register(descriptor("b", "api")).await.unwrap();
        registry
            .configure_failover(
                "a",
                FailoverConfig {
                    failure_threshold: 2,
                    ..FailoverConfig::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..2 {
            registry
                .record_service_call("a", false, Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(
            registry.get_circuit_breaker("a").await.unwrap().state,
            CircuitState::Open
        );
        assert!(!registry.can_make_call("a").await.unwrap());

        let result = registry.attempt_failover("api", "a").await.unwrap();
        assert!(result.success);
        assert_eq!(result.failover_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_batch_register_validates_first() {
        let registry = registry();
        let err = registry
            .batch_register(vec![descriptor("a", "api"), descriptor("", "api")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(registry.list_services().await.is_empty());

        registry.register(descriptor("b", "api")).await.unwrap();
        let results = registry
            .batch_register(vec![descriptor("a", "api"), descriptor("b", "api")])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::AlreadyExists);

        let updates = registry
            .batch_update(vec![
                ("a".to_string(), ServiceUpdate::new().weight(5)),
                ("zzz".to_string(), ServiceUpdate::new().weight(5)),
            ])
            .await;
        assert_eq!(updates[0].as_ref().unwrap().weight, 5);
        assert!(updates[1].is_err());

        let removed = registry
            .batch_deregister(&["a".to_string(), "b".to_string(), "zzz".to_string()])
            .await;
        assert_eq!(removed.iter().filter(|r| r.is_ok()).count(), 2);
        assert!(registry.list_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_groups() {
        let registry = registry();
        registry.register(descriptor("a", "api")).await.unwrap();
        registry.register(descriptor("b", "db")).await.unwrap();

        registry.create_group("edge", &["a".to_string()]).await.unwrap();
        let err = registry.create_group("edge", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        let err = registry
            .create_group("broken", &["ghost".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        registry.add_to_group("edge", "b").await.unwrap();
        registry.add_to_group("edge", "b").await.unwrap();
        assert_eq!(ids(&registry.get_group("edge").await.unwrap().services), vec!["a", "b"]);

        let err = registry.add_to_group("edge", "ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = registry.add_to_group("nope", "a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        registry.deregister("a").await.unwrap();
        assert_eq!(ids(&registry.get_group("edge").await.unwrap().services), vec!["b"]);

        registry.remove_from_group("edge", "b").await.unwrap();
        assert!(registry.get_group("edge").await.unwrap().services.is_empty());
        assert_eq!(registry.list_groups().await, vec!["edge"]);
        registry.delete_group("edge").await.unwrap();
        assert!(registry.list_groups().await.is_empty());
    }

    #[tokio::test]
    async fn test_services_by_tags() {
        let registry = registry();
        registry
            .register(descriptor("a", "api").with_tag("prod").with_tag("eu"))
            .await
            .unwrap();
        registry
            .register(descriptor("b", "api").with_tag("prod"))
            .await
            .unwrap();
        registry.register(descriptor("c", "api")).await.unwrap();

        let tags = vec!["prod".to_string(), "eu".to_string()];
        assert_eq!(ids(&registry.get_services_by_tags(&tags, true).await), vec!["a"]);
        assert_eq!(
            ids(&registry.get_services_by_tags(&tags, false).await),
            vec!["a", "b"]
        );
        assert_eq!(registry.get_services_by_tags(&[], true).await.len(), 3);
    }

    #[tokio::test]
    async fn test_topology() {
        let registry = registry();
        registry
            .register(descriptor("web-1", "web").with_dependency("api").with_version("1.0.0"))
            .await
            .unwrap();
        registry
            .register(descriptor("api-1", "api").with_dependency("db").with_version("1.10.0"))
            .await
            .unwrap();
        registry
            .register(descriptor("api-2", "api").with_dependency("db").with_version("1.9.0"))
            .await
            .unwrap();
        registry.register(descriptor("db-1", "db")).await.unwrap();
        registry
            .record_service_call("api-1", true, Duration::from_millis(10))
            .await
            .unwrap();
        registry.create_group("backend", &["db-1".to_string()]).await.unwrap();

        let topology = registry.topology().await;
        let api = &topology.nodes["api"];
        assert_eq!(api.instances, vec!["api-1", "api-2"]);
        assert_eq!(api.healthy_instances, 2);
        assert_eq!(api.versions, vec!["1.9.0", "1.10.0"]);
        assert_eq!(api.dependencies, vec!["db"]);
        assert_eq!(api.dependents, vec!["web"]);
        assert_eq!(api.metrics.as_ref().unwrap().total_requests, 1);
        assert_eq!(topology.nodes["db"].dependents, vec!["api"]);
        assert!(topology.nodes["web"].dependents.is_empty());
        assert_eq!(topology.groups["backend"], vec!["db-1"]);
    }

    #[tokio::test]
    async fn test_statistics() {
        let registry = registry();
        registry.register(descriptor("a", "api")).await.unwrap();
        registry.register(descriptor("b", "api")).await.unwrap();
        registry.create_group("g", &[]).await.unwrap();
        registry.select_service("api", Strategy::Random).await.unwrap();
        registry
            .store()
            .set_health_state("b", HealthState::Unhealthy)
            .await
            .unwrap();

        let stats = registry.statistics().await;
        assert_eq!(stats.registry.total_services, 2);
        assert_eq!(stats.registry.healthy_services, 1);
        assert_eq!(stats.group_count, 1);
        assert_eq!(stats.strategy_usage.get(&Strategy::Random), Some(&1));
        assert_eq!(stats.versions.unwrap().instances, 2);
        assert_eq!(stats.failover.unwrap().configured_instances, 2);
    }

    #[tokio::test]
    async fn test_run_cleanup_evicts_stale_state() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = manual_registry(clock.clone());
        registry.register(descriptor("a", "api")).await.unwrap();
        registry
            .record_service_call("a", true, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(registry.run_cleanup().await, CleanupReport::default());

        let retention = registry
            .config()
            .metrics
            .retention_ms
            .max(registry.config().balancer.stale_retention_ms);
        clock.advance_ms(retention + 1);
        let report = registry.run_cleanup().await;
        assert_eq!(report.metrics_removed, 1);
        assert_eq!(report.balancer_entries_removed, 1);
        assert!(registry.get_metrics("a").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_loop_lifecycle() {
        let registry = registry();
        assert_eq!(registry.stop_cleanup().await, StopOutcome::NotRunning);

        registry.start_cleanup().await;
        registry.start_cleanup().await;
        assert!(registry.is_cleanup_running().await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(registry.stop_cleanup().await, StopOutcome::Graceful);
        assert!(!registry.is_cleanup_running().await);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let registry = registry();
        registry.register(descriptor("a", "api")).await.unwrap();
        registry.register(descriptor("b", "api")).await.unwrap();
        registry.create_group("g", &["a".to_string()]).await.unwrap();
        registry.start_health_check().await;
        registry.start_cleanup().await;

        assert_eq!(registry.shutdown().await, 2);
        assert!(!registry.health_checker().is_running().await);
        assert!(!registry.is_cleanup_running().await);
        assert!(registry.list_groups().await.is_empty());
        assert_eq!(registry.statistics().await.versions.unwrap().versions, 0);

        let err = registry.register(descriptor("c", "api")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }
}
