//! Service versions and compatibility
//!
//! TigerStyle: Versions parsed once at the boundary, ordered by semantic
//! precedence, stored sorted.

use crate::error::{RegistryError, RegistryResult};
use beacon_core::io::IoContext;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// SemVer
// =============================================================================

/// `major.minor.patch[-pre][+build]`
///
/// Equality and ordering ignore build metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub pre: Option<String>,
    pub build: Option<String>,
}

impl SemVer {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
            build: None,
        }
    }

    pub fn parse(input: &str) -> RegistryResult<Self> {
        let invalid = |reason: &str| {
            RegistryError::invalid_input("version", format!("'{}': {}", input, reason))
        };

        let (rest, build) = match input.split_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (input, None),
        };
        let (core, pre) = match rest.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (rest, None),
        };

        let mut numbers = [0u64; 3];
        let mut parts = core.split('.');
        for slot in numbers.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| invalid("expected major.minor.patch"))?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("version components must be numeric"));
            }
            *slot = part
                .parse()
                .map_err(|_| invalid("version component out of range"))?;
        }
        if parts.next().is_some() {
            return Err(invalid("expected major.minor.patch"));
        }

        for (label, identifiers) in [("pre-release", pre), ("build", build)] {
            if let Some(identifiers) = identifiers {
                let valid = identifiers.split('.').all(|id| {
                    !id.is_empty()
                        && id
                            .bytes()
                            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
                });
                if !valid {
                    return Err(invalid(&format!("malformed {} identifiers", label)));
                }
            }
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            pre: pre.map(str::to_string),
            build: build.map(str::to_string),
        })
    }

    /// Same major and `self >= required`
    pub fn is_compatible_with(&self, required: &SemVer) -> bool {
        self.major == required.major && self >= required
    }

    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }
}

impl PartialEq for SemVer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SemVer {}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_prerelease(a, b),
            })
    }
}

/// Identifier-wise precedence: numeric identifiers compare numerically and
/// rank below alphanumeric ones, a longer list wins when all shared ones tie
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => compare_identifier(x, y),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

fn compare_identifier(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    match (numeric(a), numeric(b)) {
        (true, true) => {
            let a = a.trim_start_matches('0');
            let b = b.trim_start_matches('0');
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for SemVer {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SemVer {
    type Error = RegistryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<SemVer> for String {
    fn from(v: SemVer) -> Self {
        v.to_string()
    }
}

/// Free-function form of [`SemVer::is_compatible_with`]
pub fn is_compatible(available: &SemVer, required: &SemVer) -> bool {
    available.is_compatible_with(required)
}

// =============================================================================
// Version Records
// =============================================================================

/// Range of versions a given version interoperates with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRule {
    pub min_version: SemVer,
    /// Exclusive
    pub max_version: Option<SemVer>,
    #[serde(default)]
    pub breaking_changes: Vec<String>,
}

impl CompatibilityRule {
    /// `[M.0.0, M+1.0.0)`
    pub fn same_major(major: u64) -> Self {
        Self {
            min_version: SemVer::new(major, 0, 0),
            max_version: Some(SemVer::new(major + 1, 0, 0)),
            breaking_changes: Vec::new(),
        }
    }

    pub fn contains(&self, version: &SemVer) -> bool {
        version >= &self.min_version && self.max_version.as_ref().map_or(true, |max| version < max)
    }

    fn validate(&self) -> RegistryResult<()> {
        if let Some(max) = &self.max_version {
            if max <= &self.min_version {
                return Err(RegistryError::invalid_input(
                    "max_version",
                    format!("{} is not above min_version {}", max, self.min_version),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecationInfo {
    pub reason: String,
    pub deprecated_at_ms: u64,
    pub replacement: Option<SemVer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceVersionInfo {
    pub service_name: String,
    pub version: SemVer,
    pub instances: BTreeSet<String>,
    pub registered_at_ms: u64,
    pub deprecation: Option<DeprecationInfo>,
    pub compatibility: Option<CompatibilityRule>,
}

impl ServiceVersionInfo {
    pub fn is_deprecated(&self) -> bool {
        self.deprecation.is_some()
    }
}

/// Outcome of `check_compatibility`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub compatible: bool,
    pub version: SemVer,
    pub required: SemVer,
    /// The rule that was applied, explicit or default
    pub rule: CompatibilityRule,
    pub deprecated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStatistics {
    pub services: usize,
    pub versions: usize,
    pub deprecated_versions: usize,
    pub instances: usize,
}

// =============================================================================
// Manager
// =============================================================================

/// Tracks which instances run which version of each service
#[derive(Debug)]
pub struct VersionManager {
    io: IoContext,
    services: RwLock<HashMap<String, BTreeMap<SemVer, ServiceVersionInfo>>>,
}

impl VersionManager {
    pub fn new(io: IoContext) -> Self {
        Self {
            io,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_version(
        &self,
        service_name: &str,
        version: &str,
        instance_id: &str,
    ) -> RegistryResult<SemVer> {
        let version = SemVer::parse(version)?;
        let now_ms = self.io.now_ms();
        let mut services = self.services.write().await;
        let info = services
            .entry(service_name.to_string())
            .or_default()
            .entry(version.clone())
            .or_insert_with(|| ServiceVersionInfo {
                service_name: service_name.to_string(),
                version: version.clone(),
                instances: BTreeSet::new(),
                registered_at_ms: now_ms,
                deprecation: None,
                compatibility: None,
            });
        info.instances.insert(instance_id.to_string());
        debug!(
            service_name = %service_name,
            version = %version,
            instance_id = %instance_id,
            "version registered"
        );
        Ok(version)
    }

    /// Remove an instance; the version entry goes once empty and not deprecated
    pub async fn deregister_version(
        &self,
        service_name: &str,
        version: &str,
        instance_id: &str,
    ) -> RegistryResult<()> {
        let version = SemVer::parse(version)?;
        let mut services = self.services.write().await;
        let versions = services
            .get_mut(service_name)
            .ok_or_else(|| RegistryError::not_found("service version", format!("{}@{}", service_name, version)))?;
        let info = versions
            .get_mut(&version)
            .ok_or_else(|| RegistryError::not_found("service version", format!("{}@{}", service_name, version)))?;

        info.instances.remove(instance_id);
        if info.instances.is_empty() && !info.is_deprecated() {
            versions.remove(&version);
        }
        if versions.is_empty() {
            services.remove(service_name);
        }
        Ok(())
    }

    pub async fn get_version_info(
        &self,
        service_name: &str,
        version: &str,
    ) -> RegistryResult<ServiceVersionInfo> {
        let version = SemVer::parse(version)?;
        self.services
            .read()
            .await
            .get(service_name)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| RegistryError::not_found("service version", format!("{}@{}", service_name, version)))
    }

    /// Instance IDs registered under exactly this version
    pub async fn services_by_version(
        &self,
        service_name: &str,
        version: &str,
    ) -> RegistryResult<Vec<String>> {
        let version = SemVer::parse(version)?;
        Ok(self
            .services
            .read()
            .await
            .get(service_name)
            .and_then(|versions| versions.get(&version))
            .map(|info| info.instances.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Instance IDs whose version satisfies `required`
    pub async fn compatible_services(
        &self,
        service_name: &str,
        required: &str,
    ) -> RegistryResult<Vec<String>> {
        let required = SemVer::parse(required)?;
        let services = self.services.read().await;
        let Some(versions) = services.get(service_name) else {
            return Ok(Vec::new());
        };
        Ok(versions
            .values()
            .filter(|info| evaluate(info, &required).0)
            .flat_map(|info| info.instances.iter().cloned())
            .collect())
    }

    /// Whether `version` of `service_name` satisfies `required`
    pub async fn check_compatibility(
        &self,
        service_name: &str,
        version: &str,
        required: &str,
    ) -> RegistryResult<CompatibilityReport> {
        let info = self.get_version_info(service_name, version).await?;
        let required = SemVer::parse(required)?;
        let (compatible, rule) = evaluate(&info, &required);
        Ok(CompatibilityReport {
            compatible,
            deprecated: info.is_deprecated(),
            version: info.version,
            required,
            rule,
        })
    }

    pub async fn set_compatibility_rule(
        &self,
        service_name: &str,
        version: &str,
        rule: CompatibilityRule,
    ) -> RegistryResult<()> {
        rule.validate()?;
        let version = SemVer::parse(version)?;
        let mut services = self.services.write().await;
        let info = services
            .get_mut(service_name)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or_else(|| RegistryError::not_found("service version", format!("{}@{}", service_name, version)))?;
        info.compatibility = Some(rule);
        Ok(())
    }

    /// Known versions, ascending
    pub async fn list_versions(&self, service_name: &str) -> Vec<SemVer> {
        self.services
            .read()
            .await
            .get(service_name)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest version, preferring ones that are not deprecated
    pub async fn latest_version(&self, service_name: &str) -> Option<SemVer> {
        let services = self.services.read().await;
        let versions = services.get(service_name)?;
        versions
            .values()
            .rev()
            .find(|info| !info.is_deprecated())
            .or_else(|| versions.values().next_back())
            .map(|info| info.version.clone())
    }

    /// Mark a version deprecated; its instances stay in service
    pub async fn deprecate_version(
        &self,
        service_name: &str,
        version: &str,
        reason: &str,
        replacement: Option<&str>,
    ) -> RegistryResult<()> {
        let version = SemVer::parse(version)?;
        let replacement = replacement.map(SemVer::parse).transpose()?;
        let now_ms = self.io.now_ms();

        let mut services = self.services.write().await;
        let info = services
            .get_mut(service_name)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or_else(|| RegistryError::not_found("service version", format!("{}@{}", service_name, version)))?;
        info.deprecation = Some(DeprecationInfo {
            reason: reason.to_string(),
            deprecated_at_ms: now_ms,
            replacement: replacement.clone(),
        });

        info!(
            service_name = %service_name,
            version = %version,
            replacement = ?replacement.map(|r| r.to_string()),
            reason = %reason,
            "version deprecated"
        );
        Ok(())
    }

    pub async fn deprecated_versions(&self, service_name: &str) -> Vec<ServiceVersionInfo> {
        self.services
            .read()
            .await
            .get(service_name)
            .map(|versions| {
                versions
                    .values()
                    .filter(|info| info.is_deprecated())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct versions for a service and their instances
    pub async fn versions_with_instances(&self, service_name: &str) -> Vec<(SemVer, usize)> {
        self.services
            .read()
            .await
            .get(service_name)
            .map(|versions| {
                versions
                    .values()
                    .map(|info| (info.version.clone(), info.instances.len()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn statistics(&self) -> VersionStatistics {
        let services = self.services.read().await;
        let mut stats = VersionStatistics {
            services: services.len(),
            versions: 0,
            deprecated_versions: 0,
            instances: 0,
        };
        for versions in services.values() {
            stats.versions += versions.len();
            for info in versions.values() {
                if info.is_deprecated() {
                    stats.deprecated_versions += 1;
                }
                stats.instances += info.instances.len();
            }
        }
        stats
    }
}

/// Apply the version's own rule, or `[M.0.0, M+1.0.0)` of `required`
fn evaluate(info: &ServiceVersionInfo, required: &SemVer) -> (bool, CompatibilityRule) {
    let rule = info
        .compatibility
        .clone()
        .unwrap_or_else(|| CompatibilityRule::same_major(required.major));
    let compatible = rule.contains(&info.version) && info.version >= *required;
    (compatible, rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn v(s: &str) -> SemVer {
        SemVer::parse(s).unwrap()
    }

    #[test]
    fn test_parse() {
        let version = v("1.2.3-beta.1+build_7");
        assert_eq!((version.major, version.minor, version.patch), (1, 2, 3));
        assert_eq!(version.pre.as_deref(), Some("beta.1"));
        assert_eq!(version.build.as_deref(), Some("build_7"));
        assert_eq!(version.to_string(), "1.2.3-beta.1+build_7");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "1", "1.2", "1.2.3.4", "a.b.c", "1.2.x", "1.2.3-", "1.2.3+", "1.2.3-be$ta", "1..3", "-1.2.3"] {
            let err = SemVer::parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "accepted '{}'", bad);
        }
    }

    #[test]
    fn test_ordering() {
        assert!(v("1.0.0") < v("1.0.1"));
        assert!(v("1.9.0") < v("1.10.0"));
        assert!(v("2.0.0") > v("1.99.99"));
        assert!(v("1.0.0-alpha") < v("1.0.0"));
        assert!(v("1.0.0-alpha") < v("1.0.0-beta"));
        assert_eq!(v("1.0.0+a"), v("1.0.0+b"));
    }

    #[test]
    fn test_prerelease_precedence() {
        let ordered = [
            "1.0.0-alpha",
            "1.0.0-alpha.1",
            "1.0.0-alpha.2",
            "1.0.0-alpha.10",
            "1.0.0-alpha.beta",
            "1.0.0-beta",
            "1.0.0-rc-1",
            "1.0.0",
        ];
        for pair in ordered.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        }
        assert_eq!(v("1.0.0-rc-1").pre.as_deref(), Some("rc-1"));
        assert_eq!(v("1.0.0-rc-1").to_string(), "1.0.0-rc-1");
    }

    #[test]
    fn test_is_compatible() {
        assert!(is_compatible(&v("1.3.0"), &v("1.2.0")));
        assert!(is_compatible(&v("1.2.0"), &v("1.2.0")));
        assert!(!is_compatible(&v("1.1.0"), &v("1.2.0")));
        assert!(!is_compatible(&v("2.0.0"), &v("1.2.0")));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("1.2.3-rc1")).unwrap();
        assert_eq!(json, "\"1.2.3-rc1\"");
        let back: SemVer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v("1.2.3-rc1"));
        assert!(serde_json::from_str::<SemVer>("\"nope\"").is_err());
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let manager = VersionManager::new(IoContext::production());
        manager.register_version("api", "1.0.0", "a").await.unwrap();
        manager.register_version("api", "1.2.0", "b").await.unwrap();
        manager.register_version("api", "2.0.0", "c").await.unwrap();
        manager.register_version("api", "1.2.0", "d").await.unwrap();

        assert_eq!(
            manager.list_versions("api").await,
            vec![v("1.0.0"), v("1.2.0"), v("2.0.0")]
        );
        assert_eq!(
            manager.services_by_version("api", "1.2.0").await.unwrap(),
            vec!["b", "d"]
        );
        assert_eq!(
            manager.compatible_services("api", "1.1.0").await.unwrap(),
            vec!["b", "d"]
        );
        assert!(manager.register_version("api", "bad", "e").await.is_err());
    }

    #[tokio::test]
    async fn test_check_compatibility() {
        let manager = VersionManager::new(IoContext::production());
        manager.register_version("api", "1.4.0", "a").await.unwrap();

        let report = manager
            .check_compatibility("api", "1.4.0", "1.2.0")
            .await
            .unwrap();
        assert!(report.compatible);
        assert_eq!(report.rule, CompatibilityRule::same_major(1));

        let report = manager
            .check_compatibility("api", "1.4.0", "2.0.0")
            .await
            .unwrap();
        assert!(!report.compatible);

        manager
            .set_compatibility_rule(
                "api",
                "1.4.0",
                CompatibilityRule {
                    min_version: v("1.4.0"),
                    max_version: Some(v("1.5.0")),
                    breaking_changes: vec!["removed /v0 routes".into()],
                },
            )
            .await
            .unwrap();
        let report = manager
            .check_compatibility("api", "1.4.0", "1.2.0")
            .await
            .unwrap();
        assert!(report.compatible);
        assert_eq!(report.rule.breaking_changes.len(), 1);

        let err = manager
            .check_compatibility("api", "9.9.9", "1.0.0")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_deprecation() {
        let manager = VersionManager::new(IoContext::production());
        manager.register_version("api", "1.0.0", "a").await.unwrap();
        manager.register_version("api", "2.0.0", "b").await.unwrap();

        manager
            .deprecate_version("api", "2.0.0", "security issue", Some("1.0.0"))
            .await
            .unwrap();
        let deprecated = manager.deprecated_versions("api").await;
        assert_eq!(deprecated.len(), 1);
        let info = deprecated[0].deprecation.as_ref().unwrap();
        assert_eq!(info.replacement, Some(v("1.0.0")));
        assert!(info.deprecated_at_ms > 0);

        assert_eq!(manager.latest_version("api").await, Some(v("1.0.0")));
        assert_eq!(
            manager.services_by_version("api", "2.0.0").await.unwrap(),
            vec!["b"]
        );

        let err = manager
            .deprecate_version("api", "3.0.0", "x", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_deregister_keeps_deprecated_entries() {
        let manager = VersionManager::new(IoContext::production());
        manager.register_version("api", "1.0.0", "a").await.unwrap();
        manager.register_version("api", "2.0.0", "b").await.unwrap();
        manager
            .deprecate_version("api", "1.0.0", "old", None)
            .await
            .unwrap();

        manager.deregister_version("api", "1.0.0", "a").await.unwrap();
        manager.deregister_version("api", "2.0.0", "b").await.unwrap();
        assert_eq!(manager.list_versions("api").await, vec![v("1.0.0")]);

        let stats = manager.statistics().await;
        assert_eq!(stats.services, 1);
        assert_eq!(stats.versions, 1);
        assert_eq!(stats.deprecated_versions, 1);
        assert_eq!(stats.instances, 0);
    }
}
