//! Registry error types
//!
//! TigerStyle: Explicit error variants with context.

use thiserror::Error;

/// Coarse classification of registry errors
///
/// Callers branch on the kind; the variant carries the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidInput,
    DependencyNotMet,
    CircuitOpen,
    RetryExhausted,
    Unavailable,
    Unsupported,
}

/// Registry-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// Service instance not registered
    #[error("service not found: {service_id}")]
    ServiceNotFound { service_id: String },

    /// No instances (or no healthy instances) under a service name
    #[error("no instances available for service {name}: {reason}")]
    NoInstances { name: String, reason: String },

    /// Generic lookup miss for versions, groups, alerts, breakers, configs
    #[error("{resource} not found: {id}")]
    ResourceNotFound { resource: &'static str, id: String },

    /// Duplicate registration
    #[error("service already exists: {service_id}")]
    ServiceAlreadyExists { service_id: String },

    /// Duplicate named resource, e.g. a group
    #[error("{resource} already exists: {id}")]
    ResourceAlreadyExists { resource: &'static str, id: String },

    /// Malformed input
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// A declared dependency has no healthy instance
    #[error("dependency {dependency} not met for service {service_id}: {reason}")]
    DependencyNotMet {
        service_id: String,
        dependency: String,
        reason: String,
    },

    /// Dependency resolution found a cycle
    #[error("circular dependency detected among: {}", services.join(", "))]
    DependencyCycle { services: Vec<String> },

    /// Call rejected by an open circuit breaker
    #[error("circuit open for {instance_id}, next attempt at {retry_at_ms}ms")]
    CircuitOpen { instance_id: String, retry_at_ms: u64 },

    /// Recovery attempts exhausted
    #[error("retries exhausted for {instance_id} after {attempts} attempts")]
    RetryExhausted { instance_id: String, attempts: u32 },

    /// Registry shut down, feature disabled, or operation not yet due
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    /// Unknown protocol, strategy or export format
    #[error("unsupported {what}: {value}")]
    Unsupported { what: &'static str, value: String },
}

impl RegistryError {
    /// Create a service not found error
    pub fn service_not_found(service_id: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            service_id: service_id.into(),
        }
    }

    /// Create a lookup miss for a named resource
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            resource,
            id: id.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Error returned when an optional feature is switched off
    pub fn feature_disabled(feature: &str) -> Self {
        Self::unavailable(format!("{} is not enabled", feature))
    }

    /// Create an unsupported error
    pub fn unsupported(what: &'static str, value: impl Into<String>) -> Self {
        Self::Unsupported {
            what,
            value: value.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ServiceNotFound { .. }
            | Self::NoInstances { .. }
            | Self::ResourceNotFound { .. } => ErrorKind::NotFound,
            Self::ServiceAlreadyExists { .. } | Self::ResourceAlreadyExists { .. } => {
                ErrorKind::AlreadyExists
            }
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::DependencyNotMet { .. } | Self::DependencyCycle { .. } => {
                ErrorKind::DependencyNotMet
            }
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }

    /// Check if this error indicates a retriable condition
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::CircuitOpen | ErrorKind::Unavailable)
    }
}

impl From<beacon_core::Error> for RegistryError {
    fn from(err: beacon_core::Error) -> Self {
        match err {
            beacon_core::Error::InvalidConfiguration { field, reason } => {
                Self::InvalidInput { field, reason }
            }
            other => Self::invalid_input("configuration", other.to_string()),
        }
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
