//! Logging setup
//!
//! TigerStyle: Explicit subscriber configuration, initialized once.
//!
//! Library code only emits `tracing` events. Hosts that embed the registry
//! call [`init_telemetry`] once at startup to install a subscriber.

use crate::error::{Error, Result};

/// Default service name attached to log output
const SERVICE_NAME_DEFAULT: &str = "beacon";

/// Default log filter when neither the config nor `RUST_LOG` sets one
const LOG_LEVEL_DEFAULT: &str = "info";

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name recorded in the startup event
    pub service_name: String,
    /// Whether to write formatted events to stdout
    pub stdout_enabled: bool,
    /// `EnvFilter` directive, e.g. `info` or `beacon_registry=debug`
    pub log_level: String,
    /// Include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME_DEFAULT.to_string(),
            stdout_enabled: true,
            log_level: LOG_LEVEL_DEFAULT.to_string(),
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create a configuration for the given service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the log level filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Disable stdout output
    pub fn without_stdout(mut self) -> Self {
        self.stdout_enabled = false;
        self
    }

    /// Omit event targets from output
    pub fn without_target(mut self) -> Self {
        self.with_target = false;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - `BEACON_SERVICE_NAME`: service name (default: "beacon")
    /// - `RUST_LOG`: log level filter (default: "info")
    pub fn from_env() -> Self {
        let service_name = std::env::var("BEACON_SERVICE_NAME")
            .unwrap_or_else(|_| SERVICE_NAME_DEFAULT.to_string());
        let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| LOG_LEVEL_DEFAULT.to_string());

        Self {
            service_name,
            log_level,
            ..Default::default()
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `config.log_level`. Fails with
/// `Error::Internal` if a global subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = if config.stdout_enabled {
        Some(tracing_subscriber::fmt::layer().with_target(config.with_target))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| Error::internal(format!("failed to initialize tracing subscriber: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        log_level = %config.log_level,
        "telemetry initialized"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "beacon");
        assert_eq!(config.log_level, "info");
        assert!(config.stdout_enabled);
        assert!(config.with_target);
    }

    #[test]
    fn test_telemetry_config_builder() {
        let config = TelemetryConfig::new("registry-test")
            .with_log_level("debug")
            .without_stdout()
            .without_target();

        assert_eq!(config.service_name, "registry-test");
        assert_eq!(config.log_level, "debug");
        assert!(!config.stdout_enabled);
        assert!(!config.with_target);
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = TelemetryConfig::new("twice").without_stdout();
        // The first call may race other tests in this binary; only the
        // second call's outcome is asserted.
        let _ = init_telemetry(config.clone());
        assert!(init_telemetry(config).is_err());
    }
}
