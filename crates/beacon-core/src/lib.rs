//! Beacon Core
//!
//! Core types, errors, configuration and I/O abstractions for the Beacon
//! service registry.
//!
//! # TigerStyle
//!
//! This crate follows [TigerStyle](https://github.com/tigerbeetle/tigerbeetle/blob/main/docs/TIGER_STYLE.md)
//! engineering principles:
//! - Safety > Performance > Developer Experience
//! - Explicit limits with big-endian naming (e.g., `SERVICE_ID_LENGTH_BYTES_MAX`)
//! - Assertions on invariants, explicit errors on inputs
//! - No recursion (bounded iteration only)

pub mod config;
pub mod constants;
pub mod error;
pub mod io;
pub mod telemetry;

pub use config::{
    BalancerConfig, BeaconConfig, ExtendedConfig, FailoverConfig, HealthConfig, MetricsConfig,
    RegistryConfig,
};
pub use constants::*;
pub use error::{Error, Result};
pub use io::{IoContext, ManualClock, RngProvider, StdRngProvider, TimeProvider, WallClockTime};
pub use telemetry::{init_telemetry, TelemetryConfig};
