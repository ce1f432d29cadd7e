//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared primitives and utilities for the launch engine."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Core shared primitives for the R-Fleet workspace.
//! This crate exposes configuration loading, logging, and metrics
//! registry utilities consumed across the workspace.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{
    AppConfig, LaunchConfig, LockConfig, LoggingConfig, MeterConfig, MetricsConfig,
    SupervisorConfig,
};
pub use logging::{init_tracing, launch_span, LogFormat};
pub use metrics::{encode_text, new_registry, SharedRegistry};
