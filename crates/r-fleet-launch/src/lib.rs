//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Node launch pipeline and network lifecycle service."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Node launch pipeline and network lifecycle service.
//!
//! [`NetworkService`] accepts start, restore and stop requests. A start takes
//! the network lock and hands a [`NodeLauncher`] to a supervised thread,
//! which runs [`LaunchPipeline`] attempts until one succeeds or the relaunch
//! policy ([`launcher::decide`]) gives up. Cloud access goes through the
//! traits in [`drivers`].

pub mod drivers;
pub mod environment;
pub mod failure;
pub mod launcher;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod shell;
pub mod sim;
pub mod staging;

pub use drivers::{
    ComputeDriver, ContextBuilder, DnsDriver, DriverError, DriverFactory, ExecOutcome,
    ProvisioningContext, ProvisioningInput, RemoteExecutor, RemoteInvocation,
};
pub use environment::{Collaborators, LaunchEnvironment};
pub use failure::{FailureKind, LaunchFailure, StepResult};
pub use launcher::{decide, random_host, LaunchReport, NodeLauncher, RetryDecision};
pub use metrics::LaunchMetrics;
pub use pipeline::{is_connection_error, kill_node, LaunchPipeline};
pub use registry::DriverRegistry;
pub use service::{restore_key, NetworkService, ServiceError};
pub use shell::ShellExecutor;
pub use staging::{StagedInstall, StagingError};
