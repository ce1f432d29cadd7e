//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Collaborator traits for compute, DNS, provisioning context, and remote execution."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! The pipeline only talks to the outside world through these traits.
//! Concrete cloud drivers live outside this crate; [`crate::sim`] carries
//! in-process implementations.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use r_fleet_model::{CloudService, Network, Node, RepositoryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by drivers and executors.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("region {region} cannot host the node: {message}")]
    RegionUnavailable { region: String, message: String },
    #[error("transient driver failure: {0}")]
    Transient(String),
    #[error("driver failure: {0}")]
    Failed(String),
    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),
    #[error("driver call interrupted")]
    Interrupted,
    #[error("cloud {0} not found")]
    CloudNotFound(String),
    #[error("cloud {cloud} is delegated to node {node}, not this one")]
    ForeignDelegate { cloud: String, node: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Allocates and releases compute instances.
pub trait ComputeDriver: Send + Sync {
    /// Provider-specific instance size for a network's size type.
    fn resolve_size(&self, size_type: &str) -> Result<String, DriverError>;

    /// Start an instance for `node`. The returned record carries the
    /// provider's addresses and instance tags.
    fn allocate(&self, node: &Node) -> Result<Node, DriverError>;

    /// Release the instance behind `node`.
    fn deallocate(&self, node: &Node) -> Result<Node, DriverError>;

    /// Refresh `node` from the provider.
    fn query_status(&self, node: &Node) -> Result<Node, DriverError>;

    /// Called once per launch attempt after the pipeline finishes.
    fn cleanup_after_launch(&self, _node: Option<&Node>) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Publishes network and node names.
pub trait DnsDriver: Send + Sync {
    fn publish_network(&self, network: &Network) -> Result<(), DriverError>;
    fn publish_node(&self, node: &Node) -> Result<(), DriverError>;
    fn remove_node(&self, node: &Node) -> Result<(), DriverError>;

    /// Block until `node.fqdn` resolves to the node's address, at most
    /// `timeout`.
    fn wait_until_resolvable(&self, node: &Node, timeout: Duration) -> Result<(), DriverError>;
}

/// Everything a context builder may draw on.
#[derive(Debug, Clone, Copy)]
pub struct ProvisioningInput<'a> {
    pub network: &'a Network,
    pub node: &'a Node,
    pub sage: Option<&'a str>,
    pub roles: &'a [String],
    pub restore_key: Option<&'a str>,
}

/// Variables and role list handed to the installer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningContext {
    pub vars: IndexMap<String, serde_json::Value>,
    pub roles: Vec<String>,
    /// Role validation problems. Any entry aborts the launch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

impl ProvisioningContext {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Builds the provisioning context for a node.
pub trait ContextBuilder: Send + Sync {
    fn build(&self, input: &ProvisioningInput<'_>) -> Result<ProvisioningContext, DriverError>;
}

/// One remote install run.
#[derive(Debug, Clone)]
pub struct RemoteInvocation {
    pub launch: String,
    pub address: String,
    pub user: String,
    pub identity: Option<PathBuf>,
    pub staging_dir: PathBuf,
    pub script: PathBuf,
    pub timeout: Duration,
}

/// Exit status and captured stderr of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            stderr: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the staged install against a node, streaming stdout line by line.
pub trait RemoteExecutor: Send + Sync {
    fn run(
        &self,
        invocation: &RemoteInvocation,
        output: &mut dyn FnMut(&str),
    ) -> Result<ExecOutcome, DriverError>;
}

/// Builds drivers for cloud records. Construction may be slow; callers go
/// through [`crate::registry::DriverRegistry`] so each cloud is built once.
pub trait DriverFactory: Send + Sync {
    fn compute(&self, cloud: &CloudService) -> Result<Arc<dyn ComputeDriver>, DriverError>;
    fn dns(&self, cloud: &CloudService) -> Result<Arc<dyn DnsDriver>, DriverError>;
}
