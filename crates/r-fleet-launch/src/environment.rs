//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Shared collaborators of launch workers and the network service."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use r_fleet_common::config::{AppConfig, LaunchConfig, MeterConfig};
use r_fleet_coord::{CoordinationStore, DistributedLock};
use r_fleet_model::{CloudService, FleetRepository, Network, Node};
use r_fleet_progress::{LaunchStatusStore, TickCatalog, TickError};
use r_fleet_supervisor::LaunchSupervisor;
use tracing::info;

use crate::drivers::{ComputeDriver, ContextBuilder, DnsDriver, DriverError, DriverFactory, RemoteExecutor};
use crate::metrics::LaunchMetrics;
use crate::registry::DriverRegistry;

/// Pluggable collaborators handed to [`LaunchEnvironment::new`].
pub struct Collaborators {
    pub repository: Arc<dyn FleetRepository>,
    pub factory: Arc<dyn DriverFactory>,
    pub context_builder: Arc<dyn ContextBuilder>,
    pub executor: Arc<dyn RemoteExecutor>,
}

/// Everything a launch worker needs, cheap to clone into worker threads.
#[derive(Clone)]
pub struct LaunchEnvironment {
    pub repository: Arc<dyn FleetRepository>,
    pub drivers: Arc<DriverRegistry>,
    pub context_builder: Arc<dyn ContextBuilder>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub lock: DistributedLock,
    pub statuses: LaunchStatusStore,
    pub supervisor: LaunchSupervisor,
    pub catalog: Arc<TickCatalog>,
    /// Record of the node this process runs on. Launches need it for sage
    /// assignment and delegation checks.
    pub self_node: Option<Node>,
    pub launch: LaunchConfig,
    pub meter: MeterConfig,
    pub metrics: Option<LaunchMetrics>,
}

impl fmt::Debug for LaunchEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchEnvironment")
            .field("drivers", &self.drivers)
            .field("lock", &self.lock)
            .field("supervisor", &self.supervisor)
            .field("self_node", &self.self_node.as_ref().map(|node| node.id.as_str()))
            .finish_non_exhaustive()
    }
}

impl LaunchEnvironment {
    /// Wire collaborators against a shared coordination store. The tick
    /// catalog comes from `meter.install_ticks` when set, otherwise from the
    /// embedded table.
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn CoordinationStore>,
        collaborators: Collaborators,
        self_node: Option<Node>,
        metrics: Option<LaunchMetrics>,
    ) -> Result<Self, TickError> {
        let catalog = match &config.meter.install_ticks {
            Some(path) => {
                info!(path = %path.display(), "loading install ticks");
                TickCatalog::from_install_file(path)?
            }
            None => TickCatalog::embedded()?,
        };
        Ok(Self {
            repository: collaborators.repository,
            drivers: Arc::new(DriverRegistry::new(collaborators.factory)),
            context_builder: collaborators.context_builder,
            executor: collaborators.executor,
            lock: DistributedLock::new(store.clone(), config.lock.clone()),
            statuses: LaunchStatusStore::new(store, config.meter.tick_ttl),
            supervisor: LaunchSupervisor::new(config.supervisor.clone()),
            catalog: Arc::new(catalog),
            self_node,
            launch: config.launch.clone(),
            meter: config.meter.clone(),
            metrics,
        })
    }

    /// The cloud record to drive for `id`, following delegation. A delegated
    /// cloud is only usable from the node it was delegated to.
    pub fn resolve_cloud(&self, id: &str) -> Result<CloudService, DriverError> {
        let cloud = self
            .repository
            .cloud(id)?
            .ok_or_else(|| DriverError::CloudNotFound(id.to_owned()))?;
        let Some(delegate) = cloud.delegated_to.as_deref() else {
            return Ok(cloud);
        };
        if let Some(delegate_node) = cloud.delegate_node.as_deref() {
            let here = self.self_node.as_ref().map(|node| node.id.as_str());
            if here != Some(delegate_node) {
                return Err(DriverError::ForeignDelegate {
                    cloud: id.to_owned(),
                    node: delegate_node.to_owned(),
                });
            }
        }
        self.repository
            .cloud(delegate)?
            .ok_or_else(|| DriverError::CloudNotFound(delegate.to_owned()))
    }

    pub fn compute_for(&self, cloud: &CloudService) -> Result<Arc<dyn ComputeDriver>, DriverError> {
        self.drivers.compute(cloud)
    }

    /// DNS driver of the network's DNS cloud.
    pub fn dns_for(&self, network: &Network) -> Result<Arc<dyn DnsDriver>, DriverError> {
        let cloud = self.resolve_cloud(&network.dns_cloud)?;
        self.drivers.dns(&cloud)
    }
}
