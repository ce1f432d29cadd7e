//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Network lifecycle operations exposed to the control plane."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::thread;
use std::time::Instant;

use crossbeam::channel;
use r_fleet_common::launch_span;
use r_fleet_coord::{LockError, LockToken, StoreError};
use r_fleet_model::{
    LaunchRequest, NetLocation, Network, NetworkState, Node, RepositoryError,
};
use r_fleet_progress::{ProgressTick, METER_CANCELED};
use r_fleet_supervisor::{Interrupt, LaunchSupervisor, LaunchWorker, SupervisorError, TerminateHook};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::drivers::DriverError;
use crate::environment::LaunchEnvironment;
use crate::launcher::{random_host, NodeLauncher};
use crate::pipeline::kill_node;

const RESTORE_KEY_LEN: usize = 6;
const RESTORE_KEY_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("network {0} not found")]
    NetworkNotFound(String),
    #[error("node {0} not found")]
    NodeNotFound(String),
    #[error("network {network} still has {count} active node(s)")]
    NodesActive { network: String, count: usize },
    #[error("network {network} has {count} node record(s), restore needs none")]
    NodesPresent { network: String, count: usize },
    #[error("network {network} is {state}, cannot {action}")]
    InvalidState {
        network: String,
        state: NetworkState,
        action: &'static str,
    },
    #[error("no enabled plan for network {0}")]
    PlanNotEnabled(String),
    #[error("network {0} has no cloud region to launch in")]
    NoPlacement(String),
    #[error("stopping network {network} failed: {summary}")]
    StopFailed { network: String, summary: String },
    #[error("failed to start launch worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Fresh restore key: six characters from an unambiguous uppercase set.
pub fn restore_key() -> String {
    let mut rng = rand::thread_rng();
    (0..RESTORE_KEY_LEN)
        .map(|_| RESTORE_KEY_CHARS[rng.gen_range(0..RESTORE_KEY_CHARS.len())] as char)
        .collect()
}

/// Starts, restores and stops networks. Launches run on their own threads;
/// every call here returns as soon as the work is handed off.
#[derive(Debug, Clone)]
pub struct NetworkService {
    env: LaunchEnvironment,
}

impl NetworkService {
    pub fn new(env: LaunchEnvironment) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &LaunchEnvironment {
        &self.env
    }

    pub fn supervisor(&self) -> &LaunchSupervisor {
        &self.env.supervisor
    }

    /// Launch the first node of a stopped or new network. `location`
    /// defaults to the network footprint.
    pub fn start_network(
        &self,
        network: &str,
        location: Option<NetLocation>,
        automated: bool,
    ) -> Result<LaunchRequest> {
        self.launch(network, location, automated, None)
    }

    /// Launch a node that restores a stopped network from its backup.
    pub fn restore_network(
        &self,
        network: &str,
        location: Option<NetLocation>,
    ) -> Result<LaunchRequest> {
        self.launch(network, location, false, Some(restore_key()))
    }

    fn launch(
        &self,
        id: &str,
        location: Option<NetLocation>,
        automated: bool,
        restore_key: Option<String>,
    ) -> Result<LaunchRequest> {
        if !self.env.supervisor.config().authorized_launcher {
            return Err(SupervisorError::NotAuthorized.into());
        }
        let restore = restore_key.is_some();
        let network = self.load(id)?;
        self.check_launchable(&network, restore)?;
        self.await_plan(&network)?;

        let token = self.env.lock.acquire(id)?;
        let result = self.launch_locked(id, location, automated, restore_key, &token);
        if let Err(err) = &result {
            warn!(network = id, error = %err, "launch not started");
            self.release(id, &token);
        }
        result
    }

    fn launch_locked(
        &self,
        id: &str,
        location: Option<NetLocation>,
        automated: bool,
        restore_key: Option<String>,
        token: &LockToken,
    ) -> Result<LaunchRequest> {
        let restore = restore_key.is_some();
        let network = self.load(id)?;
        self.check_launchable(&network, restore)?;
        let location =
            location.unwrap_or_else(|| NetLocation::any_of(network.footprint.clone()));
        if location.target().is_none() {
            return Err(ServiceError::NoPlacement(id.to_owned()));
        }

        let previous = network.state;
        let state = if restore {
            NetworkState::Restoring
        } else {
            NetworkState::Setup
        };
        let network = self.env.repository.update_network_state(id, state)?;
        let mut request = LaunchRequest::new(
            &network,
            network.fork_host.clone().unwrap_or_else(random_host),
            location,
            token.as_str(),
            automated,
        );
        if let Some(key) = restore_key {
            request = request.with_restore_key(key);
        }

        let started = self
            .env
            .dns_for(&network)
            .and_then(|dns| dns.publish_network(&network))
            .map_err(ServiceError::from)
            .and_then(|()| self.spawn(request));
        if started.is_err() {
            if let Err(err) = self.env.repository.update_network_state(id, previous) {
                warn!(network = id, error = %err, "could not restore network state");
            }
        }
        started
    }

    fn spawn(&self, request: LaunchRequest) -> Result<LaunchRequest> {
        let interrupt = Interrupt::new();
        // The worker waits until it is registered so its final unregister
        // always finds its own entry.
        let (ready, registered) = channel::bounded::<()>(1);
        let launcher = NodeLauncher::new(self.env.clone(), request.clone(), interrupt.clone());
        let span = launch_span(&request.network, &request.id, &request.host);
        let thread = thread::Builder::new()
            .name(format!("launch-{}", request.host))
            .spawn(move || {
                let _entered = span.enter();
                if registered.recv().is_ok() {
                    launcher.run();
                }
            })
            .map_err(ServiceError::Spawn)?;

        let on_terminate: TerminateHook = {
            let statuses = self.env.statuses.clone();
            let tick = ProgressTick::new(
                &request.account,
                &request.network,
                &request.id,
                METER_CANCELED,
                0,
            );
            Box::new(move || {
                if let Err(err) = statuses.publish(&tick) {
                    warn!(launch = %tick.launch, error = %err, "could not publish cancel status");
                }
            })
        };
        self.env.supervisor.register(
            LaunchWorker::new(&request.network, &request.id, thread, interrupt)
                .on_terminate(on_terminate),
        )?;
        let _ = ready.send(());
        info!(
            network = %request.network,
            launch = %request.id,
            host = %request.host,
            restore = request.is_restore(),
            "launch started"
        );
        Ok(request)
    }

    /// Deallocate every node, delete their records and mark the network
    /// stopped. A launch in flight is canceled first.
    pub fn stop_network(&self, id: &str) -> Result<Network> {
        let network = self.load(id)?;
        if self.env.supervisor.cancel(id) {
            info!(network = id, "canceled launch in flight before stop");
        }
        let token = self.env.lock.acquire(id)?;
        let result = self.stop_locked(&network);
        self.release(id, &token);
        result
    }

    fn stop_locked(&self, network: &Network) -> Result<Network> {
        let id = network.id.as_str();
        let repository = &self.env.repository;
        repository.update_network_state(id, NetworkState::Stopping)?;
        let nodes = repository.nodes_for_network(id)?;
        let dns = match self.env.dns_for(network) {
            Ok(dns) => Some(dns),
            Err(err) => {
                warn!(network = id, error = %err, "no dns driver, records stay behind");
                None
            }
        };

        let mut failures = Vec::new();
        for node in &nodes {
            if let Some(dns) = &dns {
                if let Err(err) = dns.remove_node(node) {
                    warn!(node = %node.id, error = %err, "removing node dns failed");
                }
            }
            if !node.is_active() {
                continue;
            }
            let stopped = self
                .env
                .resolve_cloud(&node.cloud)
                .and_then(|cloud| self.env.compute_for(&cloud))
                .and_then(|compute| compute.deallocate(node));
            if let Err(err) = stopped {
                warn!(node = %node.id, error = %err, "stopping node failed");
                failures.push(format!("{}: {}", node.id, err));
            }
        }
        if !failures.is_empty() {
            repository.update_network_state(id, NetworkState::ErrorStopping)?;
            return Err(ServiceError::StopFailed {
                network: id.to_owned(),
                summary: failures.join("; "),
            });
        }

        for node in &nodes {
            repository.delete_node(&node.id)?;
        }
        let network = repository.update_network_state(id, NetworkState::Stopped)?;
        info!(network = id, nodes = nodes.len(), "network stopped");
        Ok(network)
    }

    /// Force-end the launch worker of `network`. Returns whether one was
    /// registered.
    pub fn cancel_launch(&self, network: &str) -> bool {
        self.env.supervisor.cancel(network)
    }

    /// Stop one node and leave it in `error_stopped`, tagged with `message`.
    /// The network is stopped once no active node remains.
    pub fn kill_node(&self, node: &str, message: &str) -> Result<Node> {
        let mut node = self
            .env
            .repository
            .node(node)?
            .ok_or_else(|| ServiceError::NodeNotFound(node.to_owned()))?;
        kill_node(&self.env, None, &mut node, message);

        let network = self.load(&node.network)?;
        let active = self.env.repository.active_nodes(&network.id)?;
        if active.is_empty() && !matches!(network.state, NetworkState::Stopped | NetworkState::Created) {
            self.env
                .repository
                .update_network_state(&network.id, NetworkState::Stopped)?;
            info!(network = %network.id, "last node killed, network stopped");
        }
        Ok(node)
    }

    pub fn get_launch_status(&self, account: &str, launch: &str) -> Result<Option<ProgressTick>> {
        Ok(self.env.statuses.get(account, launch)?)
    }

    pub fn list_launch_statuses(&self, account: &str) -> Result<Vec<ProgressTick>> {
        Ok(self.env.statuses.list(account)?)
    }

    pub fn list_launch_statuses_for_network(
        &self,
        account: &str,
        network: &str,
    ) -> Result<Vec<ProgressTick>> {
        Ok(self.env.statuses.list_for_network(account, network)?)
    }

    /// Stop the supervisor thread. Running workers finish on their own.
    pub fn shutdown(&self) {
        self.env.supervisor.shutdown();
    }

    fn load(&self, id: &str) -> Result<Network> {
        self.env
            .repository
            .network(id)?
            .ok_or_else(|| ServiceError::NetworkNotFound(id.to_owned()))
    }

    fn check_launchable(&self, network: &Network, restore: bool) -> Result<()> {
        let nodes = self.env.repository.nodes_for_network(&network.id)?;
        let active = nodes.iter().filter(|node| node.is_active()).count();
        if active > 0 {
            return Err(ServiceError::NodesActive {
                network: network.id.clone(),
                count: active,
            });
        }
        if restore {
            if network.state != NetworkState::Stopped {
                return Err(ServiceError::InvalidState {
                    network: network.id.clone(),
                    state: network.state,
                    action: "restore",
                });
            }
            if !nodes.is_empty() {
                return Err(ServiceError::NodesPresent {
                    network: network.id.clone(),
                    count: nodes.len(),
                });
            }
        } else if !network.state.can_start() {
            return Err(ServiceError::InvalidState {
                network: network.id.clone(),
                state: network.state,
                action: "start",
            });
        }
        Ok(())
    }

    fn await_plan(&self, network: &Network) -> Result<()> {
        let deadline = Instant::now() + self.env.launch.plan_enable_timeout;
        let mut waited = false;
        loop {
            let enabled = self
                .env
                .repository
                .subscription(&network.account, &network.id)?
                .is_some_and(|plan| plan.enabled);
            if enabled {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ServiceError::PlanNotEnabled(network.id.clone()));
            }
            if !waited {
                debug!(network = %network.id, "waiting for plan to be enabled");
                waited = true;
            }
            thread::sleep(self.env.launch.plan_poll_interval);
        }
    }

    fn release(&self, id: &str, token: &LockToken) {
        if let Err(err) = self.env.lock.release(id, token.as_str()) {
            warn!(network = id, error = %err, "lock release failed, lease will expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_keys_are_six_uppercase_characters() {
        for _ in 0..32 {
            let key = restore_key();
            assert_eq!(key.len(), RESTORE_KEY_LEN);
            assert!(key
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }
}
