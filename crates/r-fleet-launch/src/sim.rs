//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "In-process simulated cloud used by the daemon's dry runs and tests."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
//! Simulated compute, DNS and installer backends.
//!
//! Every backend records what it was asked to do so callers can inspect a
//! run afterwards. Failure injection is configured up front and consumed as
//! the launch proceeds.
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use r_fleet_common::config::AppConfig;
use r_fleet_coord::{CoordinationStore, MemoryStore};
use r_fleet_model::node::TAG_INSTANCE_ID;
use r_fleet_model::{
    CloudRegion, CloudService, FleetRepository, InMemoryRepository, LaunchRequest, NetLocation,
    Network, NetworkState, Node, NodeState, Subscription,
};
use r_fleet_progress::{lines, TickError};
use serde_json::json;
use tracing::debug;

use crate::drivers::{
    ComputeDriver, ContextBuilder, DnsDriver, DriverError, DriverFactory, ExecOutcome,
    ProvisioningContext, ProvisioningInput, RemoteExecutor, RemoteInvocation,
};
use crate::environment::{Collaborators, LaunchEnvironment};
use crate::metrics::LaunchMetrics;
use crate::service::NetworkService;

pub const SIM_ACCOUNT: &str = "acct-sim";
pub const SIM_NETWORK: &str = "net-sim";
pub const SIM_CLOUD: &str = "sim-cloud";
pub const SIM_DNS_CLOUD: &str = "sim-dns";
pub const SIM_REGIONS: [&str; 2] = ["east", "west"];

/// Roles the simulated installer reports, in play order.
const SIM_ROLES: [&str; 6] = ["common", "firewall", "nginx", "postgresql", "app", "finalizer"];

/// Compute backend handing out 10.0.0.0/16 addresses.
#[derive(Debug, Default)]
pub struct SimulatedCompute {
    unavailable: Mutex<HashSet<String>>,
    transient_failures: AtomicUsize,
    allocate_delay: Mutex<Duration>,
    omit_address: AtomicBool,
    next_instance: AtomicU32,
    allocated: Mutex<Vec<Node>>,
    deallocated: Mutex<Vec<String>>,
}

impl SimulatedCompute {
    /// Reject every allocation in `region` as out of capacity.
    pub fn mark_unavailable(&self, region: &str) {
        self.unavailable.lock().insert(region.to_owned());
    }

    /// Fail the next `count` allocations with a transient error.
    pub fn fail_transiently(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_allocate_delay(&self, delay: Duration) {
        *self.allocate_delay.lock() = delay;
    }

    /// Boot nodes without an address.
    pub fn omit_address(&self, omit: bool) {
        self.omit_address.store(omit, Ordering::SeqCst);
    }

    pub fn allocated(&self) -> Vec<Node> {
        self.allocated.lock().clone()
    }

    /// Ids of deallocated nodes, in call order.
    pub fn deallocated(&self) -> Vec<String> {
        self.deallocated.lock().clone()
    }
}

impl ComputeDriver for SimulatedCompute {
    fn resolve_size(&self, size_type: &str) -> Result<String, DriverError> {
        Ok(format!("sim-{}", size_type))
    }

    fn allocate(&self, node: &Node) -> Result<Node, DriverError> {
        let delay = *self.allocate_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.unavailable.lock().contains(&node.region) {
            return Err(DriverError::RegionUnavailable {
                region: node.region.clone(),
                message: "no capacity for requested size".into(),
            });
        }
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if transient {
            return Err(DriverError::Transient("provider rate limit".into()));
        }

        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst) + 1;
        let mut allocated = node.clone();
        if !self.omit_address.load(Ordering::SeqCst) {
            allocated.ip4 = Some(Ipv4Addr::new(10, 0, (instance >> 8) as u8, instance as u8));
            allocated.ssh_user = Some("root".into());
        }
        allocated.tag(TAG_INSTANCE_ID, format!("sim-{}", instance));
        debug!(node = %node.id, region = %node.region, instance, "simulated node allocated");
        self.allocated.lock().push(allocated.clone());
        Ok(allocated)
    }

    fn deallocate(&self, node: &Node) -> Result<Node, DriverError> {
        self.deallocated.lock().push(node.id.clone());
        let mut released = node.clone();
        released.ip4 = None;
        released.ip6 = None;
        Ok(released)
    }

    fn query_status(&self, node: &Node) -> Result<Node, DriverError> {
        Ok(node.clone())
    }
}

/// DNS backend that records every change.
#[derive(Debug, Default)]
pub struct SimulatedDns {
    resolve_delay: Mutex<Duration>,
    networks: Mutex<Vec<String>>,
    published: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl SimulatedDns {
    pub fn set_resolve_delay(&self, delay: Duration) {
        *self.resolve_delay.lock() = delay;
    }

    pub fn published_networks(&self) -> Vec<String> {
        self.networks.lock().clone()
    }

    /// Fully qualified names published, in call order.
    pub fn published(&self) -> Vec<String> {
        self.published.lock().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

impl DnsDriver for SimulatedDns {
    fn publish_network(&self, network: &Network) -> Result<(), DriverError> {
        self.networks.lock().push(network.network_domain());
        Ok(())
    }

    fn publish_node(&self, node: &Node) -> Result<(), DriverError> {
        if !node.has_address() {
            return Err(DriverError::Failed(format!("node {} has no address", node.id)));
        }
        self.published.lock().push(node.fqdn.clone());
        Ok(())
    }

    fn remove_node(&self, node: &Node) -> Result<(), DriverError> {
        self.removed.lock().push(node.fqdn.clone());
        Ok(())
    }

    fn wait_until_resolvable(&self, _node: &Node, timeout: Duration) -> Result<(), DriverError> {
        let delay = *self.resolve_delay.lock();
        if delay > timeout {
            thread::sleep(timeout);
            return Err(DriverError::Timeout(timeout));
        }
        thread::sleep(delay);
        Ok(())
    }
}

/// Context builder filling a fixed set of variables.
#[derive(Debug, Default)]
pub struct StaticContextBuilder {
    violations: Mutex<Vec<String>>,
}

impl StaticContextBuilder {
    /// Report `violation` on every build.
    pub fn reject_with(&self, violation: impl Into<String>) {
        self.violations.lock().push(violation.into());
    }
}

impl ContextBuilder for StaticContextBuilder {
    fn build(&self, input: &ProvisioningInput<'_>) -> Result<ProvisioningContext, DriverError> {
        let mut context = ProvisioningContext {
            roles: input.roles.to_vec(),
            violations: self.violations.lock().clone(),
            ..ProvisioningContext::default()
        };
        let vars = &mut context.vars;
        vars.insert("network_name".into(), json!(input.network.name));
        vars.insert("network_domain".into(), json!(input.network.network_domain()));
        vars.insert("host".into(), json!(input.node.host));
        vars.insert("fqdn".into(), json!(input.node.fqdn));
        vars.insert("sage".into(), json!(input.sage));
        vars.insert("restore_key".into(), json!(input.restore_key));
        Ok(context)
    }
}

/// Installer that prints ansible-style output without touching a host.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    connection_failures: AtomicUsize,
    fatal: AtomicBool,
    runs: AtomicUsize,
    line_delay: Mutex<Duration>,
}

impl ScriptedExecutor {
    /// Refuse the ssh connection on the next `count` runs.
    pub fn refuse_connections(&self, count: usize) {
        self.connection_failures.store(count, Ordering::SeqCst);
    }

    /// Fail every run with a role error.
    pub fn fail_fatally(&self, fatal: bool) {
        self.fatal.store(fatal, Ordering::SeqCst);
    }

    pub fn set_line_delay(&self, delay: Duration) {
        *self.line_delay.lock() = delay;
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn emit(&self, output: &mut dyn FnMut(&str), line: &str) {
        let delay = *self.line_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        output(line);
    }
}

impl RemoteExecutor for ScriptedExecutor {
    fn run(
        &self,
        invocation: &RemoteInvocation,
        output: &mut dyn FnMut(&str),
    ) -> Result<ExecOutcome, DriverError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.emit(output, lines::COPYING_INSTALL_FILES);
        let refused = self
            .connection_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Ok(ExecOutcome {
                exit_code: 255,
                stderr: format!(
                    "ssh: connect to host {} port 22: Connection refused\n",
                    invocation.address
                ),
            });
        }

        self.emit(output, lines::RUNNING_INSTALLER);
        if self.fatal.load(Ordering::SeqCst) {
            self.emit(output, "TASK [common : Gather facts] ****");
            return Ok(ExecOutcome {
                exit_code: 2,
                stderr: format!(
                    "fatal: [{}]: FAILED! => role common could not be applied\n",
                    invocation.address
                ),
            });
        }
        for role in SIM_ROLES {
            self.emit(output, &format!("TASK [{} : Configure {}] ****", role, role));
        }
        self.emit(output, &format!("PLAY RECAP {} : ok=42 failed=0", invocation.address));
        Ok(ExecOutcome::success())
    }
}

/// Factory returning the shared simulated backends for every cloud.
#[derive(Debug)]
pub struct SimulatedFactory {
    compute: Arc<SimulatedCompute>,
    dns: Arc<SimulatedDns>,
    builds: AtomicUsize,
}

impl SimulatedFactory {
    pub fn new(compute: Arc<SimulatedCompute>, dns: Arc<SimulatedDns>) -> Self {
        Self {
            compute,
            dns,
            builds: AtomicUsize::new(0),
        }
    }

    /// Number of drivers built so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl DriverFactory for SimulatedFactory {
    fn compute(&self, cloud: &CloudService) -> Result<Arc<dyn ComputeDriver>, DriverError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        debug!(cloud = %cloud.id, "building simulated compute driver");
        let compute: Arc<dyn ComputeDriver> = self.compute.clone();
        Ok(compute)
    }

    fn dns(&self, cloud: &CloudService) -> Result<Arc<dyn DnsDriver>, DriverError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        debug!(cloud = %cloud.id, "building simulated dns driver");
        let dns: Arc<dyn DnsDriver> = self.dns.clone();
        Ok(dns)
    }
}

/// A seeded account with one stopped network spanning two regions, plus the
/// backends its launches run against.
#[derive(Debug)]
pub struct SimulatedFleet {
    pub store: Arc<dyn CoordinationStore>,
    pub repository: Arc<InMemoryRepository>,
    pub compute: Arc<SimulatedCompute>,
    pub dns: Arc<SimulatedDns>,
    pub context_builder: Arc<StaticContextBuilder>,
    pub executor: Arc<ScriptedExecutor>,
    pub self_node: Node,
}

impl Default for SimulatedFleet {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFleet {
    pub fn new() -> Self {
        let repository = Arc::new(InMemoryRepository::new());
        repository.save_cloud(CloudService::new(SIM_CLOUD, "Simulated compute", SIM_ACCOUNT));
        repository.save_cloud(CloudService::new(SIM_DNS_CLOUD, "Simulated dns", SIM_ACCOUNT));
        repository.save_subscription(Subscription {
            account: SIM_ACCOUNT.into(),
            network: SIM_NETWORK.into(),
            enabled: true,
            nodes_included: 1,
        });

        let self_node = control_node();
        let mut network = Network::new(SIM_NETWORK, SIM_ACCOUNT, "sim", "fleet.test", SIM_DNS_CLOUD);
        network.footprint = SIM_REGIONS
            .iter()
            .map(|region| CloudRegion::new(SIM_CLOUD, *region))
            .collect();
        network.ssh_key = Some("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA sim-admin".into());
        network.transition(NetworkState::Stopped);

        let fleet = Self {
            store: MemoryStore::shared(),
            repository,
            compute: Arc::new(SimulatedCompute::default()),
            dns: Arc::new(SimulatedDns::default()),
            context_builder: Arc::new(StaticContextBuilder::default()),
            executor: Arc::new(ScriptedExecutor::default()),
            self_node,
        };
        // In-memory writes cannot fail.
        let _ = fleet.repository.save_network(&network);
        let _ = fleet.repository.save_node(&fleet.self_node);
        fleet
    }

    /// Allow launches of up to `nodes` nodes on the simulated network.
    pub fn set_plan(&self, enabled: bool, nodes: usize) {
        self.repository.save_subscription(Subscription {
            account: SIM_ACCOUNT.into(),
            network: SIM_NETWORK.into(),
            enabled,
            nodes_included: nodes,
        });
    }

    pub fn network(&self) -> Option<Network> {
        self.repository.network(SIM_NETWORK).ok().flatten()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.repository
            .nodes_for_network(SIM_NETWORK)
            .unwrap_or_default()
    }

    pub fn environment(
        &self,
        config: &AppConfig,
        metrics: Option<LaunchMetrics>,
    ) -> Result<LaunchEnvironment, TickError> {
        LaunchEnvironment::new(
            config,
            self.store.clone(),
            Collaborators {
                repository: self.repository.clone(),
                factory: Arc::new(SimulatedFactory::new(self.compute.clone(), self.dns.clone())),
                context_builder: self.context_builder.clone(),
                executor: self.executor.clone(),
            },
            Some(self.self_node.clone()),
            metrics,
        )
    }

    pub fn service(
        &self,
        config: &AppConfig,
        metrics: Option<LaunchMetrics>,
    ) -> Result<NetworkService, TickError> {
        self.environment(config, metrics).map(NetworkService::new)
    }
}

/// Node this process runs on, living in its own control network.
fn control_node() -> Node {
    let control = Network::new("net-control", SIM_ACCOUNT, "control", "fleet.test", SIM_DNS_CLOUD);
    let request = LaunchRequest::new(
        &control,
        "sage",
        NetLocation::exact(CloudRegion::new(SIM_CLOUD, SIM_REGIONS[0])),
        "",
        false,
    );
    let mut node = Node::for_request(&request, SIM_CLOUD, SIM_REGIONS[0]);
    node.ip4 = Some(Ipv4Addr::new(10, 255, 0, 1));
    node.ssh_user = Some("root".into());
    node.transition(NodeState::Running);
    node
}

/// Configuration with every wait cut down to milliseconds.
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.lock.lock_timeout = Duration::from_secs(5);
    config.lock.deadlock_timeout = Duration::from_secs(30);
    config.lock.poll_interval = Duration::from_millis(5);
    config.supervisor.poll_interval = Duration::from_millis(20);
    config.supervisor.activity_timeout = Duration::from_secs(10);
    config.supervisor.terminate_grace = Duration::from_secs(5);
    config.meter.touch_interval = Duration::from_millis(50);
    config.meter.close_timeout = Duration::from_secs(1);
    config.launch.relaunch_backoff = Duration::from_millis(10);
    config.launch.allocate_backoff = Duration::from_millis(5);
    config.launch.install_backoff = Duration::from_millis(5);
    config.launch.heartbeat_interval = Duration::from_millis(10);
    config.launch.node_start_timeout = Duration::from_secs(10);
    config.launch.dns_timeout = Duration::from_secs(2);
    config.launch.install_timeout = Duration::from_secs(10);
    config.launch.plan_enable_timeout = Duration::from_millis(200);
    config.launch.plan_poll_interval = Duration::from_millis(10);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_consumes_injected_failures() {
        let compute = SimulatedCompute::default();
        let fleet = SimulatedFleet::new();
        let mut node = fleet.self_node.clone();
        node.region = "east".into();

        compute.fail_transiently(1);
        assert!(matches!(compute.allocate(&node), Err(DriverError::Transient(_))));
        let allocated = compute.allocate(&node).expect("second call succeeds");
        assert_eq!(allocated.ip4, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(allocated.tags.get(TAG_INSTANCE_ID).map(String::as_str), Some("sim-1"));

        compute.mark_unavailable("east");
        assert!(matches!(
            compute.allocate(&node),
            Err(DriverError::RegionUnavailable { .. })
        ));
    }

    #[test]
    fn refused_connections_are_reported_on_stderr() {
        let executor = ScriptedExecutor::default();
        executor.refuse_connections(1);
        let invocation = RemoteInvocation {
            launch: "l1".into(),
            address: "10.0.0.1".into(),
            user: "root".into(),
            identity: None,
            staging_dir: std::env::temp_dir(),
            script: std::env::temp_dir().join("install.sh"),
            timeout: Duration::from_secs(1),
        };
        let mut seen = Vec::new();
        let first = executor
            .run(&invocation, &mut |line: &str| seen.push(line.to_owned()))
            .expect("run");
        assert_eq!(first.exit_code, 255);
        assert!(first.stderr.contains("Connection refused"));

        seen.clear();
        let second = executor
            .run(&invocation, &mut |line: &str| seen.push(line.to_owned()))
            .expect("run");
        assert!(second.is_success());
        assert!(seen.last().is_some_and(|line| line.starts_with("PLAY RECAP")));
        assert_eq!(executor.runs(), 2);
    }

    #[test]
    fn fleet_seeds_a_stopped_network() {
        let fleet = SimulatedFleet::new();
        let network = fleet.network().expect("network");
        assert_eq!(network.state, NetworkState::Stopped);
        assert_eq!(network.footprint.len(), 2);
        assert!(fleet.nodes().is_empty());
    }
}
