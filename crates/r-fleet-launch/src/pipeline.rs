//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Single launch attempt: lock check through running node."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use r_fleet_model::node::{TAG_ERROR, TAG_INSTANCE_ID};
use r_fleet_model::{LaunchRequest, Network, NetworkState, Node, NodeState};
use r_fleet_progress::{lines, ErrorLine, ProgressMeter};
use r_fleet_supervisor::Interrupt;
use tracing::{debug, info, warn};

use crate::drivers::{ComputeDriver, DriverError, ProvisioningInput, RemoteInvocation};
use crate::environment::LaunchEnvironment;
use crate::failure::{FailureKind, LaunchFailure, StepResult};
use crate::staging::StagedInstall;

const CONNECTION_ERRORS: &[&str] = &[
    "connection timed out",
    "connection timeout",
    "connection refused",
    "connection reset",
];

/// Whether install stderr says the node could not be reached yet.
pub fn is_connection_error(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    CONNECTION_ERRORS
        .iter()
        .any(|pattern| stderr.contains(pattern))
}

type Allocation = Result<Node, DriverError>;

#[derive(Default)]
struct Attempt {
    node: Option<Node>,
    compute: Option<Arc<dyn ComputeDriver>>,
    /// Allocation helper still running after the attempt gave up on it.
    pending: Option<Receiver<Allocation>>,
}

/// One launch attempt for one request.
///
/// The request's lock token must be held when the attempt starts; it is
/// released when [`LaunchPipeline::run`] returns, whatever the outcome.
/// The lease is refreshed on every heartbeat while a helper runs, and a
/// lost lease stops the attempt before its next node transition.
pub struct LaunchPipeline<'a> {
    env: &'a LaunchEnvironment,
    request: &'a LaunchRequest,
    interrupt: &'a Interrupt,
    meter: &'a Arc<ProgressMeter>,
    lease_lost: Arc<AtomicBool>,
}

impl<'a> LaunchPipeline<'a> {
    pub fn new(
        env: &'a LaunchEnvironment,
        request: &'a LaunchRequest,
        interrupt: &'a Interrupt,
        meter: &'a Arc<ProgressMeter>,
    ) -> Self {
        Self {
            env,
            request,
            interrupt,
            meter,
            lease_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a flag raised elsewhere (the meter's liveness hook) when the
    /// network lock turns out to be held by another token.
    pub fn with_lease_flag(mut self, lease_lost: Arc<AtomicBool>) -> Self {
        self.lease_lost = lease_lost;
        self
    }

    pub fn run(self) -> StepResult<Node> {
        let started = Instant::now();
        let mut attempt = Attempt::default();
        info!(
            network = %self.request.network,
            launch = %self.request.id,
            host = %self.request.host,
            target = ?self.request.target().map(ToString::to_string),
            "launch attempt starting"
        );

        let result = match self.execute(&mut attempt) {
            Ok(node) => Ok(node),
            Err(failure) => Err(self.fail(failure, &mut attempt)),
        };
        self.finish(&attempt);

        match &result {
            Ok(node) => info!(
                network = %self.request.network,
                launch = %self.request.id,
                node = %node.id,
                elapsed = ?started.elapsed(),
                "node launched"
            ),
            Err(failure) => warn!(
                network = %self.request.network,
                launch = %self.request.id,
                kind = %failure.kind(),
                error = %failure.message(),
                "launch attempt failed"
            ),
        }
        result
    }

    fn execute(&self, attempt: &mut Attempt) -> StepResult<Node> {
        self.meter.write(lines::CONFIRMING_NETWORK_LOCK);
        self.confirm_lock()?;
        self.interrupt.check()?;

        self.meter.write(lines::VALIDATING_NODE_NETWORK_AND_PLAN);
        let (network, self_node) = self.validate()?;
        self.interrupt.check()?;

        self.meter.write(lines::CREATING_NODE);
        let mut node = self.create_node(&network, attempt)?;

        let sage = if self.request.fork {
            node.clone()
        } else {
            self_node
        };
        node.sage = Some(sage.id.clone());
        self.save(&node, attempt)?;

        self.meter.write(lines::LAUNCHING_NODE);
        self.meter.write(lines::PREPARING_ROLES);
        let context = self
            .env
            .context_builder
            .build(&ProvisioningInput {
                network: &network,
                node: &node,
                sage: node.sage.as_deref(),
                roles: &self.env.launch.roles,
                restore_key: self.request.restore_key.as_deref(),
            })
            .map_err(|err| {
                self.meter_error(
                    ErrorLine::RoleValidationFailed,
                    LaunchFailure::from_driver(err, "building provisioning context"),
                )
            })?;
        if !context.is_valid() {
            return Err(self.meter_error(
                ErrorLine::RoleValidationFailed,
                LaunchFailure::fatal(format!(
                    "role validation failed: {}",
                    context.violations.join("; ")
                )),
            ));
        }
        self.interrupt.check()?;

        let mut node = self.allocate(node, attempt)?;

        self.meter.write(lines::PREPARING_INSTALL);
        self.transition(&mut node, NodeState::PreparingInstall, attempt)?;
        let sage = if self.request.fork { &node } else { &sage };
        let staged = StagedInstall::prepare(
            self.env.launch.staging_root.as_deref(),
            &network,
            &node,
            Some(sage),
            &context,
        )
        .map_err(|err| LaunchFailure::fatal("staging install files failed").with_source(err))?;

        self.transition(&mut node, NodeState::AwaitingDns, attempt)?;
        self.publish_dns(&network, &node)?;

        self.meter.write(lines::STARTING_INSTALL);
        self.transition(&mut node, NodeState::Installing, attempt)?;
        self.install(&node, &staged)?;

        self.confirm_lock()?;
        self.transition(&mut node, NodeState::Running, attempt)?;
        let final_state = if self.request.is_restore() {
            NetworkState::Restoring
        } else {
            NetworkState::Running
        };
        self.env
            .repository
            .update_network_state(&network.id, final_state)
            .map_err(|err| LaunchFailure::fatal("updating network state").with_source(err))?;
        self.meter.settle(self.env.meter.close_timeout);
        self.meter.completed();
        Ok(node)
    }

    fn confirm_lock(&self) -> StepResult<()> {
        match self.env.lock.confirm(&self.request.network, &self.request.lock) {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.lost_lease()),
            Err(err) => Err(self.meter_error(
                ErrorLine::ConfirmingNetworkLock,
                LaunchFailure::fatal("network lock could not be confirmed").with_source(err),
            )),
        }
    }

    fn validate(&self) -> StepResult<(Network, Node)> {
        let network = self
            .env
            .repository
            .network(&self.request.network)
            .map_err(|err| LaunchFailure::fatal("loading network").with_source(err))?;
        let Some(network) = network else {
            return Err(self.meter_error(
                ErrorLine::NoCurrentNodeOrNetwork,
                LaunchFailure::fatal(format!("network {} not found", self.request.network)),
            ));
        };
        let expected = if self.request.is_restore() {
            NetworkState::Restoring
        } else {
            NetworkState::Setup
        };
        if network.state != expected {
            return Err(self.meter_error(
                ErrorLine::NetworkNotReadyForSetup,
                LaunchFailure::fatal(format!(
                    "network {} is {}, expected {}",
                    network.id, network.state, expected
                )),
            ));
        }
        let Some(self_node) = self.env.self_node.clone() else {
            return Err(self.meter_error(
                ErrorLine::NoCurrentNodeOrNetwork,
                LaunchFailure::fatal("this process has no node identity"),
            ));
        };

        let plan = self
            .env
            .repository
            .subscription(&network.account, &network.id)
            .map_err(|err| LaunchFailure::fatal("loading plan").with_source(err))?;
        let Some(plan) = plan.filter(|plan| plan.enabled) else {
            return Err(self.meter_error(
                ErrorLine::PlanNotEnabled,
                LaunchFailure::fatal(format!("no enabled plan for network {}", network.id)),
            ));
        };
        let existing = self
            .env
            .repository
            .active_nodes(&network.id)
            .map_err(|err| LaunchFailure::fatal("counting nodes").with_source(err))?
            .len();
        if existing >= plan.nodes_included {
            if self.request.automated {
                return Err(self.meter_error(
                    ErrorLine::PeerLimitReached,
                    LaunchFailure::fatal(format!(
                        "network {} already has {} of {} included nodes",
                        network.id, existing, plan.nodes_included
                    )),
                ));
            }
            warn!(network = %network.id, existing, included = plan.nodes_included, "manual launch beyond plan node limit");
        }
        Ok((network, self_node))
    }

    fn create_node(&self, network: &Network, attempt: &mut Attempt) -> StepResult<Node> {
        let Some(target) = self.request.target() else {
            return Err(LaunchFailure::unavailable_region(format!(
                "no candidate region left for network {}",
                network.id
            )));
        };
        let cloud = self.env.resolve_cloud(&target.cloud).map_err(|err| {
            self.meter_error(
                ErrorLine::NodeCloudNotFound,
                LaunchFailure::from_driver(err, "resolving cloud"),
            )
        })?;
        let compute = self.env.compute_for(&cloud).map_err(|err| {
            self.meter_error(
                ErrorLine::NodeCloudNotFound,
                LaunchFailure::from_driver(err, "building compute driver"),
            )
        })?;
        attempt.compute = Some(compute.clone());
        let size = compute.resolve_size(&network.compute_size).map_err(|err| {
            self.meter_error(
                ErrorLine::StartingNode,
                LaunchFailure::from_driver(err, "resolving instance size"),
            )
        })?;

        let mut node = Node::for_request(self.request, &cloud.id, &target.region);
        node.size = Some(size);
        self.save(&node, attempt)?;
        debug!(node = %node.id, cloud = %cloud.id, region = %target.region, "node record created");
        Ok(node)
    }

    /// Steps the node through starting and booting while the compute driver
    /// allocates it. Transient driver failures are retried in place.
    fn allocate(&self, mut node: Node, attempt: &mut Attempt) -> StepResult<Node> {
        let compute = attempt
            .compute
            .clone()
            .ok_or_else(|| LaunchFailure::fatal("compute driver missing"))?;
        self.transition(&mut node, NodeState::Starting, attempt)?;
        self.transition(&mut node, NodeState::Booting, attempt)?;

        let max = self.env.launch.max_allocate_attempts;
        let mut tries = 0;
        let allocated = loop {
            tries += 1;
            let call = {
                let compute = compute.clone();
                let node = node.clone();
                move || compute.allocate(&node)
            };
            let receiver = self.spawn_helper("allocate", call)?;
            let timeout = self.env.launch.node_start_timeout;
            let outcome = match self.await_helper("allocate", timeout, |_| {}, &receiver) {
                Ok(outcome) => outcome,
                Err(failure) => {
                    attempt.pending = Some(receiver);
                    return Err(failure);
                }
            };
            let failure = match outcome {
                Ok(allocated) => break allocated,
                Err(err) => LaunchFailure::from_driver(err, "allocating node"),
            };
            if failure.kind() != FailureKind::CanRetry || tries >= max {
                return Err(self.meter_error(ErrorLine::StartingNode, failure.or_node(Some(&node))));
            }
            warn!(node = %node.id, attempt = tries, max, error = %failure.message(), "allocation failed, retrying");
            self.interrupt.sleep(self.env.launch.allocate_backoff * tries as u32)?;
        };

        node = Node {
            state: node.state,
            ..allocated
        };
        if !node.has_address() || node.ssh_user.is_none() {
            self.save(&node, attempt)?;
            return Err(self.meter_error(
                ErrorLine::NodeHasNoAddress,
                LaunchFailure::fatal(format!("node {} booted without address or ssh user", node.id)),
            ));
        }
        self.transition(&mut node, NodeState::Booted, attempt)?;
        Ok(node)
    }

    fn publish_dns(&self, network: &Network, node: &Node) -> StepResult<()> {
        let dns = self.env.dns_for(network).map_err(|err| {
            self.meter_error(
                ErrorLine::SettingDnsEntries,
                LaunchFailure::from_driver(err, "building dns driver"),
            )
        })?;
        dns.publish_node(node).map_err(|err| {
            self.meter_error(
                ErrorLine::SettingDnsEntries,
                LaunchFailure::from_driver(err, "publishing node dns"),
            )
        })?;

        let timeout = self.env.launch.dns_timeout;
        let call = {
            let node = node.clone();
            move || dns.wait_until_resolvable(&node, timeout)
        };
        let meter = self.meter.clone();
        let on_beat = move |beat: u32| meter.write(&lines::await_line(beat));
        self.supervised("dns", timeout, on_beat, call)?
            .map_err(|err| {
                self.meter_error(
                    ErrorLine::SettingDnsEntries,
                    LaunchFailure::from_driver(err, "waiting for dns"),
                )
            })
    }

    fn install(&self, node: &Node, staged: &StagedInstall) -> StepResult<()> {
        let address = node
            .address()
            .ok_or_else(|| LaunchFailure::fatal("node lost its address"))?;
        let invocation = RemoteInvocation {
            launch: self.request.id.clone(),
            address,
            user: node
                .ssh_user
                .clone()
                .unwrap_or_else(|| self.env.launch.ssh_user.clone()),
            identity: self.env.launch.ssh_identity.clone(),
            staging_dir: staged.path().to_path_buf(),
            script: staged.script(),
            timeout: self.env.launch.install_timeout,
        };

        let max = self.env.launch.max_install_attempts;
        for tries in 1..=max {
            if tries > 1 {
                self.interrupt
                    .sleep(self.env.launch.install_backoff * (tries - 1) as u32)?;
            }
            let call = {
                let executor = self.env.executor.clone();
                let meter = self.meter.clone();
                let invocation = invocation.clone();
                move || executor.run(&invocation, &mut |line: &str| meter.write(line))
            };
            // The run enforces its own timeout; the margin covers process teardown.
            let limit = invocation.timeout + Duration::from_secs(60);
            let reason = match self.supervised("install", limit, |_| {}, call)? {
                Ok(outcome) if outcome.is_success() => {
                    self.count_install("success");
                    info!(node = %node.id, attempt = tries, "install finished");
                    return Ok(());
                }
                Ok(outcome) if is_connection_error(&outcome.stderr) => {
                    format!("exit status {}: {}", outcome.exit_code, last_line(&outcome.stderr))
                }
                Ok(outcome) => {
                    self.count_install("failed");
                    return Err(self.meter_error(
                        ErrorLine::InstallFailed,
                        LaunchFailure::fatal(format!(
                            "install exited with status {}: {}",
                            outcome.exit_code,
                            last_line(&outcome.stderr)
                        )),
                    ));
                }
                Err(DriverError::Interrupted) => {
                    return Err(LaunchFailure::interrupted("install interrupted"))
                }
                Err(err) => err.to_string(),
            };

            self.count_install("retry");
            warn!(node = %node.id, attempt = tries, max, reason = %reason, "install attempt failed");
            self.meter.settle(self.env.meter.close_timeout);
            if tries < max {
                self.meter.reset().map_err(|err| {
                    LaunchFailure::fatal("progress meter closed during install").with_source(err)
                })?;
            }
        }
        Err(self.meter_error(
            ErrorLine::InstallFailed,
            LaunchFailure::fatal(format!("install failed after {} attempts", max)),
        ))
    }

    /// Run `call` on a helper thread and wait for it with
    /// [`LaunchPipeline::await_helper`].
    fn supervised<T, F, B>(
        &self,
        what: &'static str,
        timeout: Duration,
        on_beat: B,
        call: F,
    ) -> StepResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        B: FnMut(u32),
    {
        let receiver = self.spawn_helper(what, call)?;
        self.await_helper(what, timeout, on_beat, &receiver)
    }

    /// The result slot holds one value, so the helper never blocks on send
    /// even when nobody is waiting any more.
    fn spawn_helper<T, F>(&self, what: &'static str, call: F) -> StepResult<Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = channel::bounded(1);
        thread::Builder::new()
            .name(format!("{}-{}", what, self.request.host))
            .spawn(move || {
                let _ = sender.send(call());
            })
            .map_err(|err| LaunchFailure::fatal(format!("spawning {} helper", what)).with_source(err))?;
        Ok(receiver)
    }

    /// Every heartbeat the worker checks its interrupt, proves liveness to
    /// the supervisor, refreshes the network lock lease and runs `on_beat`.
    fn await_helper<T, B>(
        &self,
        what: &'static str,
        timeout: Duration,
        mut on_beat: B,
        receiver: &Receiver<T>,
    ) -> StepResult<T>
    where
        B: FnMut(u32),
    {
        let started = Instant::now();
        let heartbeat = self.env.launch.heartbeat_interval;
        let mut beats = 0;
        loop {
            match receiver.recv_timeout(heartbeat) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => {
                    self.interrupt.check()?;
                    self.env.supervisor.touch(&self.request.network);
                    self.refresh_lease(what)?;
                    if started.elapsed() >= timeout {
                        return Err(LaunchFailure::can_retry(format!(
                            "{} did not finish within {:?}",
                            what, timeout
                        )));
                    }
                    on_beat(beats);
                    beats += 1;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(LaunchFailure::fatal(format!(
                        "{} helper exited without a result",
                        what
                    )))
                }
            }
        }
    }

    /// A store error only costs one refresh; a lease held by another token
    /// ends the attempt.
    fn refresh_lease(&self, what: &str) -> StepResult<()> {
        match self.env.lock.confirm(&self.request.network, &self.request.lock) {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.lost_lease()),
            Err(err) => {
                warn!(network = %self.request.network, step = what, error = %err, "lock refresh failed");
                Ok(())
            }
        }
    }

    fn lost_lease(&self) -> LaunchFailure {
        self.lease_lost.store(true, Ordering::SeqCst);
        self.meter_error(
            ErrorLine::ConfirmingNetworkLock,
            LaunchFailure::fatal("network lock is no longer held by this launch"),
        )
    }

    fn save(&self, node: &Node, attempt: &mut Attempt) -> StepResult<()> {
        attempt.node = Some(node.clone());
        self.env
            .repository
            .save_node(node)
            .map_err(|err| LaunchFailure::fatal("saving node").with_source(err))
    }

    fn transition(&self, node: &mut Node, state: NodeState, attempt: &mut Attempt) -> StepResult<()> {
        if self.lease_lost.load(Ordering::SeqCst) {
            return Err(self.lost_lease());
        }
        debug!(node = %node.id, from = %node.state, to = %state, "node transition");
        node.transition(state);
        self.save(node, attempt)
    }

    fn meter_error(&self, line: ErrorLine, failure: LaunchFailure) -> LaunchFailure {
        if !failure.is_interrupted() {
            self.meter.error(line.line());
        }
        failure
    }

    fn count_install(&self, outcome: &str) {
        if let Some(metrics) = &self.env.metrics {
            metrics.install_attempt(outcome);
        }
    }

    fn fail(&self, failure: LaunchFailure, attempt: &mut Attempt) -> LaunchFailure {
        let Some(mut node) = attempt.node.take() else {
            if failure.is_interrupted() {
                self.meter.cancel();
            } else {
                self.meter.error(failure.message());
            }
            return failure;
        };

        if let Some(pending) = attempt.pending.take() {
            return self.abandon(failure, node, attempt.compute.clone(), pending);
        }

        if failure.is_interrupted() {
            self.meter.cancel();
            self.stop_quietly(&mut node, attempt.compute.as_deref());
            return failure.or_node(Some(&node));
        }

        // First error wins, so this only lands when no step reported one.
        self.meter.error(failure.message());
        node.tag(TAG_ERROR, failure.message());
        if let Err(err) = self
            .env
            .repository
            .update_node_state(&mut node, NodeState::UnknownError)
        {
            warn!(node = %node.id, error = %err, "could not record node error");
        }
        kill_node(self.env, attempt.compute.as_deref(), &mut node, failure.message());
        failure.with_node(node)
    }

    /// The allocation helper outlived the attempt. The node waits in a
    /// stopping state until a reaper frees whatever the helper returns.
    fn abandon(
        &self,
        failure: LaunchFailure,
        mut node: Node,
        compute: Option<Arc<dyn ComputeDriver>>,
        pending: Receiver<Allocation>,
    ) -> LaunchFailure {
        let (stopping, stopped) = if failure.is_interrupted() {
            self.meter.cancel();
            (NodeState::Stopping, NodeState::Stopped)
        } else {
            self.meter.error(failure.message());
            node.tag(TAG_ERROR, failure.message());
            (NodeState::ErrorStopping, NodeState::ErrorStopped)
        };
        if let Err(err) = self.env.repository.update_node_state(&mut node, stopping) {
            warn!(node = %node.id, error = %err, "could not park node with pending allocation");
        }
        match compute {
            Some(compute) => reap_allocation(self.env.clone(), compute, node.clone(), pending, stopped),
            None => warn!(node = %node.id, "no compute driver to reap pending allocation"),
        }
        failure.or_node(Some(&node))
    }

    /// Best-effort teardown after an interrupt. Not an error state, but a
    /// node whose instance could not be freed stays `stopping`.
    fn stop_quietly(&self, node: &mut Node, compute: Option<&dyn ComputeDriver>) {
        let holds_instance = node.has_address() || node.tags.contains_key(TAG_INSTANCE_ID);
        if holds_instance {
            if let Err(err) = self.env.repository.update_node_state(node, NodeState::Stopping) {
                warn!(node = %node.id, error = %err, "could not mark canceled node stopping");
            }
            let released = match compute {
                Some(compute) => compute.deallocate(node).map(|_| ()),
                None => Err(DriverError::Failed("no compute driver".into())),
            };
            if let Err(err) = released {
                warn!(node = %node.id, error = %err, "deallocation after cancel failed");
                return;
            }
        }
        if let Err(err) = self
            .env
            .repository
            .update_node_state(node, NodeState::Stopped)
        {
            warn!(node = %node.id, error = %err, "could not mark canceled node stopped");
        }
    }

    fn finish(&self, attempt: &Attempt) {
        if let Some(compute) = &attempt.compute {
            if let Err(err) = compute.cleanup_after_launch(attempt.node.as_ref()) {
                warn!(launch = %self.request.id, error = %err, "post-launch cleanup failed");
            }
        }
        self.meter.close();
        match self.env.lock.release(&self.request.network, &self.request.lock) {
            Ok(_) => {}
            Err(err) => {
                warn!(network = %self.request.network, error = %err, "lock release failed, lease will expire")
            }
        }
    }
}

/// Stop the compute instance behind `node` and leave it in an inspectable
/// error state: `error_stopping`, then `error_stopped` once deallocated.
/// Teardown failures are logged, never raised.
pub fn kill_node(
    env: &LaunchEnvironment,
    compute: Option<&dyn ComputeDriver>,
    node: &mut Node,
    message: &str,
) {
    node.tag(TAG_ERROR, message);
    if let Err(err) = env
        .repository
        .update_node_state(node, NodeState::ErrorStopping)
    {
        warn!(node = %node.id, error = %err, "could not mark node error_stopping");
    }

    let resolved;
    let compute = match compute {
        Some(compute) => Some(compute),
        None => {
            resolved = env
                .resolve_cloud(&node.cloud)
                .and_then(|cloud| env.compute_for(&cloud));
            match &resolved {
                Ok(compute) => Some(compute.as_ref()),
                Err(err) => {
                    warn!(node = %node.id, error = %err, "no compute driver to stop node");
                    None
                }
            }
        }
    };

    let stopped = match compute {
        Some(compute) if node.has_address() || node.tags.contains_key(TAG_INSTANCE_ID) => {
            match compute.deallocate(node) {
                Ok(_) => true,
                Err(err) => {
                    warn!(node = %node.id, error = %err, "stopping node failed");
                    false
                }
            }
        }
        // Never allocated, nothing to stop.
        Some(_) => true,
        None => false,
    };

    if let Ok(Some(network)) = env.repository.network(&node.network) {
        if let Err(err) = env.dns_for(&network).and_then(|dns| dns.remove_node(node)) {
            debug!(node = %node.id, error = %err, "dns cleanup failed");
        }
    }

    if stopped {
        if let Err(err) = env
            .repository
            .update_node_state(node, NodeState::ErrorStopped)
        {
            warn!(node = %node.id, error = %err, "could not mark node error_stopped");
        }
        info!(node = %node.id, reason = message, "node killed");
    }
}

/// Wait on a thread of its own for an abandoned allocation, free the
/// instance it produced and then move the node to `stopped`. A node whose
/// instance could not be freed keeps its stopping state. A node record
/// deleted meanwhile (the network was stopped) is not written back.
fn reap_allocation(
    env: LaunchEnvironment,
    compute: Arc<dyn ComputeDriver>,
    node: Node,
    pending: Receiver<Allocation>,
    stopped: NodeState,
) {
    let host = node.host.clone();
    let id = node.id.clone();
    let spawned = thread::Builder::new()
        .name(format!("reap-{}", host))
        .spawn(move || {
            let mut node = node;
            let outcome = pending.recv();
            let tracked = matches!(env.repository.node(&node.id), Ok(Some(_)));
            let released = match outcome {
                Ok(Ok(allocated)) => {
                    let mut merged = Node {
                        state: node.state,
                        ..allocated
                    };
                    for (key, value) in &node.tags {
                        merged.tags.insert(key.clone(), value.clone());
                    }
                    node = merged;
                    if tracked {
                        if let Err(err) = env.repository.save_node(&node) {
                            warn!(node = %node.id, error = %err, "could not record late allocation");
                        }
                    }
                    match compute.deallocate(&node) {
                        Ok(_) => {
                            info!(node = %node.id, "late allocation released");
                            true
                        }
                        Err(err) => {
                            warn!(node = %node.id, error = %err, "releasing late allocation failed");
                            false
                        }
                    }
                }
                Ok(Err(err)) => {
                    debug!(node = %node.id, error = %err, "abandoned allocation failed, nothing to release");
                    true
                }
                Err(_) => {
                    debug!(node = %node.id, "allocation helper exited without a result");
                    true
                }
            };
            if released && tracked {
                if let Err(err) = env.repository.update_node_state(&mut node, stopped) {
                    warn!(node = %node.id, error = %err, "could not settle reaped node");
                }
            }
        });
    if let Err(err) = spawned {
        warn!(node = %id, error = %err, "could not start allocation reaper, node stays stopping");
    }
}

fn last_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_recognised() {
        assert!(is_connection_error(
            "ssh: connect to host 10.0.0.1 port 22: Connection refused"
        ));
        assert!(is_connection_error("SSH connection timeout while copying"));
        assert!(!is_connection_error("TASK [app] failed: missing variable"));
    }

    #[test]
    fn last_line_skips_trailing_blanks() {
        assert_eq!(last_line("first\nsecond\n\n"), "second");
        assert_eq!(last_line(""), "");
    }
}
