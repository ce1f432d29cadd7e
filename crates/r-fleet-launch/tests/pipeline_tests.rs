//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch attempts against the simulated cloud."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use r_fleet_common::new_registry;
use r_fleet_launch::sim::{fast_config, SimulatedFleet, SIM_ACCOUNT, SIM_CLOUD, SIM_NETWORK};
use r_fleet_launch::{FailureKind, LaunchEnvironment, LaunchMetrics, LaunchPipeline, NetworkService};
use r_fleet_common::config::AppConfig;
use r_fleet_model::node::{TAG_ERROR, TAG_INSTANCE_ID};
use r_fleet_model::{CloudRegion, FleetRepository, LaunchRequest, NetLocation, NetworkState, NodeState};
use r_fleet_progress::{ErrorLine, MeterIdentity, ProgressMeter, ProgressTick, METER_COMPLETED};
use r_fleet_supervisor::Interrupt;

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn wait_finished(service: &NetworkService) {
    wait_for("launch worker to finish", || {
        service.supervisor().registered_launch(SIM_NETWORK).is_none()
    });
}

fn status(service: &NetworkService, request: &LaunchRequest) -> ProgressTick {
    service
        .get_launch_status(SIM_ACCOUNT, &request.id)
        .expect("status store")
        .expect("status published")
}

struct Launch {
    fleet: SimulatedFleet,
    service: NetworkService,
    metrics: LaunchMetrics,
}

impl Launch {
    fn new() -> Self {
        Self::with_config(&fast_config())
    }

    fn with_config(config: &AppConfig) -> Self {
        let fleet = SimulatedFleet::new();
        let metrics = LaunchMetrics::new(new_registry()).expect("metrics");
        let service = fleet
            .service(config, Some(metrics.clone()))
            .expect("service");
        Self {
            fleet,
            service,
            metrics,
        }
    }

    fn start(&self, location: Option<NetLocation>) -> LaunchRequest {
        let request = self
            .service
            .start_network(SIM_NETWORK, location, false)
            .expect("start");
        wait_finished(&self.service);
        request
    }

    fn start_in_background(&self) -> LaunchRequest {
        self.service
            .start_network(SIM_NETWORK, None, false)
            .expect("start")
    }

    fn wait_booting(&self) {
        wait_for("node to start booting", || {
            self.fleet
                .nodes()
                .first()
                .is_some_and(|node| node.state == NodeState::Booting)
        });
    }

    fn network_state(&self) -> NetworkState {
        self.fleet.network().expect("network").state
    }

    fn lock_holder(&self) -> Option<String> {
        self.service.env().lock.holder(SIM_NETWORK).expect("lock store")
    }
}

fn pipeline_meter(env: &LaunchEnvironment, request: &LaunchRequest) -> Arc<ProgressMeter> {
    Arc::new(
        ProgressMeter::new(
            MeterIdentity::new(&request.account, &request.network, &request.id),
            env.catalog.clone(),
            env.statuses.clone(),
            &env.meter,
            None,
        )
        .expect("meter"),
    )
}

/// Network in setup with its lock held, ready for one direct attempt.
fn locked_request(env: &LaunchEnvironment) -> LaunchRequest {
    let network = env
        .repository
        .update_network_state(SIM_NETWORK, NetworkState::Setup)
        .expect("setup");
    let token = env.lock.acquire(SIM_NETWORK).expect("lock");
    LaunchRequest::new(
        &network,
        "alpha1",
        NetLocation::exact(CloudRegion::new(SIM_CLOUD, "west")),
        token.as_str(),
        false,
    )
}

#[test]
fn single_attempt_runs_to_completion_and_releases_lock() {
    let fleet = SimulatedFleet::new();
    let env = fleet.environment(&fast_config(), None).expect("environment");
    let request = locked_request(&env);
    let meter = pipeline_meter(&env, &request);
    let interrupt = Interrupt::new();

    let node = LaunchPipeline::new(&env, &request, &interrupt, &meter)
        .run()
        .expect("launch");

    assert_eq!(node.state, NodeState::Running);
    assert_eq!(node.region, "west");
    assert_eq!(node.fqdn, "alpha1.sim.fleet.test");
    assert_eq!(node.sage.as_deref(), Some(fleet.self_node.id.as_str()));
    assert!(meter.is_completed());
    assert_eq!(meter.percent(), 100);
    assert_eq!(env.lock.holder(SIM_NETWORK).expect("holder"), None);
    assert_eq!(
        fleet.network().expect("network").state,
        NetworkState::Running
    );
    assert_eq!(fleet.dns.published(), vec!["alpha1.sim.fleet.test".to_owned()]);
}

#[test]
fn attempt_without_the_lock_fails_before_touching_the_cloud() {
    let fleet = SimulatedFleet::new();
    let env = fleet.environment(&fast_config(), None).expect("environment");
    let network = env
        .repository
        .update_network_state(SIM_NETWORK, NetworkState::Setup)
        .expect("setup");
    let request = LaunchRequest::new(
        &network,
        "alpha1",
        NetLocation::any_of(network.footprint.clone()),
        "not-the-holder",
        false,
    );
    let meter = pipeline_meter(&env, &request);

    let failure = LaunchPipeline::new(&env, &request, &Interrupt::new(), &meter)
        .run()
        .expect_err("lock is not held");

    assert_eq!(failure.kind(), FailureKind::Fatal);
    assert_eq!(
        meter.error_line().as_deref(),
        Some(ErrorLine::ConfirmingNetworkLock.line())
    );
    assert!(fleet.compute.allocated().is_empty());
    assert!(fleet.nodes().is_empty());
}

#[test]
fn start_brings_network_and_node_to_running() {
    let launch = Launch::new();
    let request = launch.start(None);

    assert_eq!(launch.network_state(), NetworkState::Running);
    let nodes = launch.fleet.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].state, NodeState::Running);
    assert_eq!(nodes[0].region, "east");
    assert!(nodes[0].has_address());
    assert_eq!(launch.lock_holder(), None);

    let tick = status(&launch.service, &request);
    assert_eq!(tick.message_key, METER_COMPLETED);
    assert_eq!(tick.percent, 100);
    assert!(!tick.error);
    assert_eq!(launch.fleet.dns.published_networks(), vec!["sim.fleet.test".to_owned()]);
    assert_eq!(launch.metrics.launches("success"), 1);
    assert_eq!(launch.metrics.in_flight(), 0);
}

#[test]
fn refused_install_connections_are_retried_in_place() {
    let launch = Launch::new();
    launch.fleet.executor.refuse_connections(2);
    let request = launch.start(None);

    assert_eq!(launch.fleet.executor.runs(), 3);
    assert_eq!(launch.fleet.compute.allocated().len(), 1);
    assert_eq!(status(&launch.service, &request).message_key, METER_COMPLETED);
    assert_eq!(launch.metrics.install_attempts("retry"), 2);
    assert_eq!(launch.metrics.install_attempts("success"), 1);
    assert_eq!(launch.network_state(), NetworkState::Running);
}

#[test]
fn install_retries_rewind_the_meter_once_per_refusal() {
    let fleet = SimulatedFleet::new();
    let env = fleet.environment(&fast_config(), None).expect("environment");
    fleet.executor.refuse_connections(2);
    let request = locked_request(&env);
    let meter = pipeline_meter(&env, &request);

    LaunchPipeline::new(&env, &request, &Interrupt::new(), &meter)
        .run()
        .expect("launch");

    assert_eq!(fleet.executor.runs(), 3);
    assert_eq!(meter.resets(), 2);
    assert!(meter.is_completed());
    assert_eq!(meter.percent(), 100);
    assert_eq!(meter.error_line(), None);
}

#[test]
fn last_install_attempt_ends_on_an_error_tick_without_rewinding() {
    let fleet = SimulatedFleet::new();
    let config = fast_config();
    let max = config.launch.max_install_attempts;
    let env = fleet.environment(&config, None).expect("environment");
    fleet.executor.refuse_connections(10);
    let request = locked_request(&env);
    let meter = pipeline_meter(&env, &request);

    let failure = LaunchPipeline::new(&env, &request, &Interrupt::new(), &meter)
        .run()
        .expect_err("install never connects");

    assert_eq!(failure.kind(), FailureKind::Fatal);
    assert_eq!(fleet.executor.runs(), max);
    assert_eq!(meter.resets(), max - 1);
    assert!(!meter.is_completed());
    assert_eq!(
        meter.error_line().as_deref(),
        Some(ErrorLine::InstallFailed.line())
    );
    let tick = env
        .statuses
        .get(SIM_ACCOUNT, &request.id)
        .expect("status store")
        .expect("status published");
    assert!(tick.error);
    assert_eq!(tick.message_key, ErrorLine::InstallFailed.message_key());
    assert_eq!(env.lock.holder(SIM_NETWORK).expect("holder"), None);
}

#[test]
fn exhausted_install_attempts_kill_the_node() {
    let launch = Launch::new();
    launch.fleet.executor.refuse_connections(10);
    let request = launch.start(None);

    assert_eq!(launch.fleet.executor.runs(), 3);
    let tick = status(&launch.service, &request);
    assert!(tick.error);
    assert_eq!(tick.message_key, ErrorLine::InstallFailed.message_key());

    let nodes = launch.fleet.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].state, NodeState::ErrorStopped);
    assert!(nodes[0].tags.contains_key(TAG_ERROR));
    assert_eq!(launch.fleet.compute.deallocated(), vec![nodes[0].id.clone()]);
    assert_eq!(launch.fleet.dns.removed(), vec![nodes[0].fqdn.clone()]);
    assert_eq!(launch.network_state(), NetworkState::Stopped);
    assert_eq!(launch.lock_holder(), None);
    assert_eq!(launch.metrics.launches("fatal"), 1);
}

#[test]
fn failing_install_script_is_not_retried() {
    let launch = Launch::new();
    launch.fleet.executor.fail_fatally(true);
    let request = launch.start(None);

    assert_eq!(launch.fleet.executor.runs(), 1);
    assert_eq!(
        status(&launch.service, &request).message_key,
        ErrorLine::InstallFailed.message_key()
    );
    assert_eq!(launch.network_state(), NetworkState::Stopped);
}

#[test]
fn transient_allocation_failures_stay_within_one_attempt() {
    let launch = Launch::new();
    launch.fleet.compute.fail_transiently(2);
    let request = launch.start(None);

    assert_eq!(launch.fleet.nodes().len(), 1);
    assert_eq!(launch.fleet.compute.allocated().len(), 1);
    assert_eq!(status(&launch.service, &request).message_key, METER_COMPLETED);
}

#[test]
fn unavailable_region_falls_back_to_next_candidate() {
    let launch = Launch::new();
    launch.fleet.compute.mark_unavailable("east");
    let request = launch.start(None);

    assert_eq!(launch.network_state(), NetworkState::Running);
    let nodes = launch.fleet.nodes();
    assert_eq!(nodes.len(), 2);
    let east = nodes.iter().find(|node| node.region == "east").expect("east node");
    let west = nodes.iter().find(|node| node.region == "west").expect("west node");
    assert_eq!(east.state, NodeState::ErrorStopped);
    assert_eq!(west.state, NodeState::Running);
    assert_ne!(east.host, west.host);
    assert_eq!(status(&launch.service, &request).message_key, METER_COMPLETED);
    assert_eq!(launch.lock_holder(), None);
}

#[test]
fn exact_region_does_not_fall_back() {
    let launch = Launch::new();
    launch.fleet.compute.mark_unavailable("east");
    let request = launch.start(Some(NetLocation::exact(CloudRegion::new(SIM_CLOUD, "east"))));

    assert_eq!(launch.network_state(), NetworkState::Stopped);
    assert!(launch.fleet.compute.allocated().is_empty());
    let nodes = launch.fleet.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].state, NodeState::ErrorStopped);
    assert_eq!(
        status(&launch.service, &request).message_key,
        ErrorLine::StartingNode.message_key()
    );
    assert_eq!(launch.metrics.launches("unavailable_region"), 1);
}

#[test]
fn role_violations_abort_before_allocation() {
    let launch = Launch::new();
    launch.fleet.context_builder.reject_with("app: missing admin email");
    let request = launch.start(None);

    assert!(launch.fleet.compute.allocated().is_empty());
    assert_eq!(
        status(&launch.service, &request).message_key,
        ErrorLine::RoleValidationFailed.message_key()
    );
    assert_eq!(launch.network_state(), NetworkState::Stopped);
    assert_eq!(launch.fleet.nodes()[0].state, NodeState::ErrorStopped);
}

#[test]
fn node_booting_without_address_is_fatal() {
    let launch = Launch::new();
    launch.fleet.compute.omit_address(true);
    let request = launch.start(None);

    assert_eq!(launch.fleet.compute.allocated().len(), 1);
    assert_eq!(
        status(&launch.service, &request).message_key,
        ErrorLine::NodeHasNoAddress.message_key()
    );
    let nodes = launch.fleet.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].state, NodeState::ErrorStopped);
    assert_eq!(launch.network_state(), NetworkState::Stopped);
}

#[test]
fn long_allocation_keeps_the_lock_past_its_lease() {
    let mut config = fast_config();
    config.lock.deadlock_timeout = Duration::from_millis(150);
    let launch = Launch::with_config(&config);
    launch.fleet.compute.set_allocate_delay(Duration::from_millis(600));

    let request = launch.start_in_background();
    launch.wait_booting();
    thread::sleep(Duration::from_millis(300));

    assert_eq!(launch.lock_holder(), Some(request.lock.clone()));
    let second = launch.service.env().lock.acquire_with(
        SIM_NETWORK,
        Duration::from_millis(50),
        config.lock.deadlock_timeout,
    );
    assert!(second.is_err(), "lock was taken while the launch still ran");

    wait_finished(&launch.service);
    assert_eq!(launch.network_state(), NetworkState::Running);
    assert_eq!(status(&launch.service, &request).message_key, METER_COMPLETED);
}

#[test]
fn launch_stops_before_install_once_its_lock_is_taken() {
    let launch = Launch::new();
    launch.fleet.compute.set_allocate_delay(Duration::from_millis(600));

    let request = launch.start_in_background();
    launch.wait_booting();
    let lock = &launch.service.env().lock;
    assert!(lock.release(SIM_NETWORK, &request.lock).expect("release"));
    let other = lock.acquire(SIM_NETWORK).expect("second holder");
    wait_finished(&launch.service);

    assert_eq!(launch.fleet.executor.runs(), 0);
    let tick = status(&launch.service, &request);
    assert!(tick.error);
    assert_eq!(tick.message_key, ErrorLine::ConfirmingNetworkLock.message_key());
    assert_eq!(launch.lock_holder(), Some(other.as_str().to_owned()));
    assert_eq!(launch.network_state(), NetworkState::Setup);

    wait_for("late allocation to be released", || {
        launch.fleet.compute.deallocated().len() == 1
    });
    wait_for("node to settle", || {
        launch.fleet.nodes()[0].state == NodeState::ErrorStopped
    });
}

#[test]
fn timed_out_allocations_are_released_when_they_finish() {
    let mut config = fast_config();
    config.launch.node_start_timeout = Duration::from_millis(100);
    config.launch.max_launch_attempts = 2;
    let launch = Launch::with_config(&config);
    launch.fleet.set_plan(true, 3);
    launch.fleet.compute.set_allocate_delay(Duration::from_millis(300));

    let request = launch.start(None);

    assert!(status(&launch.service, &request).error);
    assert_eq!(launch.network_state(), NetworkState::Stopped);
    wait_for("both late allocations to be released", || {
        launch.fleet.compute.allocated().len() == 2
            && launch.fleet.compute.deallocated().len() == 2
    });
    let mut allocated: Vec<String> = launch
        .fleet
        .compute
        .allocated()
        .into_iter()
        .map(|node| node.id)
        .collect();
    let mut released = launch.fleet.compute.deallocated();
    allocated.sort();
    released.sort();
    assert_eq!(allocated, released);

    wait_for("nodes to settle", || {
        launch
            .fleet
            .nodes()
            .iter()
            .all(|node| node.state == NodeState::ErrorStopped)
    });
    let nodes = launch.fleet.nodes();
    assert_eq!(nodes.len(), 2);
    assert!(nodes
        .iter()
        .all(|node| node.tags.contains_key(TAG_INSTANCE_ID) && node.tags.contains_key(TAG_ERROR)));
}
