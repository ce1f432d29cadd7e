//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Network lifecycle operations against the simulated cloud."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::thread;
use std::time::{Duration, Instant};

use r_fleet_launch::sim::{fast_config, SimulatedFleet, SIM_ACCOUNT, SIM_CLOUD, SIM_NETWORK};
use r_fleet_launch::{NetworkService, ServiceError};
use r_fleet_model::node::TAG_INSTANCE_ID;
use r_fleet_model::{CloudRegion, NetLocation, NetworkState, NodeState};
use r_fleet_progress::{METER_CANCELED, METER_COMPLETED};
use r_fleet_supervisor::SupervisorError;

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

fn setup() -> (SimulatedFleet, NetworkService) {
    let fleet = SimulatedFleet::new();
    let service = fleet.service(&fast_config(), None).expect("service");
    (fleet, service)
}

fn launch(service: &NetworkService) {
    service
        .start_network(SIM_NETWORK, None, false)
        .expect("start");
    wait_finished(service);
}

#[test]
fn start_marks_network_setup_and_holds_the_lock() {
    let (fleet, service) = setup();
    fleet.compute.set_allocate_delay(Duration::from_millis(300));

    let request = service
        .start_network(SIM_NETWORK, None, false)
        .expect("start");

    assert_eq!(fleet.network().expect("network").state, NetworkState::Setup);
    assert_eq!(
        service.supervisor().registered_launch(SIM_NETWORK),
        Some(request.id.clone())
    );
    assert_eq!(
        service.env().lock.holder(SIM_NETWORK).expect("holder"),
        Some(request.lock.clone())
    );
    assert_eq!(request.host.len(), 10);
    assert_eq!(request.fqdn, format!("{}.sim.fleet.test", request.host));
    assert!(!request.is_restore());

    wait_finished(&service);
    assert_eq!(fleet.network().expect("network").state, NetworkState::Running);
}

#[test]
fn running_network_is_rejected_before_waiting_for_the_lock() {
    let (_fleet, service) = setup();
    launch(&service);

    let _held = service.env().lock.acquire(SIM_NETWORK).expect("lock");
    let started = Instant::now();
    let err = service
        .start_network(SIM_NETWORK, None, false)
        .expect_err("node already running");

    assert!(
        matches!(err, ServiceError::NodesActive { count: 1, .. }),
        "unexpected error {err:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn disabled_plan_blocks_the_launch() {
    let (fleet, service) = setup();
    fleet.set_plan(false, 1);

    let err = service
        .start_network(SIM_NETWORK, None, false)
        .expect_err("plan disabled");

    assert!(matches!(err, ServiceError::PlanNotEnabled(_)), "unexpected error {err:?}");
    assert_eq!(fleet.network().expect("network").state, NetworkState::Stopped);
    assert_eq!(service.env().lock.holder(SIM_NETWORK).expect("holder"), None);
}

#[test]
fn plan_enabled_while_waiting_lets_the_launch_through() {
    let fleet = SimulatedFleet::new();
    let mut config = fast_config();
    config.launch.plan_enable_timeout = Duration::from_secs(5);
    let service = fleet.service(&config, None).expect("service");
    fleet.set_plan(false, 1);

    let enabler = {
        let repository = fleet.repository.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            repository.save_subscription(r_fleet_model::Subscription {
                account: SIM_ACCOUNT.into(),
                network: SIM_NETWORK.into(),
                enabled: true,
                nodes_included: 1,
            });
        })
    };

    service
        .start_network(SIM_NETWORK, None, false)
        .expect("start after plan enabled");
    enabler.join().expect("enabler");
    wait_finished(&service);
    assert_eq!(fleet.network().expect("network").state, NetworkState::Running);
}

#[test]
fn launcher_must_be_authorized() {
    let fleet = SimulatedFleet::new();
    let mut config = fast_config();
    config.supervisor.authorized_launcher = false;
    let service = fleet.service(&config, None).expect("service");

    let err = service
        .start_network(SIM_NETWORK, None, false)
        .expect_err("not a launcher");

    assert!(matches!(err, ServiceError::Supervisor(SupervisorError::NotAuthorized)));
    assert_eq!(fleet.network().expect("network").state, NetworkState::Stopped);
}

#[test]
fn unknown_network_is_reported() {
    let (_fleet, service) = setup();
    let err = service
        .start_network("net-missing", None, false)
        .expect_err("missing network");
    assert!(matches!(err, ServiceError::NetworkNotFound(id) if id == "net-missing"));
}

#[test]
fn stop_releases_every_node() {
    let (fleet, service) = setup();
    launch(&service);
    let node = fleet.nodes().pop().expect("node");

    let network = service.stop_network(SIM_NETWORK).expect("stop");

    assert_eq!(network.state, NetworkState::Stopped);
    assert!(fleet.nodes().is_empty());
    assert_eq!(fleet.compute.deallocated(), vec![node.id.clone()]);
    assert_eq!(fleet.dns.removed(), vec![node.fqdn.clone()]);
    assert_eq!(service.env().lock.holder(SIM_NETWORK).expect("holder"), None);

    launch(&service);
    assert_eq!(fleet.network().expect("network").state, NetworkState::Running);
}

#[test]
fn restore_launches_with_a_fresh_key() {
    let (fleet, service) = setup();

    let request = service
        .restore_network(SIM_NETWORK, None)
        .expect("restore");
    let key = request.restore_key.clone().expect("restore key");
    assert_eq!(key.len(), 6);
    assert_eq!(fleet.network().expect("network").state, NetworkState::Restoring);
    wait_finished(&service);

    assert_eq!(fleet.network().expect("network").state, NetworkState::Restoring);
    let nodes = fleet.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].state, NodeState::Running);
    let status = service
        .get_launch_status(SIM_ACCOUNT, &request.id)
        .expect("status store")
        .expect("status");
    assert_eq!(status.message_key, METER_COMPLETED);
}

#[test]
fn restore_needs_a_stopped_network_without_nodes() {
    let (fleet, service) = setup();
    fleet.compute.mark_unavailable("east");
    service
        .start_network(
            SIM_NETWORK,
            Some(NetLocation::exact(CloudRegion::new(SIM_CLOUD, "east"))),
            false,
        )
        .expect("start");
    wait_finished(&service);
    assert_eq!(fleet.network().expect("network").state, NetworkState::Stopped);

    let err = service
        .restore_network(SIM_NETWORK, None)
        .expect_err("failed node record remains");
    assert!(
        matches!(err, ServiceError::NodesPresent { count: 1, .. }),
        "unexpected error {err:?}"
    );

    service.stop_network(SIM_NETWORK).expect("stop");
    service
        .restore_network(SIM_NETWORK, Some(NetLocation::exact(CloudRegion::new(SIM_CLOUD, "west"))))
        .expect("restore after cleanup");
    wait_finished(&service);
    assert_eq!(fleet.network().expect("network").state, NetworkState::Restoring);
}

#[test]
fn cancel_stops_a_launch_mid_allocation() {
    let (fleet, service) = setup();
    fleet.compute.set_allocate_delay(Duration::from_secs(3));
    let request = service
        .start_network(SIM_NETWORK, None, false)
        .expect("start");
    wait_for("node to start booting", || {
        fleet
            .nodes()
            .first()
            .is_some_and(|node| node.state == NodeState::Booting)
    });

    assert!(service.cancel_launch(SIM_NETWORK));

    assert!(service.supervisor().registered_launch(SIM_NETWORK).is_none());
    assert_eq!(fleet.network().expect("network").state, NetworkState::Stopped);
    assert_eq!(service.env().lock.holder(SIM_NETWORK).expect("holder"), None);
    let nodes = fleet.nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].state, NodeState::Stopping);

    wait_for("allocation to finish and be released", || {
        fleet.compute.deallocated() == vec![nodes[0].id.clone()]
    });
    wait_for("canceled node to stop", || {
        fleet.nodes()[0].state == NodeState::Stopped
    });
    assert_eq!(fleet.compute.allocated().len(), 1);
    assert!(fleet.nodes()[0].tags.contains_key(TAG_INSTANCE_ID));
    let status = service
        .get_launch_status(SIM_ACCOUNT, &request.id)
        .expect("status store")
        .expect("status");
    assert_eq!(status.message_key, METER_CANCELED);
    assert!(!service.cancel_launch(SIM_NETWORK));
}

#[test]
fn kill_node_stops_the_network_once_nothing_runs() {
    let (fleet, service) = setup();
    launch(&service);
    let node = fleet.nodes().pop().expect("node");

    let killed = service
        .kill_node(&node.id, "unreachable for 10 minutes")
        .expect("kill");

    assert_eq!(killed.state, NodeState::ErrorStopped);
    assert_eq!(
        killed.tags.get("error").map(String::as_str),
        Some("unreachable for 10 minutes")
    );
    assert_eq!(fleet.network().expect("network").state, NetworkState::Stopped);
    assert!(matches!(
        service.kill_node("node-missing", "gone"),
        Err(ServiceError::NodeNotFound(_))
    ));
}

#[test]
fn statuses_are_listed_per_account_and_network() {
    let (_fleet, service) = setup();
    let request = service
        .start_network(SIM_NETWORK, None, false)
        .expect("start");
    wait_finished(&service);

    let all = service.list_launch_statuses(SIM_ACCOUNT).expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].launch, request.id);
    assert!(all[0].is_terminal());

    let scoped = service
        .list_launch_statuses_for_network(SIM_ACCOUNT, SIM_NETWORK)
        .expect("list");
    assert_eq!(scoped, all);
    assert!(service
        .list_launch_statuses_for_network(SIM_ACCOUNT, "net-other")
        .expect("list")
        .is_empty());
    assert!(service.list_launch_statuses("acct-other").expect("list").is_empty());
}
