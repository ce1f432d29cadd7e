//! ---
//! fleet_section: "06-supervision"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch worker supervision."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use r_fleet_common::config::SupervisorConfig;
use r_fleet_supervisor::{Interrupt, LaunchSupervisor, LaunchWorker, SupervisorError};

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        authorized_launcher: true,
        poll_interval: Duration::from_secs(60),
        activity_timeout: Duration::from_secs(1),
        terminate_grace: Duration::from_secs(5),
    }
}

struct SpawnedWorker {
    worker: LaunchWorker,
    interrupt: Interrupt,
    exited: Arc<AtomicBool>,
}

/// Worker that idles until interrupted.
fn cooperative_worker(network: &str, launch: &str) -> SpawnedWorker {
    let interrupt = Interrupt::new();
    let exited = Arc::new(AtomicBool::new(false));
    let thread = {
        let interrupt = interrupt.clone();
        let exited = exited.clone();
        thread::spawn(move || {
            while interrupt.sleep(Duration::from_millis(10)).is_ok() {}
            exited.store(true, Ordering::SeqCst);
        })
    };
    SpawnedWorker {
        worker: LaunchWorker::new(network, launch, thread, interrupt.clone()),
        interrupt,
        exited,
    }
}

#[test]
fn supervisor_force_ends_worker_idle_past_activity_timeout() {
    let supervisor = LaunchSupervisor::new(supervisor_config());
    let spawned = cooperative_worker("net-1", "launch-1");
    let hook_ran = Arc::new(AtomicBool::new(false));
    let worker = spawned.worker.on_terminate({
        let hook_ran = hook_ran.clone();
        Box::new(move || hook_ran.store(true, Ordering::SeqCst))
    });
    supervisor.register(worker).expect("register");

    assert!(supervisor
        .poll_once(Instant::now() + Duration::from_millis(500))
        .is_empty());
    assert!(supervisor.is_registered("net-1", "launch-1"));

    let ended = supervisor.poll_once(Instant::now() + Duration::from_secs(2));
    assert_eq!(ended, vec!["net-1".to_owned()]);
    assert!(spawned.interrupt.is_triggered());
    assert!(spawned.exited.load(Ordering::SeqCst));
    assert!(hook_ran.load(Ordering::SeqCst));
    assert!(!supervisor.is_registered("net-1", "launch-1"));
    supervisor.shutdown();
}

#[test]
fn touch_keeps_worker_alive() {
    let supervisor = LaunchSupervisor::new(SupervisorConfig {
        activity_timeout: Duration::from_millis(200),
        ..supervisor_config()
    });
    let spawned = cooperative_worker("net-1", "launch-1");
    supervisor.register(spawned.worker).expect("register");

    thread::sleep(Duration::from_millis(150));
    assert!(supervisor.touch("net-1"));
    assert!(supervisor
        .poll_once(Instant::now() + Duration::from_millis(100))
        .is_empty());
    assert!(!spawned.interrupt.is_triggered());

    assert!(supervisor.cancel("net-1"));
    assert!(spawned.exited.load(Ordering::SeqCst));
    supervisor.shutdown();
}

#[test]
fn registering_same_network_replaces_live_worker() {
    let supervisor = LaunchSupervisor::new(supervisor_config());
    let first = cooperative_worker("net-1", "launch-1");
    let second = cooperative_worker("net-1", "launch-2");

    supervisor.register(first.worker).expect("first");
    supervisor.register(second.worker).expect("second");

    assert!(first.exited.load(Ordering::SeqCst));
    assert!(!second.interrupt.is_triggered());
    assert_eq!(
        supervisor.registered_launch("net-1").as_deref(),
        Some("launch-2")
    );

    assert!(!supervisor.unregister("net-1", "launch-1"));
    assert!(supervisor.is_registered("net-1", "launch-2"));
    supervisor.cancel("net-1");
    supervisor.shutdown();
}

#[test]
fn touching_unknown_network_is_harmless() {
    let supervisor = LaunchSupervisor::new(supervisor_config());
    assert!(!supervisor.touch("ghost"));
    assert!(!supervisor.cancel("ghost"));
    assert!(!supervisor.is_running());
}

#[test]
fn unauthorized_process_cannot_register() {
    let supervisor = LaunchSupervisor::new(SupervisorConfig {
        authorized_launcher: false,
        ..supervisor_config()
    });
    let spawned = cooperative_worker("net-1", "launch-1");
    let err = supervisor.register(spawned.worker).unwrap_err();
    assert!(matches!(err, SupervisorError::NotAuthorized));
    assert!(!supervisor.is_running());
    spawned.interrupt.trigger();
}

#[test]
fn finished_workers_are_dropped_without_interrupt() {
    let supervisor = LaunchSupervisor::new(supervisor_config());
    let interrupt = Interrupt::new();
    let thread = thread::spawn(|| {});
    supervisor
        .register(LaunchWorker::new("net-1", "launch-1", thread, interrupt.clone()))
        .expect("register");
    assert!(supervisor.is_running());

    thread::sleep(Duration::from_millis(50));
    assert!(supervisor.poll_once(Instant::now()).is_empty());
    assert!(supervisor.registered_launch("net-1").is_none());
    assert!(!interrupt.is_triggered());
    supervisor.shutdown();
}
