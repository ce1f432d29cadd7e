//! ---
//! fleet_section: "04-coordination"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Coordination store and distributed network lock."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use r_fleet_common::config::LockConfig;
use r_fleet_coord::{DistributedLock, LockError, MemoryStore};

fn quick_lock_config() -> LockConfig {
    LockConfig {
        lock_timeout: Duration::from_millis(100),
        deadlock_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(5),
    }
}

#[test]
fn second_caller_times_out_while_lock_is_held() {
    let lock = DistributedLock::new(MemoryStore::shared(), quick_lock_config());
    let token = lock.acquire("net-1").expect("first acquire");

    let started = Instant::now();
    let err = lock.acquire("net-1").unwrap_err();
    assert!(matches!(err, LockError::Timeout { ref resource, .. } if resource == "net-1"));
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert!(lock.confirm("net-1", token.as_str()).expect("confirm"));
}

#[test]
fn lock_is_granted_after_deadlock_timeout_without_release() {
    let lock = DistributedLock::new(MemoryStore::shared(), quick_lock_config());
    let stale = lock
        .acquire_with("net-1", Duration::ZERO, Duration::from_millis(30))
        .expect("first acquire");

    let fresh = lock
        .acquire_with("net-1", Duration::from_secs(1), Duration::from_secs(5))
        .expect("granted once the stale lease expires");

    assert_ne!(stale, fresh);
    assert!(!lock.confirm("net-1", stale.as_str()).expect("stale confirm"));
    assert!(lock.confirm("net-1", fresh.as_str()).expect("fresh confirm"));
}

#[test]
fn release_is_idempotent_and_ignores_foreign_tokens() {
    let lock = DistributedLock::new(MemoryStore::shared(), quick_lock_config());
    let token = lock.acquire("net-1").expect("acquire");

    assert!(!lock.release("net-1", "someone-else").expect("foreign release"));
    assert!(lock.holder("net-1").expect("holder").is_some());

    assert!(lock.release("net-1", token.as_str()).expect("release"));
    assert!(!lock.release("net-1", token.as_str()).expect("second release"));
    assert!(lock.holder("net-1").expect("holder").is_none());
}

#[test]
fn confirm_extends_the_lease() {
    let config = LockConfig {
        deadlock_timeout: Duration::from_millis(80),
        ..quick_lock_config()
    };
    let lock = DistributedLock::new(MemoryStore::shared(), config);
    let token = lock.acquire("net-1").expect("acquire");

    for _ in 0..4 {
        thread::sleep(Duration::from_millis(40));
        assert!(lock.confirm("net-1", token.as_str()).expect("confirm"));
    }
}

#[test]
fn contending_threads_never_hold_the_lock_together() {
    let lock = Arc::new(DistributedLock::new(
        MemoryStore::shared(),
        LockConfig {
            lock_timeout: Duration::from_secs(5),
            ..quick_lock_config()
        },
    ));
    let holders = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let lock = lock.clone();
            let holders = holders.clone();
            thread::spawn(move || {
                let token = lock.acquire("net-1").expect("acquire");
                assert_eq!(
                    holders.fetch_add(1, Ordering::SeqCst),
                    0,
                    "lock held by two callers"
                );
                thread::sleep(Duration::from_millis(10));
                holders.fetch_sub(1, Ordering::SeqCst);
                lock.release("net-1", token.as_str()).expect("release");
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }
}

