//! ---
//! fleet_section: "04-coordination"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Coordination store and distributed network lock."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use r_fleet_common::config::LockConfig;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{CoordinationStore, Namespace, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock on {resource}")]
    Timeout { resource: String, waited: Duration },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Opaque proof of lock ownership: `<uuid>:<epoch-millis>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(format!("{}:{}", Uuid::new_v4(), Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-resource mutual exclusion across processes sharing a store.
///
/// The stored lease expires after the deadlock timeout, so a crashed holder
/// blocks others for at most that long. Holders extend the lease through
/// [`DistributedLock::confirm`].
#[derive(Debug, Clone)]
pub struct DistributedLock {
    store: Namespace,
    config: LockConfig,
}

impl DistributedLock {
    pub const NAMESPACE: &'static str = "network_lock_";

    pub fn new(store: Arc<dyn CoordinationStore>, config: LockConfig) -> Self {
        Self {
            store: Namespace::new(store, Self::NAMESPACE),
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire with the configured lock and deadlock timeouts.
    pub fn acquire(&self, resource: &str) -> Result<LockToken> {
        self.acquire_with(
            resource,
            self.config.lock_timeout,
            self.config.deadlock_timeout,
        )
    }

    /// Poll the store until `resource` is free or `lock_timeout` elapses.
    pub fn acquire_with(
        &self,
        resource: &str,
        lock_timeout: Duration,
        deadlock_timeout: Duration,
    ) -> Result<LockToken> {
        let started = Instant::now();
        let deadline = started + lock_timeout;
        let token = LockToken::generate();
        let mut contended = false;
        loop {
            if self
                .store
                .set_if_absent(resource, token.as_str(), deadlock_timeout)?
            {
                debug!(resource, waited = ?started.elapsed(), "lock acquired");
                return Ok(token);
            }
            if !contended {
                info!(resource, "lock held elsewhere, waiting");
                contended = true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(resource, waited = ?started.elapsed(), "lock acquisition timed out");
                return Err(LockError::Timeout {
                    resource: resource.to_owned(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    /// Verify `token` still holds `resource` and extend its lease.
    pub fn confirm(&self, resource: &str, token: &str) -> Result<bool> {
        let held = self
            .store
            .compare_and_expire(resource, token, self.config.deadlock_timeout)?;
        if !held {
            warn!(resource, "lock confirmation failed");
        }
        Ok(held)
    }

    /// Release `resource` if `token` still holds it. Releasing twice, or
    /// releasing a lease that already expired, is a no-op.
    pub fn release(&self, resource: &str, token: &str) -> Result<bool> {
        let released = self.store.compare_and_delete(resource, token)?;
        if released {
            debug!(resource, "lock released");
        } else {
            debug!(resource, "lock already released or held by another token");
        }
        Ok(released)
    }

    /// Token currently holding `resource`, if any.
    pub fn holder(&self, resource: &str) -> Result<Option<String>> {
        Ok(self.store.get(resource)?)
    }
}
