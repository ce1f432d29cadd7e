//! ---
//! fleet_section: "05-observability"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch progress tracking."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_fleet_coord::{CoordinationStore, Namespace, StoreError};
use tracing::warn;

use crate::tick::ProgressTick;

/// Latest published tick per launch, keyed by `account:launch`.
#[derive(Debug, Clone)]
pub struct LaunchStatusStore {
    store: Namespace,
    ttl: Duration,
}

impl LaunchStatusStore {
    pub const NAMESPACE: &'static str = "launch_status_";

    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self {
            store: Namespace::new(store, Self::NAMESPACE),
            ttl,
        }
    }

    fn key(account: &str, launch: &str) -> String {
        format!("{}:{}", account, launch)
    }

    /// Replace the published tick of `tick.launch`.
    pub fn publish(&self, tick: &ProgressTick) -> Result<(), StoreError> {
        let json = serde_json::to_string(tick).map_err(|err| StoreError::Rejected {
            key: Self::key(&tick.account, &tick.launch),
            reason: err.to_string(),
        })?;
        self.store
            .set(&Self::key(&tick.account, &tick.launch), &json, Some(self.ttl))
    }

    /// Latest tick of `launch` as seen by `account`.
    ///
    /// Missing, expired or unparsable entries and entries owned by another
    /// account all read as `None`.
    pub fn get(&self, account: &str, launch: &str) -> Result<Option<ProgressTick>, StoreError> {
        let Some(json) = self.store.get(&Self::key(account, launch))? else {
            return Ok(None);
        };
        Ok(Self::decode(account, launch, &json))
    }

    /// Every live tick published for `account`, oldest first.
    pub fn list(&self, account: &str) -> Result<Vec<ProgressTick>, StoreError> {
        let mut ticks = Vec::new();
        for key in self.store.keys(&format!("{}:", account))? {
            let Some(launch) = key.strip_prefix(&format!("{}:", account)) else {
                continue;
            };
            if let Some(tick) = self.get(account, launch)? {
                ticks.push(tick);
            }
        }
        ticks.sort_by_key(|tick| tick.timestamp);
        Ok(ticks)
    }

    /// Live ticks of `account` belonging to `network`.
    pub fn list_for_network(
        &self,
        account: &str,
        network: &str,
    ) -> Result<Vec<ProgressTick>, StoreError> {
        Ok(self
            .list(account)?
            .into_iter()
            .filter(|tick| tick.network == network)
            .collect())
    }

    fn decode(account: &str, launch: &str, json: &str) -> Option<ProgressTick> {
        let tick = match serde_json::from_str::<ProgressTick>(json) {
            Ok(tick) => tick,
            Err(err) => {
                warn!(account, launch, error = %err, "discarding unparsable launch status");
                return None;
            }
        };
        if tick.account != account {
            warn!(account, launch, owner = %tick.account, "launch status owned by another account");
            return None;
        }
        Some(tick)
    }
}
