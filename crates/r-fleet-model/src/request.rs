//! ---
//! fleet_section: "01-core-functionality"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch request values."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::network::Network;

/// A placement: one region of one cloud service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloudRegion {
    /// Cloud service identifier.
    pub cloud: String,
    /// Region name within that cloud.
    pub region: String,
}

impl CloudRegion {
    /// Build a placement.
    pub fn new(cloud: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            cloud: cloud.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for CloudRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cloud, self.region)
    }
}

/// Where a launch may place its node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetLocation {
    /// Candidate placements in order of preference.
    pub candidates: Vec<CloudRegion>,
    /// When set, an unavailable region is fatal instead of falling through.
    #[serde(default)]
    pub exact_region: bool,
    /// Placements already found unavailable.
    #[serde(default)]
    pub excluded: Vec<CloudRegion>,
}

impl NetLocation {
    /// Location restricted to one placement.
    pub fn exact(region: CloudRegion) -> Self {
        Self {
            candidates: vec![region],
            exact_region: true,
            excluded: Vec::new(),
        }
    }

    /// Location that may fall through the given candidates.
    pub fn any_of(candidates: Vec<CloudRegion>) -> Self {
        Self {
            candidates,
            exact_region: false,
            excluded: Vec::new(),
        }
    }

    /// First candidate not yet excluded.
    pub fn target(&self) -> Option<&CloudRegion> {
        self.candidates
            .iter()
            .find(|candidate| !self.excluded.contains(candidate))
    }

    /// Copy of this location with `region` excluded.
    pub fn excluding(&self, region: &CloudRegion) -> Self {
        let mut next = self.clone();
        if !next.excluded.contains(region) {
            next.excluded.push(region.clone());
        }
        next
    }
}

/// Immutable description of one launch.
///
/// Re-targeting for a relaunch produces a new value through [`LaunchRequest::relaunch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Launch identifier; also the key of the published progress.
    pub id: String,
    /// Requesting account.
    pub account: String,
    /// Target network.
    pub network: String,
    /// Target network name.
    pub network_name: String,
    /// Target network domain.
    pub domain: String,
    /// Whether the host name was reused from a fork.
    pub fork: bool,
    /// Key for a restore-from-backup launch.
    #[serde(default)]
    pub restore_key: Option<String>,
    /// Host name of the node to create.
    pub host: String,
    /// Fully qualified name of the node to create.
    pub fqdn: String,
    /// Placement preferences.
    pub location: NetLocation,
    /// Token of the network lock held for this launch.
    pub lock: String,
    /// Automated launches are subject to the plan's node limit.
    pub automated: bool,
    /// When the request was built.
    pub created_at: DateTime<Utc>,
}

impl LaunchRequest {
    /// Build a request for `network` holding `lock`.
    pub fn new(
        network: &Network,
        host: impl Into<String>,
        location: NetLocation,
        lock: impl Into<String>,
        automated: bool,
    ) -> Self {
        let host = host.into();
        Self {
            id: Uuid::new_v4().to_string(),
            account: network.account.clone(),
            network: network.id.clone(),
            network_name: network.name.clone(),
            domain: network.domain.clone(),
            fork: network.is_fork(),
            restore_key: None,
            fqdn: network.node_fqdn(&host),
            host,
            location,
            lock: lock.into(),
            automated,
            created_at: Utc::now(),
        }
    }

    /// Attach a restore key.
    pub fn with_restore_key(mut self, key: impl Into<String>) -> Self {
        self.restore_key = Some(key.into());
        self
    }

    /// Whether this launch restores from backup.
    pub fn is_restore(&self) -> bool {
        self.restore_key.is_some()
    }

    /// Current placement target.
    pub fn target(&self) -> Option<&CloudRegion> {
        self.location.target()
    }

    /// New request for a relaunch under a fresh lock and host name,
    /// optionally excluding a placement. The launch id is kept so progress
    /// stays under the same key.
    pub fn relaunch(&self, lock: String, host: String, exclude: Option<&CloudRegion>) -> Self {
        let location = match exclude {
            Some(region) => self.location.excluding(region),
            None => self.location.clone(),
        };
        let fqdn = match self.fqdn.split_once('.') {
            Some((_, suffix)) => format!("{}.{}", host, suffix),
            None => host.clone(),
        };
        Self {
            host,
            fqdn,
            location,
            lock,
            ..self.clone()
        }
    }
}
