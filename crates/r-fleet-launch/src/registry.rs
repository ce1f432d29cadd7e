//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Per-cloud driver cache with single-flight construction."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use r_fleet_model::CloudService;
use tracing::info;

use crate::drivers::{ComputeDriver, DnsDriver, DriverError, DriverFactory};

/// Process-wide cache of drivers keyed by cloud id.
///
/// Concurrent first lookups of one cloud build its driver exactly once; the
/// losers block until the winner finishes. A failed build leaves the slot
/// empty so the next lookup tries again.
pub struct DriverRegistry {
    factory: Arc<dyn DriverFactory>,
    compute: DashMap<String, Arc<OnceCell<Arc<dyn ComputeDriver>>>>,
    dns: DashMap<String, Arc<OnceCell<Arc<dyn DnsDriver>>>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("compute", &self.compute.len())
            .field("dns", &self.dns.len())
            .finish_non_exhaustive()
    }
}

impl DriverRegistry {
    pub fn new(factory: Arc<dyn DriverFactory>) -> Self {
        Self {
            factory,
            compute: DashMap::new(),
            dns: DashMap::new(),
        }
    }

    pub fn compute(&self, cloud: &CloudService) -> Result<Arc<dyn ComputeDriver>, DriverError> {
        // Clone the slot out so the map shard is not held while building.
        let slot = self.compute.entry(cloud.id.clone()).or_default().clone();
        slot.get_or_try_init(|| {
            info!(cloud = %cloud.id, name = %cloud.name, "building compute driver");
            self.factory.compute(cloud)
        })
        .cloned()
    }

    pub fn dns(&self, cloud: &CloudService) -> Result<Arc<dyn DnsDriver>, DriverError> {
        let slot = self.dns.entry(cloud.id.clone()).or_default().clone();
        slot.get_or_try_init(|| {
            info!(cloud = %cloud.id, name = %cloud.name, "building dns driver");
            self.factory.dns(cloud)
        })
        .cloned()
    }

    /// Drop cached drivers of `cloud`, e.g. after its credentials changed.
    pub fn evict(&self, cloud: &str) {
        self.compute.remove(cloud);
        self.dns.remove(cloud);
    }
}
