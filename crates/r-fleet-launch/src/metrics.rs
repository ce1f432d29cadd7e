//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Prometheus metrics for node launches."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts};
use r_fleet_common::SharedRegistry;

/// Metrics published by the launch subsystem.
#[derive(Clone)]
pub struct LaunchMetrics {
    registry: SharedRegistry,
    launches_total: IntCounterVec,
    launch_duration_seconds: Histogram,
    install_attempts_total: IntCounterVec,
    launches_in_flight: IntGauge,
}

impl fmt::Debug for LaunchMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchMetrics")
            .field("in_flight", &self.launches_in_flight.get())
            .finish_non_exhaustive()
    }
}

impl LaunchMetrics {
    /// Register the launch metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let launches_total = IntCounterVec::new(
            Opts::new(
                "r_fleet_launches_total",
                "Node launches finished, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(launches_total.clone()))?;

        let launch_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_fleet_launch_duration_seconds",
                "Wall time from launch start to its final outcome",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 14)?),
        )?;
        registry.register(Box::new(launch_duration_seconds.clone()))?;

        let install_attempts_total = IntCounterVec::new(
            Opts::new(
                "r_fleet_install_attempts_total",
                "Remote install attempts, by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(install_attempts_total.clone()))?;

        let launches_in_flight = IntGauge::new(
            "r_fleet_launches_in_flight",
            "Launch workers currently running in this process",
        )?;
        registry.register(Box::new(launches_in_flight.clone()))?;

        Ok(Self {
            registry,
            launches_total,
            launch_duration_seconds,
            install_attempts_total,
            launches_in_flight,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn launch_started(&self) {
        self.launches_in_flight.inc();
    }

    /// Count a finished launch and observe its duration.
    pub fn launch_finished(&self, outcome: &str, duration: Duration) {
        self.launches_in_flight.dec();
        self.launches_total.with_label_values(&[outcome]).inc();
        self.launch_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn install_attempt(&self, outcome: &str) {
        self.install_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn launches(&self, outcome: &str) -> u64 {
        self.launches_total.with_label_values(&[outcome]).get()
    }

    pub fn install_attempts(&self, outcome: &str) -> u64 {
        self.install_attempts_total
            .with_label_values(&[outcome])
            .get()
    }

    pub fn in_flight(&self) -> i64 {
        self.launches_in_flight.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_fleet_common::{encode_text, new_registry};

    #[test]
    fn launch_outcomes_are_exported() {
        let metrics = LaunchMetrics::new(new_registry()).expect("metrics");
        metrics.launch_started();
        assert_eq!(metrics.in_flight(), 1);
        metrics.install_attempt("retry");
        metrics.install_attempt("success");
        metrics.launch_finished("success", Duration::from_secs(3));

        assert_eq!(metrics.in_flight(), 0);
        assert_eq!(metrics.launches("success"), 1);
        let text = encode_text(&metrics.registry()).expect("encode");
        assert!(text.contains("r_fleet_launches_total{outcome=\"success\"} 1"));
        assert!(text.contains("r_fleet_install_attempts_total{outcome=\"retry\"} 1"));
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = new_registry();
        LaunchMetrics::new(registry.clone()).expect("first");
        assert!(LaunchMetrics::new(registry).is_err());
    }
}
