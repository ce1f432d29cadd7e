//! ---
//! fleet_section: "02-launch-orchestration"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch worker body: relaunch policy around pipeline attempts."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use r_fleet_model::{CloudRegion, LaunchRequest, NetworkState, Node, NodeState};
use r_fleet_progress::{LivenessHook, MeterError, MeterIdentity, ProgressMeter};
use r_fleet_supervisor::Interrupt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::environment::LaunchEnvironment;
use crate::failure::{FailureKind, LaunchFailure, StepResult};
use crate::pipeline::LaunchPipeline;

/// What the worker does after a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Try again after `delay`, skipping `exclude` when set.
    Relaunch {
        delay: Duration,
        exclude: Option<CloudRegion>,
    },
    /// Give up and settle the network.
    Abort(LaunchFailure),
    /// Canceled from outside; exit without further work.
    Stop(LaunchFailure),
}

/// Pure relaunch policy over the outcome of attempt number `attempt`
/// (1-based).
pub fn decide(
    attempt: usize,
    max_attempts: usize,
    backoff: Duration,
    request: &LaunchRequest,
    failure: LaunchFailure,
) -> RetryDecision {
    let delay = backoff * attempt as u32;
    match failure.kind() {
        FailureKind::Interrupted => RetryDecision::Stop(failure),
        FailureKind::Fatal => RetryDecision::Abort(failure),
        _ if attempt >= max_attempts => RetryDecision::Abort(failure),
        FailureKind::CanRetry => RetryDecision::Relaunch {
            delay,
            exclude: None,
        },
        FailureKind::UnavailableRegion => {
            if request.location.exact_region {
                return RetryDecision::Abort(failure);
            }
            let Some(current) = request.target() else {
                return RetryDecision::Abort(failure);
            };
            if request.location.excluding(current).target().is_none() {
                return RetryDecision::Abort(failure);
            }
            RetryDecision::Relaunch {
                delay,
                exclude: Some(current.clone()),
            }
        }
    }
}

/// Random DNS-safe host label for a new node.
pub fn random_host() -> String {
    let mut rng = rand::thread_rng();
    let first = rng.gen_range(b'a'..=b'z') as char;
    let rest: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|byte| (byte as char).to_ascii_lowercase())
        .collect();
    format!("{}{}", first, rest)
}

/// Summary of a finished worker.
#[derive(Debug)]
pub struct LaunchReport {
    pub network: String,
    pub launch: String,
    pub attempts: usize,
    pub result: StepResult<Node>,
}

/// Body of a launch worker thread.
#[derive(Debug)]
pub struct NodeLauncher {
    env: LaunchEnvironment,
    request: LaunchRequest,
    interrupt: Interrupt,
}

impl NodeLauncher {
    pub fn new(env: LaunchEnvironment, request: LaunchRequest, interrupt: Interrupt) -> Self {
        Self {
            env,
            request,
            interrupt,
        }
    }

    pub fn request(&self) -> &LaunchRequest {
        &self.request
    }

    /// Run attempts until one succeeds or the policy gives up, then settle
    /// the network and leave the supervisor.
    pub fn run(self) -> LaunchReport {
        let started = Instant::now();
        if let Some(metrics) = &self.env.metrics {
            metrics.launch_started();
        }

        let (attempts, result) = self.attempts();
        let outcome: &'static str = match &result {
            Ok(_) => "success",
            Err(failure) => {
                self.settle_network(failure);
                failure.kind().into()
            }
        };

        if let Some(metrics) = &self.env.metrics {
            metrics.launch_finished(outcome, started.elapsed());
        }
        // Last step: callers treat an unregistered network as settled.
        self.env
            .supervisor
            .unregister(&self.request.network, &self.request.id);
        info!(
            network = %self.request.network,
            launch = %self.request.id,
            attempts,
            outcome,
            elapsed = ?started.elapsed(),
            "launch worker finished"
        );
        LaunchReport {
            network: self.request.network.clone(),
            launch: self.request.id.clone(),
            attempts,
            result,
        }
    }

    fn attempts(&self) -> (usize, StepResult<Node>) {
        let max = self.env.launch.max_launch_attempts;
        let mut request = self.request.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let lease_lost = Arc::new(AtomicBool::new(false));
            let meter = match self.meter(&request, &lease_lost) {
                Ok(meter) => meter,
                Err(err) => {
                    self.release(&request);
                    return (
                        attempt,
                        Err(LaunchFailure::classify(Box::new(err), "starting progress meter")),
                    );
                }
            };
            let pipeline = LaunchPipeline::new(&self.env, &request, &self.interrupt, &meter)
                .with_lease_flag(lease_lost);
            let failure = match pipeline.run() {
                Ok(node) => return (attempt, Ok(node)),
                Err(failure) => failure,
            };

            let backoff = self.env.launch.relaunch_backoff;
            let (delay, exclude) = match decide(attempt, max, backoff, &request, failure) {
                RetryDecision::Relaunch { delay, exclude } => (delay, exclude),
                RetryDecision::Abort(failure) | RetryDecision::Stop(failure) => {
                    return (attempt, Err(failure))
                }
            };
            info!(
                network = %request.network,
                launch = %request.id,
                attempt,
                max,
                delay = ?delay,
                exclude = ?exclude.as_ref().map(ToString::to_string),
                "relaunching"
            );
            if let Err(interrupted) = self.interrupt.sleep(delay) {
                return (attempt, Err(interrupted.into()));
            }
            if !self.env.supervisor.is_registered(&request.network, &request.id) {
                return (
                    attempt,
                    Err(LaunchFailure::interrupted("launch is no longer registered")),
                );
            }
            let token = match self.env.lock.acquire(&request.network) {
                Ok(token) => token,
                Err(err) => {
                    return (
                        attempt,
                        Err(LaunchFailure::classify(Box::new(err), "re-acquiring network lock")),
                    )
                }
            };
            let host = if request.fork {
                request.host.clone()
            } else {
                random_host()
            };
            request = request.relaunch(token.into_string(), host, exclude.as_ref());
        }
    }

    /// The meter's liveness hook refreshes the lock lease on every touch and
    /// raises `lease_lost` once another token holds the lock.
    fn meter(
        &self,
        request: &LaunchRequest,
        lease_lost: &Arc<AtomicBool>,
    ) -> Result<Arc<ProgressMeter>, MeterError> {
        let liveness: LivenessHook = {
            let supervisor = self.env.supervisor.clone();
            let lock = self.env.lock.clone();
            let network = request.network.clone();
            let token = request.lock.clone();
            let lease_lost = lease_lost.clone();
            Arc::new(move || {
                supervisor.touch(&network);
                match lock.confirm(&network, &token) {
                    Ok(true) => {}
                    Ok(false) => {
                        if !lease_lost.swap(true, Ordering::SeqCst) {
                            warn!(network = %network, "network lock lease lost");
                        }
                    }
                    Err(err) => warn!(network = %network, error = %err, "lock refresh failed"),
                }
            })
        };
        ProgressMeter::new(
            MeterIdentity::new(&request.account, &request.network, &request.id),
            self.env.catalog.clone(),
            self.env.statuses.clone(),
            &self.env.meter,
            Some(liveness),
        )
        .map(Arc::new)
    }

    fn release(&self, request: &LaunchRequest) {
        if let Err(err) = self.env.lock.release(&request.network, &request.lock) {
            warn!(network = %request.network, error = %err, "lock release failed, lease will expire");
        }
    }

    /// After a failed launch, a network left in setup with no active node
    /// is stopped so it can be started again. Nodes still being torn down
    /// do not keep it in setup. A network whose lock is held again belongs
    /// to that holder.
    fn settle_network(&self, failure: &LaunchFailure) {
        let id = &self.request.network;
        let repository = &self.env.repository;
        match self.env.lock.holder(id) {
            Ok(None) => {}
            Ok(Some(_)) => {
                debug!(network = %id, "network lock taken by another launch, leaving network alone");
                return;
            }
            Err(err) => {
                warn!(network = %id, error = %err, "could not read network lock holder");
                return;
            }
        }
        let network = match repository.network(id) {
            Ok(Some(network)) => network,
            Ok(None) => return,
            Err(err) => {
                warn!(network = %id, error = %err, "could not load network after failed launch");
                return;
            }
        };
        if !matches!(network.state, NetworkState::Setup | NetworkState::Restoring) {
            debug!(network = %id, state = %network.state, "network already moved on");
            return;
        }
        let live = repository.active_nodes(id).map(|nodes| {
            nodes
                .into_iter()
                .filter(|node| !matches!(node.state, NodeState::Stopping | NodeState::ErrorStopping))
                .collect::<Vec<_>>()
        });
        match live {
            Ok(active) if active.is_empty() => {
                match repository.update_network_state(id, NetworkState::Stopped) {
                    Ok(_) => info!(network = %id, kind = %failure.kind(), "network stopped after failed launch"),
                    Err(err) => warn!(network = %id, error = %err, "could not stop network"),
                }
            }
            Ok(active) => debug!(network = %id, active = active.len(), "network keeps active nodes"),
            Err(err) => warn!(network = %id, error = %err, "could not list nodes after failed launch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use r_fleet_model::{NetLocation, Network};

    fn request(location: NetLocation) -> LaunchRequest {
        let network = Network::new("net-1", "acct", "alpha", "example.com", "dns");
        LaunchRequest::new(&network, "h1", location, "lock", true)
    }

    fn two_regions() -> NetLocation {
        NetLocation::any_of(vec![
            CloudRegion::new("c1", "east"),
            CloudRegion::new("c1", "west"),
        ])
    }

    const BACKOFF: Duration = Duration::from_secs(2);

    #[test]
    fn retryable_failures_back_off_linearly() {
        let request = request(two_regions());
        match decide(3, 5, BACKOFF, &request, LaunchFailure::can_retry("busy")) {
            RetryDecision::Relaunch { delay, exclude } => {
                assert_eq!(delay, Duration::from_secs(6));
                assert!(exclude.is_none());
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn exhausted_attempts_abort() {
        let request = request(two_regions());
        assert!(matches!(
            decide(5, 5, BACKOFF, &request, LaunchFailure::can_retry("busy")),
            RetryDecision::Abort(_)
        ));
    }

    #[test]
    fn fatal_aborts_and_interrupted_stops() {
        let request = request(two_regions());
        assert!(matches!(
            decide(1, 5, BACKOFF, &request, LaunchFailure::fatal("boom")),
            RetryDecision::Abort(_)
        ));
        assert!(matches!(
            decide(1, 5, BACKOFF, &request, LaunchFailure::interrupted("cancel")),
            RetryDecision::Stop(_)
        ));
    }

    #[test]
    fn unavailable_region_moves_to_next_candidate() {
        let request = request(two_regions());
        match decide(1, 5, BACKOFF, &request, LaunchFailure::unavailable_region("full")) {
            RetryDecision::Relaunch { exclude, .. } => {
                assert_eq!(exclude, Some(CloudRegion::new("c1", "east")));
            }
            other => panic!("unexpected decision {other:?}"),
        }

        let last = request.relaunch(
            "lock-2".into(),
            "h2".into(),
            Some(&CloudRegion::new("c1", "east")),
        );
        assert!(matches!(
            decide(2, 5, BACKOFF, &last, LaunchFailure::unavailable_region("full")),
            RetryDecision::Abort(_)
        ));
    }

    #[test]
    fn exact_region_never_falls_back() {
        let request = request(NetLocation::exact(CloudRegion::new("c1", "east")));
        assert!(matches!(
            decide(1, 5, BACKOFF, &request, LaunchFailure::unavailable_region("full")),
            RetryDecision::Abort(_)
        ));
    }

    #[test]
    fn random_hosts_are_dns_labels() {
        let host = random_host();
        assert_eq!(host.len(), 10);
        assert!(host.chars().next().is_some_and(|c| c.is_ascii_lowercase()));
        assert!(host
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
