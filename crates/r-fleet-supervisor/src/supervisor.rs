//! ---
//! fleet_section: "06-supervision"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch worker supervision."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use r_fleet_common::config::SupervisorConfig;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::interrupt::Interrupt;

/// Callback run when a worker is force-ended, before it is interrupted.
pub type TerminateHook = Box<dyn FnOnce() + Send>;

/// Errors raised by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The process is not configured as a launcher.
    #[error("this process is not authorized to launch nodes")]
    NotAuthorized,
    /// The poll thread could not be started.
    #[error("failed to start supervisor thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A launch worker thread as handed to the supervisor.
pub struct LaunchWorker {
    network: String,
    launch: String,
    thread: JoinHandle<()>,
    interrupt: Interrupt,
    on_terminate: Option<TerminateHook>,
}

impl LaunchWorker {
    /// Describe the worker running `launch` for `network`.
    pub fn new(
        network: impl Into<String>,
        launch: impl Into<String>,
        thread: JoinHandle<()>,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            network: network.into(),
            launch: launch.into(),
            thread,
            interrupt,
            on_terminate: None,
        }
    }

    /// Run `hook` if the supervisor force-ends this worker.
    pub fn on_terminate(mut self, hook: TerminateHook) -> Self {
        self.on_terminate = Some(hook);
        self
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }
}

impl fmt::Debug for LaunchWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchWorker")
            .field("network", &self.network)
            .field("launch", &self.launch)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Entry {
    worker: LaunchWorker,
    created: Instant,
    touched: Instant,
}

#[derive(Debug)]
struct Inner {
    config: SupervisorConfig,
    entries: Mutex<HashMap<String, Entry>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    shutdown: Interrupt,
}

/// Tracks the single live launch worker of each network.
///
/// The poll thread starts with the first registration and only when the
/// process is an authorized launcher.
#[derive(Debug, Clone)]
pub struct LaunchSupervisor {
    inner: Arc<Inner>,
}

impl LaunchSupervisor {
    /// Build an idle supervisor.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                entries: Mutex::new(HashMap::new()),
                poller: Mutex::new(None),
                shutdown: Interrupt::new(),
            }),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Whether the poll thread is running.
    pub fn is_running(&self) -> bool {
        self.inner
            .poller
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn ensure_running(&self) -> Result<(), SupervisorError> {
        if !self.inner.config.authorized_launcher {
            return Err(SupervisorError::NotAuthorized);
        }
        let mut poller = self.inner.poller.lock();
        if poller.is_some() {
            return Ok(());
        }
        let supervisor = self.clone();
        let interval = self.inner.config.poll_interval;
        let handle = thread::Builder::new()
            .name("launch-supervisor".to_owned())
            .spawn(move || {
                while supervisor.inner.shutdown.sleep(interval).is_ok() {
                    supervisor.poll_once(Instant::now());
                }
                debug!("launch supervisor stopped");
            })?;
        *poller = Some(handle);
        info!(
            poll_interval = ?interval,
            activity_timeout = ?self.inner.config.activity_timeout,
            "launch supervisor started"
        );
        Ok(())
    }

    /// Take charge of `worker`. A live worker already registered for the
    /// same network is force-ended first.
    pub fn register(&self, worker: LaunchWorker) -> Result<(), SupervisorError> {
        self.ensure_running()?;
        let network = worker.network.clone();
        let launch = worker.launch.clone();
        let now = Instant::now();
        let previous = self.inner.entries.lock().insert(
            network.clone(),
            Entry {
                worker,
                created: now,
                touched: now,
            },
        );
        if let Some(previous) = previous {
            if previous.worker.is_alive() {
                warn!(network = %network, previous = %previous.worker.launch, "replacing live launch worker");
                self.terminate(previous);
            }
        }
        info!(network = %network, launch = %launch, "launch worker registered");
        Ok(())
    }

    /// Record activity for `network`. Touching an unknown network is logged
    /// and otherwise ignored.
    pub fn touch(&self, network: &str) -> bool {
        match self.inner.entries.lock().get_mut(network) {
            Some(entry) => {
                entry.touched = Instant::now();
                true
            }
            None => {
                debug!(network, "touch for unregistered network");
                false
            }
        }
    }

    /// Drop the entry of `network` if it still belongs to `launch`.
    pub fn unregister(&self, network: &str, launch: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        let owned = entries
            .get(network)
            .is_some_and(|entry| entry.worker.launch == launch);
        if owned {
            if let Some(entry) = entries.remove(network) {
                debug!(network, launch, age = ?entry.created.elapsed(), "launch worker unregistered");
            }
        }
        owned
    }

    /// Force-end the worker of `network`, if any.
    pub fn cancel(&self, network: &str) -> bool {
        let entry = self.inner.entries.lock().remove(network);
        match entry {
            Some(entry) => {
                info!(network, launch = %entry.worker.launch, "canceling launch");
                self.terminate(entry);
                true
            }
            None => false,
        }
    }

    /// Whether `launch` is the registered worker of `network`.
    pub fn is_registered(&self, network: &str, launch: &str) -> bool {
        self.inner
            .entries
            .lock()
            .get(network)
            .is_some_and(|entry| entry.worker.launch == launch)
    }

    /// Launch registered for `network`, if any.
    pub fn registered_launch(&self, network: &str) -> Option<String> {
        self.inner
            .entries
            .lock()
            .get(network)
            .map(|entry| entry.worker.launch.clone())
    }

    /// One supervision pass as of `now`: entries whose thread already exited
    /// are dropped, entries idle past the activity timeout are force-ended.
    /// Returns the networks that were force-ended.
    pub fn poll_once(&self, now: Instant) -> Vec<String> {
        let timeout = self.inner.config.activity_timeout;
        let stale: Vec<Entry> = {
            let mut entries = self.inner.entries.lock();
            entries.retain(|network, entry| {
                let alive = entry.worker.is_alive();
                if !alive {
                    debug!(network = %network, launch = %entry.worker.launch, "dropping finished launch worker");
                }
                alive
            });
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.touched) > timeout)
                .map(|(network, _)| network.clone())
                .collect();
            expired
                .iter()
                .filter_map(|network| entries.remove(network))
                .collect()
        };

        let mut ended = Vec::with_capacity(stale.len());
        for entry in stale {
            warn!(
                network = %entry.worker.network,
                launch = %entry.worker.launch,
                idle = ?now.saturating_duration_since(entry.touched),
                "launch worker inactive past timeout, force-ending"
            );
            ended.push(entry.worker.network.clone());
            self.terminate(entry);
        }
        ended
    }

    fn terminate(&self, entry: Entry) {
        let Entry { mut worker, .. } = entry;
        if let Some(hook) = worker.on_terminate.take() {
            hook();
        }
        worker.interrupt.trigger();

        let grace = self.inner.config.terminate_grace;
        let deadline = Instant::now() + grace;
        while worker.is_alive() {
            if Instant::now() >= deadline {
                warn!(network = %worker.network, launch = %worker.launch, grace = ?grace, "launch worker ignored interrupt, abandoning it");
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        if worker.thread.join().is_err() {
            warn!(network = %worker.network, launch = %worker.launch, "launch worker panicked");
        }
    }

    /// Stop the poll thread. Registered workers keep running.
    pub fn shutdown(&self) {
        self.inner.shutdown.trigger();
        let handle = self.inner.poller.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("launch supervisor thread panicked");
            }
        }
    }
}
