//! ---
//! fleet_section: "05-observability"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch progress tracking."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use r_fleet_common::config::MeterConfig;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{error_message_key, TickCatalog};
use crate::cursor::TickCursor;
use crate::status::LaunchStatusStore;
use crate::tick::ProgressTick;
use crate::{METER_CANCELED, METER_COMPLETED};

/// Callback run at most once per touch interval while output flows.
pub type LivenessHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("progress meter for launch {launch} is closed")]
    Closed { launch: String },
    #[error("failed to start progress reader: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Which launch a meter reports for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterIdentity {
    pub account: String,
    pub network: String,
    pub launch: String,
}

impl MeterIdentity {
    pub fn new(
        account: impl Into<String>,
        network: impl Into<String>,
        launch: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            network: network.into(),
            launch: launch.into(),
        }
    }

    fn tick(&self, message_key: &str, percent: u8) -> ProgressTick {
        ProgressTick::new(
            self.account.clone(),
            self.network.clone(),
            self.launch.clone(),
            message_key,
            percent,
        )
    }
}

#[derive(Debug, Default)]
struct MeterState {
    cursor: TickCursor,
    percent: u8,
    error: Option<String>,
    closed: bool,
    completed: bool,
    resets: usize,
}

struct Shared {
    identity: MeterIdentity,
    catalog: Arc<TickCatalog>,
    statuses: LaunchStatusStore,
    touch_interval: Duration,
    close_timeout: Duration,
    liveness: Option<LivenessHook>,
    last_touch: Mutex<Option<Instant>>,
    state: Mutex<MeterState>,
    pending: AtomicUsize,
}

impl Shared {
    fn touch(&self) {
        let Some(hook) = &self.liveness else {
            return;
        };
        {
            let mut last = self.last_touch.lock();
            let due = last.map_or(true, |at| at.elapsed() >= self.touch_interval);
            if !due {
                return;
            }
            *last = Some(Instant::now());
        }
        hook();
    }

    fn process(&self, line: &str) {
        let mut state = self.state.lock();
        if state.closed || state.error.is_some() {
            return;
        }
        let ticks = self.catalog.ticks();
        let Some(advance) = state.cursor.advance(ticks, line) else {
            return;
        };
        let Some(tick) = ticks.get(advance.index) else {
            return;
        };
        match advance.skipped {
            0 => {}
            1 => warn!(
                launch = %self.identity.launch,
                skipped = ticks[advance.index - 1].message_key(),
                "skipped tick"
            ),
            count => warn!(
                launch = %self.identity.launch,
                count,
                first = ticks[advance.index - count].message_key(),
                last = ticks[advance.index - 1].message_key(),
                "skipped ticks"
            ),
        }
        state.percent = tick.percent();
        debug!(launch = %self.identity.launch, tick = tick.message_key(), percent = tick.percent(), "progress");
        self.publish(self.identity.tick(tick.message_key(), tick.percent()));
    }

    fn publish(&self, tick: ProgressTick) {
        if let Err(err) = self.statuses.publish(&tick) {
            warn!(launch = %self.identity.launch, key = %tick.message_key, error = %err, "failed to publish launch status");
        }
    }
}

fn read_lines(shared: Arc<Shared>, lines: Receiver<String>) {
    for line in lines.iter() {
        shared.process(&line);
        shared.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

fn join_reader(handle: JoinHandle<()>, timeout: Duration, launch: &str) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(launch, "progress reader did not stop in time, abandoning it");
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        warn!(launch, "progress reader panicked");
    }
}

/// Translates provisioning output into published progress ticks.
///
/// Lines handed to [`ProgressMeter::write`] are matched on a reader thread
/// against the catalog, forward only. The first [`ProgressMeter::error`]
/// freezes progress and closes the meter; [`ProgressMeter::reset`] rewinds to
/// just past the standard milestones so a retried install can report again.
pub struct ProgressMeter {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<String>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ProgressMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressMeter")
            .field("identity", &self.shared.identity)
            .finish_non_exhaustive()
    }
}

impl ProgressMeter {
    pub fn new(
        identity: MeterIdentity,
        catalog: Arc<TickCatalog>,
        statuses: LaunchStatusStore,
        config: &MeterConfig,
        liveness: Option<LivenessHook>,
    ) -> Result<Self, MeterError> {
        let shared = Arc::new(Shared {
            identity,
            catalog,
            statuses,
            touch_interval: config.touch_interval,
            close_timeout: config.close_timeout,
            liveness,
            last_touch: Mutex::new(None),
            state: Mutex::new(MeterState::default()),
            pending: AtomicUsize::new(0),
        });
        let (sender, receiver) = channel::unbounded();
        let reader = thread::Builder::new()
            .name(format!("meter-{}", shared.identity.launch))
            .spawn({
                let shared = shared.clone();
                move || read_lines(shared, receiver)
            })?;
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn identity(&self) -> &MeterIdentity {
        &self.shared.identity
    }

    /// Queue one output line for matching. Ignored once the meter is closed.
    pub fn write(&self, line: &str) {
        if self.shared.state.lock().closed {
            debug!(launch = %self.shared.identity.launch, "ignoring output on closed meter");
            return;
        }
        self.shared.touch();
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(line.to_owned()).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Record a fatal error line, freeze progress and close the meter.
    /// Only the first error is recorded.
    pub fn error(&self, line: &str) {
        let mut state = self.shared.state.lock();
        if let Some(existing) = &state.error {
            warn!(launch = %self.shared.identity.launch, existing = %existing, ignored = line, "meter already holds an error");
            return;
        }
        if state.closed {
            debug!(launch = %self.shared.identity.launch, line, "ignoring error on closed meter");
            return;
        }
        state.error = Some(line.to_owned());
        state.closed = true;
        let key = error_message_key(line);
        let tick = self
            .shared
            .identity
            .tick(key, state.percent)
            .with_details(line.trim())
            .as_error();
        self.shared.publish(tick);
        drop(state);
        self.shutdown_stream(false);
    }

    /// Rewind to just past the last standard milestone and clear the error
    /// flag. Rejected once the meter is closed.
    pub fn reset(&self) -> Result<(), MeterError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(MeterError::Closed {
                launch: self.shared.identity.launch.clone(),
            });
        }
        let catalog = &self.shared.catalog;
        let last = catalog.last_standard();
        state.error = None;
        state.cursor.rewind_to(catalog.standard_len());
        state.resets += 1;
        state.percent = last.percent();
        info!(launch = %self.shared.identity.launch, resets = state.resets, "progress reset to install start");
        self.shared
            .publish(self.shared.identity.tick(last.message_key(), last.percent()));
        Ok(())
    }

    /// Publish the 100% completion tick and close.
    pub fn completed(&self) {
        if !self.finish(METER_COMPLETED, 100, true) {
            warn!(launch = %self.shared.identity.launch, "completion reported on closed meter");
        }
    }

    /// Publish the cancellation tick and close.
    pub fn cancel(&self) {
        if self.finish(METER_CANCELED, 0, false) {
            info!(launch = %self.shared.identity.launch, "launch progress canceled");
        }
    }

    fn finish(&self, key: &str, percent: u8, completed: bool) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.completed = completed;
        state.percent = percent;
        self.shared.publish(self.shared.identity.tick(key, percent));
        drop(state);
        self.shutdown_stream(false);
        true
    }

    /// Stop accepting output and wait, bounded, for the reader to exit.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shutdown_stream(true);
    }

    /// Wait until every queued line has been matched. Returns `false` when
    /// `timeout` elapses first.
    pub fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.shared.pending.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    fn shutdown_stream(&self, wait: bool) {
        self.sender.lock().take();
        let Some(handle) = self.reader.lock().take() else {
            return;
        };
        let timeout = self.shared.close_timeout;
        let launch = self.shared.identity.launch.clone();
        if wait {
            join_reader(handle, timeout, &launch);
        } else {
            thread::spawn(move || join_reader(handle, timeout, &launch));
        }
    }

    pub fn percent(&self) -> u8 {
        self.shared.state.lock().percent
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().completed
    }

    pub fn error_line(&self) -> Option<String> {
        self.shared.state.lock().error.clone()
    }

    /// Number of successful [`ProgressMeter::reset`] calls.
    pub fn resets(&self) -> usize {
        self.shared.state.lock().resets
    }

    /// Index of the next tick that may match.
    pub fn position(&self) -> usize {
        self.shared.state.lock().cursor.position()
    }
}
