//! ---
//! fleet_section: "06-supervision"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch worker supervision."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Returned by blocking operations whose [`Interrupt`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation interrupted")]
pub struct Interrupted;

#[derive(Debug, Default)]
struct Flag {
    raised: Mutex<bool>,
    wake: Condvar,
}

/// Cooperative cancellation token shared between a worker and its supervisor.
///
/// Once triggered it stays triggered. Workers poll it between steps and sleep
/// through it so a trigger wakes them immediately.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<Flag>,
}

impl Interrupt {
    /// Fresh, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every sleeper.
    pub fn trigger(&self) {
        *self.flag.raised.lock() = true;
        self.flag.wake.notify_all();
    }

    /// Whether the flag has been raised.
    pub fn is_triggered(&self) -> bool {
        *self.flag.raised.lock()
    }

    /// Fail fast when the flag has been raised.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_triggered() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless the flag is raised first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        let deadline = Instant::now() + duration;
        let mut raised = self.flag.raised.lock();
        while !*raised {
            if self.flag.wake.wait_until(&mut raised, deadline).timed_out() {
                return if *raised { Err(Interrupted) } else { Ok(()) };
            }
        }
        Err(Interrupted)
    }
}
