//! Call duration counter
//!
//! Purely a presentation aid, but its start boundary doubles as the signal
//! that the connected transition fired exactly once.

use std::time::{Duration, Instant};

/// Wall-clock duration counter, active only while the call is connected
#[derive(Debug, Default)]
pub struct CallTimer {
    started: Option<Instant>,
    stopped_after: Option<Duration>,
}

impl CallTimer {
    /// Create an unstarted timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting from zero
    ///
    /// Returns `true` only the first time; a started timer never restarts.
    pub fn start(&mut self) -> bool {
        if self.started.is_some() || self.stopped_after.is_some() {
            return false;
        }
        self.started = Some(Instant::now());
        true
    }

    /// Whether the timer has ever started
    pub fn is_started(&self) -> bool {
        self.started.is_some() || self.stopped_after.is_some()
    }

    /// Elapsed connected time, `None` before the first start
    pub fn elapsed(&self) -> Option<Duration> {
        self.stopped_after
            .or_else(|| self.started.map(|s| s.elapsed()))
    }

    /// Freeze the counter; the final value stays readable
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.stopped_after = Some(started.elapsed());
        }
    }
}
