//! Bounded-wait bus primitives
//!
//! Every blocking step polls in fixed increments so that it stays cancellable,
//! reports progress on long waits and gives up after a caller-chosen bound.

mod async_op;
mod signal;

pub use async_op::{bounded_wait_op, query, read_async, read_block, write_async};
pub use signal::{
    COMPLETION_BIT, LONG_WAIT_MARKER, RQS_BIT, SIGNAL_ARM, SIGNAL_WRITE_SECONDS, signal_write,
};

use common::{CancelToken, NotificationQueue};
use protocol::{ResultItem, TimeoutClass};
use tracing::debug;

/// Length of one poll increment
pub const POLL_INTERVAL_MS: u64 = 30;

/// Timeout class programmed for each poll increment
pub const POLL_CLASS: TimeoutClass = TimeoutClass::T30ms;

/// No progress is reported before this much waiting
pub const PROGRESS_GRACE_MS: u64 = 5_000;

/// What a primitive needs besides the connection
#[derive(Debug, Clone)]
pub struct OpContext {
    pub cancel: CancelToken,
    pub results: NotificationQueue<ResultItem>,
    /// Debug switch: never give up on a wait
    pub disable_timeouts: bool,
}

impl OpContext {
    pub fn new(cancel: CancelToken, results: NotificationQueue<ResultItem>) -> Self {
        Self {
            cancel,
            results,
            disable_timeouts: false,
        }
    }

    pub fn with_timeouts_disabled(mut self, disabled: bool) -> Self {
        self.disable_timeouts = disabled;
        self
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_requested()
    }

    /// Post a progress notification for the consumer
    pub fn progress(&self, message: String) {
        debug!("{}", message);
        self.results.post(ResultItem::progress(message));
    }
}

/// Elapsed time accounting shared by the waiting loops
///
/// Time is counted in poll increments rather than read from a clock, so a
/// wait with bound `max` gives up after at most `max` plus one increment of
/// polling.
#[derive(Debug)]
pub(crate) struct WaitClock {
    elapsed_ms: u64,
    max_ms: u64,
    last_report_s: u64,
}

impl WaitClock {
    pub(crate) fn new(max_seconds: f64) -> Self {
        let max_ms = if max_seconds > 0.0 {
            (max_seconds * 1000.0).round() as u64
        } else {
            0
        };
        Self {
            elapsed_ms: 0,
            max_ms,
            last_report_s: 0,
        }
    }

    pub(crate) fn tick(&mut self) {
        self.elapsed_ms += POLL_INTERVAL_MS;
    }

    pub(crate) fn expired(&self, disabled: bool) -> bool {
        !disabled && self.elapsed_ms > self.max_ms
    }

    /// Whole seconds waited, once per second after the grace period
    pub(crate) fn report_due(&mut self) -> Option<u64> {
        let seconds = self.elapsed_ms / 1000;
        if self.elapsed_ms >= PROGRESS_GRACE_MS && seconds > self.last_report_s {
            self.last_report_s = seconds;
            Some(seconds)
        } else {
            None
        }
    }

    /// Fraction of the bound already used, capped at 1
    pub(crate) fn fraction(&self) -> f64 {
        if self.max_ms == 0 {
            return 1.0;
        }
        (self.elapsed_ms as f64 / self.max_ms as f64).min(1.0)
    }

    pub(crate) fn max_seconds(&self) -> f64 {
        self.max_ms as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_bound_expires_on_first_tick() {
        let mut clock = WaitClock::new(0.0);
        assert!(!clock.expired(false));
        clock.tick();
        assert!(clock.expired(false));
        assert!(!clock.expired(true));

        let mut negative = WaitClock::new(-3.0);
        negative.tick();
        assert!(negative.expired(false));
    }

    #[test]
    fn test_expiry_overshoot_is_one_increment() {
        let mut clock = WaitClock::new(1.0);
        let mut ticks = 0;
        while !clock.expired(false) {
            clock.tick();
            ticks += 1;
        }
        let waited = ticks * POLL_INTERVAL_MS;
        assert!(waited > 1000);
        assert!(waited <= 1000 + POLL_INTERVAL_MS);
    }

    #[test]
    fn test_progress_once_per_second_after_grace() {
        let mut clock = WaitClock::new(60.0);
        let mut reports = Vec::new();
        for _ in 0..(8000 / POLL_INTERVAL_MS) {
            clock.tick();
            if let Some(s) = clock.report_due() {
                reports.push(s);
            }
        }
        assert_eq!(reports, vec![5, 6, 7]);
    }

    #[test]
    fn test_fraction() {
        let mut clock = WaitClock::new(0.3);
        for _ in 0..5 {
            clock.tick();
        }
        assert!((clock.fraction() - 0.5).abs() < 1e-9);
        assert!((clock.max_seconds() - 0.3).abs() < 1e-9);
    }
}
