//! Bounded busy-poll waits.
//!
//! Every wait in the driver is a [`PollPolicy`]: check a condition, sleep a
//! fixed interval through [`Hal::wait_us`], and give up after a fixed number
//! of attempts. Timeouts all carry [`RecoveryAction::ResetDevice`]. When the
//! co-processor or sequencer stops answering, its state is unknown.

use tracing::{debug, trace};

use crate::error::RecoveryAction;
use crate::hal::Hal;
use crate::Error;

/// A retry policy: `max_attempts` checks spaced `interval_us` apart.
///
/// The interval is only slept *between* attempts, so a policy with one
/// attempt never waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Time between attempts, in microseconds.
    pub interval_us: u32,
    /// Total number of times the condition is checked.
    pub max_attempts: u32,
    /// Recovery action attached to the timeout error.
    pub on_timeout: RecoveryAction,
}

impl PollPolicy {
    /// A policy of `max_attempts` checks spaced `interval_us` apart.
    pub const fn new(max_attempts: u32, interval_us: u32) -> Self {
        Self {
            interval_us,
            max_attempts,
            on_timeout: RecoveryAction::ResetDevice,
        }
    }

    /// A policy derived from a total timeout and a check interval.
    ///
    /// The interval is clamped to the timeout, and the condition is checked
    /// once more than `timeout / interval` times, so it is always sampled at
    /// both ends of the window.
    pub const fn from_timeout(timeout_us: u32, interval_us: u32) -> Self {
        let interval_us = if interval_us > timeout_us {
            timeout_us
        } else {
            interval_us
        };
        let checks = if interval_us == 0 {
            1
        } else {
            timeout_us / interval_us
        };
        Self::new(checks.saturating_add(1), interval_us)
    }

    /// Replace the recovery action reported on timeout.
    pub const fn with_timeout_action(mut self, action: RecoveryAction) -> Self {
        self.on_timeout = action;
        self
    }

    /// Total time this policy may sleep, in microseconds.
    pub fn budget_us(&self) -> u64 {
        self.max_attempts.saturating_sub(1) as u64 * self.interval_us as u64
    }

    /// Call `check` until it returns `Some`, sleeping between attempts.
    ///
    /// Errors from `check` end the poll immediately. `what` names the
    /// condition in the timeout error and logs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] carrying [`Self::on_timeout`] if every
    /// attempt came back `None`.
    pub fn poll<H, T, F>(&self, hal: &mut H, what: &'static str, mut check: F) -> Result<T, Error>
    where
        H: Hal + ?Sized,
        F: FnMut(&mut H) -> Result<Option<T>, Error>,
    {
        for attempt in 0..self.max_attempts {
            if let Some(v) = check(hal)? {
                trace!("{what}: done after {} attempt(s)", attempt + 1);
                return Ok(v);
            }
            if attempt + 1 < self.max_attempts {
                hal.wait_us(self.interval_us);
            }
        }
        debug!(
            "{what}: gave up after {} attempts ({} us)",
            self.max_attempts,
            self.budget_us()
        );
        Err(Error::Timeout {
            what,
            action: self.on_timeout,
        })
    }
}

/// Waiting for the co-processor to accept a new command.
pub const MAILBOX_IDLE: PollPolicy = PollPolicy::from_timeout(1_000_000, 1_000);
/// Waiting for a mailbox command to complete.
pub const MAILBOX_COMPLETE: PollPolicy = PollPolicy::from_timeout(2_000_000, 1_000);
/// Waiting for all frame-timing sequencers to park on the null pattern.
pub const RS_PARK: PollPolicy = PollPolicy::new(1000, 100);
/// Waiting for all sequencers to report the reset debug state.
pub const RS_RESET: PollPolicy = PollPolicy::new(1000, 100);
/// Waiting for sequencers to reach the startup pattern.
pub const RS_START: PollPolicy = PollPolicy::new(1000, 1000);
/// Waiting for a main CPU to take a forced exception.
pub const CPU_EXCEPTION: PollPolicy = PollPolicy::new(1000, 1000);
/// Waiting for the DFE processor to finish its exception handler.
pub const DFE_EXCEPTION: PollPolicy = PollPolicy::new(500, 1000);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHal;

    #[test]
    fn from_timeout_counts() {
        let p = PollPolicy::from_timeout(1000, 100);
        assert_eq!(p.max_attempts, 11);
        assert_eq!(p.interval_us, 100);
        let p = PollPolicy::from_timeout(50, 100);
        assert_eq!(p.interval_us, 50);
        assert_eq!(p.max_attempts, 2);
        let p = PollPolicy::from_timeout(0, 0);
        assert_eq!(p.max_attempts, 2);
    }

    #[test]
    fn sleeps_only_between_attempts() {
        let mut hal = SimHal::new();
        let p = PollPolicy::new(5, 10);
        let mut n = 0;
        let r = p.poll(&mut hal, "never", |_| {
            n += 1;
            Ok(None::<()>)
        });
        assert_eq!(n, 5);
        assert_eq!(hal.now_us(), 40);
        match r {
            Err(Error::Timeout { what, action }) => {
                assert_eq!(what, "never");
                assert_eq!(action, RecoveryAction::ResetDevice);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn returns_value_and_propagates_errors() {
        let mut hal = SimHal::new();
        let p = PollPolicy::new(10, 1);
        let mut n = 0;
        let v = p
            .poll(&mut hal, "third", |_| {
                n += 1;
                Ok((n == 3).then_some(n))
            })
            .unwrap();
        assert_eq!(v, 3);
        assert_eq!(hal.now_us(), 2);

        let r: Result<(), _> = p.poll(&mut hal, "err", |_| Err(Error::ReturnData));
        assert!(matches!(r, Err(Error::ReturnData)));
    }

    #[test]
    fn override_action() {
        let mut hal = SimHal::new();
        let p = PollPolicy::new(1, 1).with_timeout_action(RecoveryAction::CheckParam);
        let e = p.poll(&mut hal, "x", |_| Ok(None::<()>)).unwrap_err();
        assert_eq!(e.recovery_action(), RecoveryAction::CheckParam);
    }
}
