//! Exponential-backoff gate for verification attempts.
//!
//! Every failed attempt doubles the lockout window: 1s, 2s, 4s, 8s and so
//! on, unbounded, with no manual reset other than a successful
//! verification. This is a plain doubling policy, not a sliding window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Failure count plus the lockout deadline derived from it. Embedded in
/// every persisted challenge; read-modify-written atomically by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
    failure_count: u32,
    locked_until: Option<DateTime<Utc>>,
}

impl Throttle {
    #[must_use]
    pub fn new(failure_count: u32, locked_until: Option<DateTime<Utc>>) -> Self {
        Self {
            failure_count,
            locked_until,
        }
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    #[must_use]
    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.locked_until
    }

    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    /// Rejects the attempt while a lockout window is active.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] carrying the deadline and failure count
    /// when `now` is still inside the window.
    pub fn check_not_locked(&self, now: DateTime<Utc>) -> Result<(), Error> {
        match self.locked_until {
            Some(locked_until) if now < locked_until => Err(Error::Timeout {
                locked_until,
                failure_count: self.failure_count,
            }),
            _ => Ok(()),
        }
    }

    /// Starts a lockout of `2^failure_count` seconds, then increments the
    /// count. Saturates instead of overflowing once the window exceeds the
    /// representable range.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        let seconds = 1i64
            .checked_shl(self.failure_count)
            .unwrap_or(i64::MAX);
        let window = Duration::try_seconds(seconds).unwrap_or(Duration::MAX);
        self.locked_until = Some(now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC));
        self.failure_count = self.failure_count.saturating_add(1);
    }

    /// Clears the lockout and resets the failure count.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.locked_until = None;
    }
}

/// Explicit composition of the pre/post throttle bookkeeping around a
/// verify predicate: check the gate, run the comparison, record the
/// outcome. Keeps the control flow visible at the call site instead of
/// hiding it behind method decoration.
pub struct ThrottledVerifier<'a> {
    throttle: &'a mut Throttle,
}

impl<'a> ThrottledVerifier<'a> {
    pub fn new(throttle: &'a mut Throttle) -> Self {
        Self { throttle }
    }

    /// Runs `check` under the gate and records its outcome.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] without evaluating `check` while a lockout
    /// is active.
    pub fn verify<F>(self, now: DateTime<Utc>, check: F) -> Result<bool, Error>
    where
        F: FnOnce() -> bool,
    {
        self.throttle.check_not_locked(now)?;
        if check() {
            self.throttle.record_success();
            Ok(true)
        } else {
            self.throttle.record_failure(now);
            Ok(false)
        }
    }
}
