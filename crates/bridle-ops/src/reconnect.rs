//! Reconnect scheduling with an explicit tagged state.
//!
//! The state machine makes "one in-flight reconnect at a time" a checked
//! invariant instead of a side effect of a nullable timer handle: scheduling
//! while an attempt is already scheduled or in flight is a no-op.

use std::time::Duration;

use bridle_core::ReconnectPolicy;
use parking_lot::Mutex;

/// Where the reconnect machinery currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectState {
    /// Nothing scheduled.
    Idle,
    /// A backoff timer is armed for the given zero-based attempt.
    Scheduled {
        /// Attempt the armed timer will fire for.
        attempt: u32,
    },
    /// A dial/handshake is running for the given attempt.
    InFlight {
        /// Attempt currently running.
        attempt: u32,
    },
}

/// One armed reconnect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledAttempt {
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Backoff delay to sleep before dialing.
    pub delay: Duration,
}

struct Inner {
    state: ReconnectState,
    next_attempt: u32,
}

/// Single-flight reconnect scheduler with capped exponential backoff.
pub struct Reconnector {
    policy: ReconnectPolicy,
    inner: Mutex<Inner>,
}

impl Reconnector {
    /// Create an idle scheduler.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                state: ReconnectState::Idle,
                next_attempt: 0,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ReconnectState {
        self.inner.lock().state
    }

    /// Arm the next attempt's backoff timer.
    ///
    /// Returns `None` without side effects when an attempt is already
    /// scheduled or in flight (re-entrant calls are no-ops), or when the
    /// policy's attempt budget is exhausted.
    pub fn try_schedule(&self) -> Option<ScheduledAttempt> {
        let mut inner = self.inner.lock();
        if inner.state != ReconnectState::Idle {
            return None;
        }
        let attempt = inner.next_attempt;
        if !self.policy.allows_attempt(attempt) {
            return None;
        }
        inner.state = ReconnectState::Scheduled { attempt };
        Some(ScheduledAttempt {
            attempt,
            delay: Duration::from_millis(self.policy.delay_ms(attempt)),
        })
    }

    /// The armed timer fired; the dial is starting.
    pub fn begin(&self) {
        let mut inner = self.inner.lock();
        if let ReconnectState::Scheduled { attempt } = inner.state {
            inner.state = ReconnectState::InFlight { attempt };
        }
    }

    /// The in-flight attempt connected; reset the backoff.
    pub fn succeeded(&self) {
        let mut inner = self.inner.lock();
        inner.state = ReconnectState::Idle;
        inner.next_attempt = 0;
    }

    /// The in-flight (or armed) attempt failed; back off further next time.
    pub fn failed(&self) {
        let mut inner = self.inner.lock();
        inner.state = ReconnectState::Idle;
        inner.next_attempt = inner.next_attempt.saturating_add(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
