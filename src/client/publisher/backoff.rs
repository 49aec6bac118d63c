//! Per-address producer backoff
//!
//! When the broker closes a producer the address enters a backoff window.
//! Messages for it are rejected until the window passes; the producer is then
//! recreated lazily on the next message. Consecutive closures double the
//! window up to the configured maximum; one successful send resets it.
//!
//! Time is passed in by the caller so the state machine stays pure.

use crate::model::ConnectivityStatus;
use std::time::{Duration, Instant};

/// Upper bound of any backoff window
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Both bounds are capped at [`MAX_WINDOW`]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial: initial.min(MAX_WINDOW),
            max: max.min(MAX_WINDOW),
        }
    }

    /// Window after the given number of consecutive failures (1-based)
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(31);
        self.initial
            .saturating_mul(1u32 << exponent)
            .min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    /// No producer yet, one will be created on demand
    Idle,
    Active { producer_id: u64 },
    /// The address was in use when its session was replaced; a producer is
    /// recreated on demand
    Stale,
    BackingOff { delay: Duration, retry_at: Instant },
}

/// What to do with a message for this address right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Ready { producer_id: u64 },
    /// Create a producer first
    Create,
    /// Reject; the window ends after the remaining duration
    Wait(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerBackoff {
    policy: BackoffPolicy,
    state: BackoffState,
    consecutive_failures: u32,
}

impl ProducerBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: BackoffState::Idle,
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn check(&self, now: Instant) -> Eligibility {
        match self.state {
            BackoffState::Idle | BackoffState::Stale => Eligibility::Create,
            BackoffState::Active { producer_id } => Eligibility::Ready { producer_id },
            BackoffState::BackingOff { retry_at, .. } if now >= retry_at => Eligibility::Create,
            BackoffState::BackingOff { retry_at, .. } => Eligibility::Wait(retry_at - now),
        }
    }

    /// A new producer was created for the address
    pub fn activated(&mut self, producer_id: u64) {
        self.state = BackoffState::Active { producer_id };
    }

    /// The broker closed `producer_id`
    ///
    /// Returns the new window, or `None` when the event is ignored because it
    /// refers to a producer that is no longer the active one (for instance a
    /// second close event while already backing off).
    pub fn closed(&mut self, producer_id: u64, now: Instant) -> Option<Duration> {
        match self.state {
            BackoffState::Active { producer_id: active } if active == producer_id => {
                Some(self.enter_backoff(now))
            }
            _ => None,
        }
    }

    /// The session was replaced and the active producer went with it
    ///
    /// Backoff windows and the failure count survive.
    pub fn session_replaced(&mut self) {
        if let BackoffState::Active { .. } = self.state {
            self.state = BackoffState::Stale;
        }
    }

    /// Creating a producer failed
    pub fn creation_failed(&mut self, now: Instant) -> Duration {
        self.enter_backoff(now)
    }

    /// A send on `producer_id` completed
    pub fn succeeded(&mut self, producer_id: u64) {
        if self.state == (BackoffState::Active { producer_id }) {
            self.consecutive_failures = 0;
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        match self.state {
            BackoffState::Idle => ConnectivityStatus::Unknown,
            BackoffState::Active { .. } | BackoffState::Stale => ConnectivityStatus::Open,
            BackoffState::BackingOff { .. } => ConnectivityStatus::Failed,
        }
    }

    fn enter_backoff(&mut self, now: Instant) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.policy.delay_for(self.consecutive_failures);
        self.state = BackoffState::BackingOff {
            delay,
            retry_at: now.checked_add(delay).unwrap_or(now),
        };
        delay
    }
}
