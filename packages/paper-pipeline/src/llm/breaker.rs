//! Per-provider circuit breaker.
//!
//! CLOSED -> (N consecutive failures) -> OPEN -> (cooldown) -> HALF_OPEN.
//! HALF_OPEN admits exactly one trial call. A successful trial closes the
//! breaker; a failed one reopens it with a doubled cooldown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::traits::clock::Clock;
use crate::types::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    /// When an open breaker admits its half-open trial
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    cooldown: Duration,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

/// Permission to make one call. Settle it with [`succeed`](Self::succeed) or
/// [`fail`](Self::fail); dropping it unsettled frees a half-open trial slot
/// without counting as either.
#[must_use = "a permit must be settled with succeed() or fail()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let base_cooldown = Duration::from_millis(config.cooldown_ms);
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            base_cooldown,
            max_cooldown: Duration::from_millis(config.max_cooldown_ms).max(base_cooldown),
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                cooldown: base_cooldown,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask to make a call. `None` means short-circuit: make no network call.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let now = self.clock.now();
        let mut s = self.state.lock();

        match s.state {
            CircuitState::Closed => Some(self.permit(false)),
            CircuitState::Open => {
                if !cooldown_elapsed(&s, now) {
                    return None;
                }
                info!(provider = %self.name, "Circuit half-open, admitting trial call");
                s.state = CircuitState::HalfOpen;
                s.trial_in_flight = true;
                Some(self.permit(true))
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    return None;
                }
                s.trial_in_flight = true;
                Some(self.permit(true))
            }
        }
    }

    /// Whether a call right now would be short-circuited.
    pub fn is_open(&self) -> bool {
        let now = self.clock.now();
        let s = self.state.lock();
        match s.state {
            CircuitState::Closed => false,
            CircuitState::Open => !cooldown_elapsed(&s, now),
            CircuitState::HalfOpen => s.trial_in_flight,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let s = self.state.lock();
        BreakerSnapshot {
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            last_failure: s.last_failure,
            cooldown_until: match s.state {
                CircuitState::Open => s.opened_at.map(|at| at + to_chrono(s.cooldown)),
                _ => None,
            },
        }
    }

    fn permit(&self, trial: bool) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            trial,
            settled: false,
        }
    }

    fn on_success(&self) {
        let mut s = self.state.lock();
        if s.state != CircuitState::Closed {
            info!(provider = %self.name, "Circuit closed");
        }
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.opened_at = None;
        s.cooldown = self.base_cooldown;
        s.trial_in_flight = false;
    }

    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut s = self.state.lock();
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.last_failure = Some(now);

        if trial {
            s.cooldown = (s.cooldown * 2).min(self.max_cooldown);
            s.state = CircuitState::Open;
            s.opened_at = Some(now);
            s.trial_in_flight = false;
            warn!(
                provider = %self.name,
                cooldown_ms = s.cooldown.as_millis() as u64,
                "Half-open trial failed, circuit reopened"
            );
        } else if s.state == CircuitState::Closed && s.consecutive_failures >= self.failure_threshold {
            s.state = CircuitState::Open;
            s.opened_at = Some(now);
            warn!(
                provider = %self.name,
                failures = s.consecutive_failures,
                cooldown_ms = s.cooldown.as_millis() as u64,
                "Circuit opened"
            );
        }
    }

    fn on_abandon(&self, trial: bool) {
        if trial {
            self.state.lock().trial_in_flight = false;
        }
    }
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.trial);
        }
    }
}

fn cooldown_elapsed(s: &BreakerState, now: DateTime<Utc>) -> bool {
    match s.opened_at {
        Some(at) => now >= at + to_chrono(s.cooldown),
        None => true,
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
