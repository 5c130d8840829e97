//! Spend tracking against daily and total cost ceilings.
//!
//! Calls reserve their projected cost before touching the network, so
//! concurrent extraction workers cannot jointly overshoot a ceiling. The
//! daily counter resets lazily on the first check or commit after midnight
//! in the configured timezone.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Ceiling, ConfigError, LlmError, LlmResult};
use crate::persist::{discard_stray_temp, write_atomic};
use crate::traits::clock::{Clock, SystemClock};
use crate::types::config::BudgetConfig;
use crate::types::extraction::TokenUsage;

/// Persisted spend counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetUsage {
    /// Calendar day the daily counters belong to
    pub day: Option<NaiveDate>,
    pub daily_spend: Decimal,
    pub total_spend: Decimal,
    pub daily_tokens: u64,
    pub total_tokens: u64,
    pub calls: u64,
}

#[derive(Debug, Default)]
struct BudgetState {
    usage: BudgetUsage,
    /// Held by in-flight calls; counts against both ceilings
    reserved: Decimal,
}

pub struct BudgetTracker {
    daily_limit: Option<Decimal>,
    total_limit: Option<Decimal>,
    offset: FixedOffset,
    clock: Arc<dyn Clock>,
    state: Mutex<BudgetState>,
    state_path: Option<PathBuf>,
    /// Serializes state file writes so a stale snapshot never lands last
    persist_lock: tokio::sync::Mutex<()>,
}

/// Projected cost held against the ceilings until the call finishes.
///
/// Dropping it without [`commit`](Self::commit) releases the hold.
#[must_use = "an uncommitted reservation is released on drop"]
pub struct Reservation<'a> {
    tracker: &'a BudgetTracker,
    amount: Decimal,
    settled: bool,
}

impl BudgetTracker {
    pub fn new(config: &BudgetConfig, clock: Arc<dyn Clock>) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| {
                warn!(minutes = config.utc_offset_minutes, "Invalid budget UTC offset, using UTC");
                Utc.fix()
            });
        Self {
            daily_limit: config.daily_limit,
            total_limit: config.total_limit,
            offset,
            clock,
            state: Mutex::new(BudgetState::default()),
            state_path: config.state_path.clone(),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// No ceilings, no persistence.
    pub fn unlimited() -> Self {
        Self::new(
            &BudgetConfig {
                daily_limit: None,
                total_limit: None,
                state_path: None,
                ..Default::default()
            },
            Arc::new(SystemClock),
        )
    }

    /// Build a tracker and restore persisted counters from `state_path`.
    pub async fn load(config: &BudgetConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let tracker = Self::new(config, clock);
        let Some(path) = &tracker.state_path else {
            return Ok(tracker);
        };

        if discard_stray_temp(path).await? {
            warn!(path = %path.display(), "Discarded interrupted budget write");
        }
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let usage: BudgetUsage = serde_json::from_slice(&bytes)?;
                info!(
                    total_spend = %usage.total_spend,
                    daily_spend = %usage.daily_spend,
                    "Restored budget state"
                );
                tracker.state.lock().usage = usage;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(tracker)
    }

    /// Fail if `projected` would exceed either ceiling right now.
    pub fn check(&self, projected: Decimal) -> LlmResult<()> {
        let mut state = self.state.lock();
        self.roll_day(&mut state);
        self.admit(&state, projected)
    }

    /// Check and hold `projected` against both ceilings.
    pub fn reserve(&self, projected: Decimal) -> LlmResult<Reservation<'_>> {
        let mut state = self.state.lock();
        self.roll_day(&mut state);
        self.admit(&state, projected)?;
        state.reserved += projected;
        Ok(Reservation {
            tracker: self,
            amount: projected,
            settled: false,
        })
    }

    /// Current counters, after any pending day rollover.
    pub fn usage(&self) -> BudgetUsage {
        let mut state = self.state.lock();
        self.roll_day(&mut state);
        state.usage.clone()
    }

    /// Spend still available today, after reservations. None = unlimited.
    pub fn remaining_daily(&self) -> Option<Decimal> {
        let mut state = self.state.lock();
        self.roll_day(&mut state);
        self.daily_limit
            .map(|limit| limit - state.usage.daily_spend - state.reserved)
    }

    pub fn remaining_total(&self) -> Option<Decimal> {
        let state = self.state.lock();
        self.total_limit
            .map(|limit| limit - state.usage.total_spend - state.reserved)
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.offset).date_naive()
    }

    fn roll_day(&self, state: &mut BudgetState) {
        let today = self.today();
        match state.usage.day {
            Some(day) if day == today => {}
            Some(day) => {
                info!(
                    previous = %day,
                    today = %today,
                    spent = %state.usage.daily_spend,
                    "Daily budget reset"
                );
                state.usage.day = Some(today);
                state.usage.daily_spend = Decimal::ZERO;
                state.usage.daily_tokens = 0;
            }
            None => state.usage.day = Some(today),
        }
    }

    fn admit(&self, state: &BudgetState, projected: Decimal) -> LlmResult<()> {
        let ceilings = [
            (Ceiling::Daily, self.daily_limit, state.usage.daily_spend),
            (Ceiling::Total, self.total_limit, state.usage.total_spend),
        ];
        for (ceiling, limit, spent) in ceilings {
            let Some(limit) = limit else { continue };
            let remaining = limit - spent - state.reserved;
            if projected > remaining {
                warn!(%ceiling, %projected, %remaining, "Budget would be exceeded, rejecting call");
                return Err(LlmError::CostLimitExceeded {
                    ceiling,
                    projected,
                    remaining: remaining.max(Decimal::ZERO),
                });
            }
        }
        Ok(())
    }

    fn settle(&self, reserved: Decimal, actual: Option<(&TokenUsage, Decimal)>) {
        let mut state = self.state.lock();
        state.reserved = (state.reserved - reserved).max(Decimal::ZERO);
        let Some((usage, cost)) = actual else {
            return;
        };
        self.roll_day(&mut state);
        let tokens = usage.total();
        state.usage.daily_spend += cost;
        state.usage.total_spend += cost;
        state.usage.daily_tokens += tokens;
        state.usage.total_tokens += tokens;
        state.usage.calls += 1;
        debug!(
            %cost,
            tokens,
            daily_spend = %state.usage.daily_spend,
            total_spend = %state.usage.total_spend,
            "Recorded LLM usage"
        );
    }

    async fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let _guard = self.persist_lock.lock().await;
        let usage = self.state.lock().usage.clone();
        let result = match serde_json::to_vec_pretty(&usage) {
            Ok(bytes) => write_atomic(path, &bytes).await,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = result {
            // Spend is still enforced in memory for this run.
            warn!(path = %path.display(), error = %e, "Failed to persist budget state");
        }
    }
}

impl Reservation<'_> {
    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// Record the call's actual usage and release the hold.
    pub async fn commit(mut self, usage: &TokenUsage, cost: Decimal) {
        self.settled = true;
        self.tracker.settle(self.amount, Some((usage, cost)));
        self.tracker.persist().await;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.settle(self.amount, None);
        }
    }
}
