//! Blocks further API traffic while the core quota is low.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::types::Forge;

/// Floor for a single wait, so a zero increment cannot spin on the API.
const MIN_DELAY: Duration = Duration::from_secs(1);

/// How successive waits grow while the guard is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Every wait is one increment.
    #[default]
    Fixed,
    /// Waits double from one increment up to `max_secs`.
    Exponential { max_secs: u64 },
}

impl Backoff {
    /// Delay before re-checking, for the zero-based wait number `attempt`.
    pub fn delay(&self, increment: Duration, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed => increment,
            Backoff::Exponential { max_secs } => {
                let factor = 2u32.saturating_pow(attempt);
                increment
                    .saturating_mul(factor)
                    .min(Duration::from_secs(*max_secs))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// The guard blocks while fewer calls than this remain.
    pub low_water_mark: u64,
    pub increment_secs: u64,
    /// Total time the guard may block before letting the caller proceed.
    pub budget_secs: u64,
    pub backoff: Backoff,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 100,
            increment_secs: 60,
            budget_secs: 300,
            backoff: Backoff::Fixed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Quota was above the low-water mark; nothing waited.
    Clear { remaining: u64 },
    /// Quota recovered after waiting.
    Recovered { remaining: u64, waited: Duration },
    /// The wait budget ran out with the quota still low.
    BudgetExhausted { remaining: u64, waited: Duration },
}

impl GuardOutcome {
    pub fn waited(&self) -> Duration {
        match self {
            GuardOutcome::Clear { .. } => Duration::ZERO,
            GuardOutcome::Recovered { waited, .. } | GuardOutcome::BudgetExhausted { waited, .. } => {
                *waited
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitGuard {
    config: RateLimitConfig,
}

impl RateLimitGuard {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config }
    }

    /// Checks the remaining quota and sleeps while it is below the low-water
    /// mark, re-checking after each wait, until it recovers or the wait
    /// budget is spent.
    pub async fn wait_for_quota<F>(&self, forge: &F) -> Result<GuardOutcome>
    where
        F: Forge + Sync,
    {
        let increment = Duration::from_secs(self.config.increment_secs);
        let budget = Duration::from_secs(self.config.budget_secs);

        let mut status = forge
            .rate_limit()
            .await
            .context("wait_for_quota: failed to query rate limit")?;

        if status.remaining >= self.config.low_water_mark {
            return Ok(GuardOutcome::Clear {
                remaining: status.remaining,
            });
        }

        let mut waited = Duration::ZERO;
        let mut attempt = 0;

        while status.remaining < self.config.low_water_mark {
            if waited >= budget {
                warn!(
                    remaining = status.remaining,
                    limit = status.limit,
                    waited_secs = waited.as_secs(),
                    "Rate limit wait budget exhausted, continuing"
                );
                return Ok(GuardOutcome::BudgetExhausted {
                    remaining: status.remaining,
                    waited,
                });
            }

            let delay = self
                .config
                .backoff
                .delay(increment, attempt)
                .max(MIN_DELAY)
                .min(budget - waited);

            info!(
                remaining = status.remaining,
                limit = status.limit,
                reset_at = %status.reset_at,
                delay_secs = delay.as_secs(),
                "Rate limit low, waiting"
            );

            tokio::time::sleep(delay).await;
            waited += delay;
            attempt += 1;

            status = forge
                .rate_limit()
                .await
                .context("wait_for_quota: failed to query rate limit")?;
        }

        Ok(GuardOutcome::Recovered {
            remaining: status.remaining,
            waited,
        })
    }
}
