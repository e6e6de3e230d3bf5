//! Per-API request budgets.
//!
//! Each budgeted API gets its own `governor` limiter. A budget of N per
//! window lets N requests through at once, then refills one permit every
//! `window / N`. Callers beyond the budget wait for a permit instead of
//! failing. One limiter is built per process and shared by every worker
//! through an `Arc`.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use tracing::debug;

use otr_core::config::RateLimitConfig;
use otr_core::ExternalApi;

use crate::error::RateLimitError;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Quota granting `rate` permits per `window`. For [`DEFAULT_WINDOW`]
/// this is `Quota::per_minute(rate)`.
pub fn quota(api: ExternalApi, rate: i64, window: Duration) -> Result<Quota, RateLimitError> {
    let burst = u32::try_from(rate)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(RateLimitError::InvalidRate { api, rate })?;
    if window == DEFAULT_WINDOW {
        return Ok(Quota::per_minute(burst));
    }
    Quota::with_period(window / burst.get())
        .map(|q| q.allow_burst(burst))
        .ok_or(RateLimitError::InvalidWindow(window))
}

pub struct RateLimiter {
    limiters: HashMap<ExternalApi, DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("budgeted", &self.limiters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RateLimiter {
    /// Build a limiter from per-API budgets. Every budget must be positive.
    pub fn new(budgets: HashMap<ExternalApi, i64>, window: Duration) -> Result<Self, RateLimitError> {
        let limiters = budgets
            .into_iter()
            .map(|(api, rate)| Ok((api, governor::RateLimiter::direct(quota(api, rate, window)?))))
            .collect::<Result<_, RateLimitError>>()?;
        Ok(Self { limiters })
    }

    pub fn from_config(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        Self::new(config.requests_per_minute.clone(), DEFAULT_WINDOW)
    }

    pub fn is_budgeted(&self, api: ExternalApi) -> bool {
        self.limiters.contains_key(&api)
    }

    /// Wait until a permit for `api` is available. Returns immediately for
    /// APIs without a budget.
    pub async fn acquire(&self, api: ExternalApi) {
        let Some(limiter) = self.limiters.get(&api) else {
            return;
        };
        if limiter.check().is_ok() {
            return;
        }
        debug!(%api, "rate budget exhausted, waiting");
        limiter.until_ready().await;
    }

    /// Take a permit only if one is available right now.
    pub fn try_acquire(&self, api: ExternalApi) -> bool {
        self.limiters
            .get(&api)
            .map_or(true, |limiter| limiter.check().is_ok())
    }
}
