//! Sliding-window accounting for exchange-published rate limits.
//!
//! Every quota keeps the weighted calls recorded inside its trailing window.
//! Entries are only purged while a call is being recorded, oldest first, so
//! the bookkeeping never needs a background timer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use braintrust_core::{AppError, AppResult};
use braintrust_domain::{QuotaDefinition, RateLimitCategory};

use crate::clock::Clock;


#[derive(Debug, Clone, Copy)]
struct QuotaEntry {
    weight: u64,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Quota {
    window_seconds: u64,
    window: TimeDelta,
    limit: u64,
    counter: u64,
    entries: VecDeque<QuotaEntry>,
}

impl Quota {
    fn from_definition(definition: &QuotaDefinition) -> Self {
        let window_seconds = definition.window_seconds();
        let window = i64::try_from(window_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        Self {
            window_seconds,
            window,
            limit: definition.limit(),
            counter: 0,
            entries: VecDeque::new(),
        }
    }

    /// Records the weight, expires stale entries and reports whether the
    /// quota is now over its limit.
    fn record(&mut self, weight: u64, now: DateTime<Utc>) -> bool {
        self.counter = self.counter.saturating_add(weight);
        self.entries.push_back(QuotaEntry {
            weight,
            recorded_at: now,
        });

        while let Some(oldest) = self.entries.front().copied() {
            if now.signed_duration_since(oldest.recorded_at) <= self.window {
                break;
            }

            self.counter = self.counter.saturating_sub(oldest.weight);
            self.entries.pop_front();
        }

        self.counter > self.limit
    }

    fn usage(&self) -> QuotaUsage {
        QuotaUsage {
            window_seconds: self.window_seconds,
            limit: self.limit,
            counter: self.counter,
            entries: self.entries.len(),
        }
    }
}

/// Read-only view of one quota's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Trailing window length in seconds.
    pub window_seconds: u64,
    /// Maximum outstanding weight admitted inside the window.
    pub limit: u64,
    /// Weight recorded by entries retained at the last update.
    pub counter: u64,
    /// Number of retained entries.
    pub entries: usize,
}

/// Tracks consumption against every quota an exchange publishes.
///
/// All categories share one lock, so the record, expire and compare sequence
/// of a call is atomic with respect to every other call.
pub struct RateLimitTracker {
    clock: Arc<dyn Clock>,
    quotas: Mutex<BTreeMap<RateLimitCategory, Vec<Quota>>>,
}

impl RateLimitTracker {
    /// Builds one quota per definition, grouped by category.
    #[must_use]
    pub fn new(
        definitions: impl IntoIterator<Item = QuotaDefinition>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut quotas: BTreeMap<RateLimitCategory, Vec<Quota>> = BTreeMap::new();
        for definition in definitions {
            info!(
                category = %definition.category(),
                interval = definition.interval().as_str(),
                interval_num = definition.interval_num(),
                limit = definition.limit(),
                "registered rate limit quota"
            );
            quotas
                .entry(definition.category())
                .or_default()
                .push(Quota::from_definition(&definition));
        }

        Self {
            clock,
            quotas: Mutex::new(quotas),
        }
    }

    /// Returns the categories that have at least one quota.
    #[must_use]
    pub fn categories(&self) -> Vec<RateLimitCategory> {
        self.lock_quotas().keys().copied().collect()
    }

    /// Records `weight` against every quota of `category` and reports whether
    /// the call is admissible.
    ///
    /// The weight stays recorded when the call is rejected. A category with
    /// no configured quota is a caller error.
    pub fn try_consume(&self, category: RateLimitCategory, weight: u64) -> AppResult<bool> {
        let mut quotas = self.lock_quotas();
        let category_quotas = quotas.get_mut(&category).ok_or_else(|| {
            AppError::Validation(format!("no rate limit quota configured for {category}"))
        })?;

        // Read under the lock so entries stay in timestamp order.
        let now = self.clock.now();
        let mut admissible = true;
        for quota in category_quotas.iter_mut() {
            if quota.record(weight, now) {
                admissible = false;
                warn!(
                    category = %category,
                    window_seconds = quota.window_seconds,
                    limit = quota.limit,
                    counter = quota.counter,
                    "rate limit quota exhausted"
                );
            }
        }

        Ok(admissible)
    }

    /// Returns the bookkeeping of every quota in `category` without
    /// recording or expiring anything.
    pub fn usage(&self, category: RateLimitCategory) -> AppResult<Vec<QuotaUsage>> {
        let quotas = self.lock_quotas();
        let category_quotas = quotas.get(&category).ok_or_else(|| {
            AppError::Validation(format!("no rate limit quota configured for {category}"))
        })?;

        Ok(category_quotas.iter().map(Quota::usage).collect())
    }

    fn lock_quotas(&self) -> MutexGuard<'_, BTreeMap<RateLimitCategory, Vec<Quota>>> {
        // Every update completes before the guard drops, so a poisoned map
        // still satisfies the counter invariant.
        self.quotas.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RateLimitTracker")
            .field("quotas", &*self.lock_quotas())
            .finish_non_exhaustive()
    }
}
