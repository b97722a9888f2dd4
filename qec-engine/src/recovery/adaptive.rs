//! Adaptive strategy-success tracking.
//!
//! Keeps an exponentially decayed success rate per (category, strategy)
//! pair. Older outcomes lose half their weight every `half_life`, so a
//! strategy that stopped working quickly loses its lead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{FailureCategory, RecoveryStrategy};

/// Success rate used for a recommended strategy with too little data.
const NEUTRAL_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct DecayedRate {
    successes: f64,
    weight: f64,
    samples: u64,
    updated_at: DateTime<Utc>,
}

/// Read-out of one tracked pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRate {
    pub category: FailureCategory,
    pub strategy: RecoveryStrategy,
    /// Decayed success rate (0.0 - 1.0)
    pub rate: f64,
    /// Decayed sample weight
    pub weight: f64,
    /// Raw outcomes recorded
    pub samples: u64,
}

/// Rolling success-rate table shared by dispatcher runs.
pub struct AdaptiveTracker {
    half_life_secs: f64,
    stats: Arc<RwLock<HashMap<(FailureCategory, RecoveryStrategy), DecayedRate>>>,
}

impl AdaptiveTracker {
    /// Create a tracker with the given half-life.
    pub fn new(half_life_secs: u64) -> Self {
        Self {
            half_life_secs: half_life_secs.max(1) as f64,
            stats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn decay(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
        let elapsed = (to - from).num_milliseconds().max(0) as f64 / 1000.0;
        0.5_f64.powf(elapsed / self.half_life_secs)
    }

    /// Record an outcome now.
    pub async fn record(&self, category: FailureCategory, strategy: RecoveryStrategy, success: bool) {
        self.record_at(category, strategy, success, Utc::now()).await;
    }

    /// Record an outcome at `now`.
    pub async fn record_at(
        &self,
        category: FailureCategory,
        strategy: RecoveryStrategy,
        success: bool,
        now: DateTime<Utc>,
    ) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry((category, strategy)).or_insert(DecayedRate {
            successes: 0.0,
            weight: 0.0,
            samples: 0,
            updated_at: now,
        });

        let factor = self.decay(entry.updated_at, now);
        entry.successes = entry.successes * factor + if success { 1.0 } else { 0.0 };
        entry.weight = entry.weight * factor + 1.0;
        entry.samples += 1;
        entry.updated_at = now;

        debug!(
            category = %category,
            strategy = %strategy,
            success,
            rate = entry.successes / entry.weight,
            "Recorded strategy outcome"
        );
    }

    /// Current rate for a pair, as seen at `now`.
    pub async fn rate_at(
        &self,
        category: FailureCategory,
        strategy: RecoveryStrategy,
        now: DateTime<Utc>,
    ) -> Option<StrategyRate> {
        let stats = self.stats.read().await;
        stats
            .get(&(category, strategy))
            .map(|entry| self.read_out(category, strategy, entry, now))
    }

    fn read_out(
        &self,
        category: FailureCategory,
        strategy: RecoveryStrategy,
        entry: &DecayedRate,
        now: DateTime<Utc>,
    ) -> StrategyRate {
        StrategyRate {
            category,
            strategy,
            rate: if entry.weight > 0.0 { entry.successes / entry.weight } else { 0.0 },
            weight: entry.weight * self.decay(entry.updated_at, now),
            samples: entry.samples,
        }
    }

    /// Strategy that beats `recommended` by at least `margin`, if any.
    ///
    /// Only pairs whose decayed weight reaches `min_samples` are trusted.
    /// An untrusted `recommended` is compared as a neutral 0.5. Human review
    /// is never overridden.
    pub async fn best_alternative(
        &self,
        category: FailureCategory,
        recommended: RecoveryStrategy,
        min_samples: u32,
        margin: f64,
        now: DateTime<Utc>,
    ) -> Option<StrategyRate> {
        if recommended == RecoveryStrategy::HumanReview {
            return None;
        }

        let stats = self.stats.read().await;
        let trusted = |strategy: RecoveryStrategy| {
            stats
                .get(&(category, strategy))
                .map(|entry| self.read_out(category, strategy, entry, now))
                .filter(|r| r.weight >= min_samples as f64)
        };

        let baseline = trusted(recommended).map(|r| r.rate).unwrap_or(NEUTRAL_RATE);

        RecoveryStrategy::all()
            .into_iter()
            .filter(|s| *s != recommended)
            .filter_map(trusted)
            .filter(|r| r.rate >= baseline + margin)
            .max_by(|a, b| a.rate.total_cmp(&b.rate))
    }

    /// All tracked pairs, as seen now.
    pub async fn snapshot(&self) -> Vec<StrategyRate> {
        let now = Utc::now();
        let stats = self.stats.read().await;
        let mut rates: Vec<StrategyRate> = stats
            .iter()
            .map(|((category, strategy), entry)| self.read_out(*category, *strategy, entry, now))
            .collect();
        rates.sort_by(|a, b| (a.category, a.strategy).cmp(&(b.category, b.strategy)));
        rates
    }

    /// Drop all statistics.
    pub async fn clear(&self) {
        self.stats.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const CATEGORY: FailureCategory = FailureCategory::SyntaxError;

    async fn record_many(
        tracker: &AdaptiveTracker,
        strategy: RecoveryStrategy,
        successes: usize,
        failures: usize,
        at: DateTime<Utc>,
    ) {
        for _ in 0..successes {
            tracker.record_at(CATEGORY, strategy, true, at).await;
        }
        for _ in 0..failures {
            tracker.record_at(CATEGORY, strategy, false, at).await;
        }
    }

    #[tokio::test]
    async fn test_override_requires_margin_and_samples() {
        let tracker = AdaptiveTracker::new(86_400);
        let now = Utc::now();

        record_many(&tracker, RecoveryStrategy::SimplifiedPrompt, 2, 4, now).await;
        record_many(&tracker, RecoveryStrategy::Decomposition, 5, 1, now).await;
        // Perfect but too few samples
        record_many(&tracker, RecoveryStrategy::Disambiguation, 2, 0, now).await;

        let alt = tracker
            .best_alternative(CATEGORY, RecoveryStrategy::SimplifiedPrompt, 5, 0.15, now)
            .await
            .unwrap();
        assert_eq!(alt.strategy, RecoveryStrategy::Decomposition);

        // Decomposition does not beat itself
        let none = tracker
            .best_alternative(CATEGORY, RecoveryStrategy::Decomposition, 5, 0.15, now)
            .await;
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_stale_statistics_lose_influence() {
        let tracker = AdaptiveTracker::new(3600);
        let then = Utc::now() - Duration::hours(10);
        record_many(&tracker, RecoveryStrategy::Decomposition, 10, 0, then).await;

        let rate = tracker
            .rate_at(CATEGORY, RecoveryStrategy::Decomposition, Utc::now())
            .await
            .unwrap();
        assert_eq!(rate.samples, 10);
        assert!(rate.weight < 0.1);

        let alt = tracker
            .best_alternative(CATEGORY, RecoveryStrategy::SimplifiedPrompt, 5, 0.15, Utc::now())
            .await;
        assert!(alt.is_none());
    }

    #[tokio::test]
    async fn test_recent_failures_outweigh_old_successes() {
        let tracker = AdaptiveTracker::new(3600);
        let now = Utc::now();
        record_many(&tracker, RecoveryStrategy::Rollback, 10, 0, now - Duration::hours(5)).await;
        record_many(&tracker, RecoveryStrategy::Rollback, 0, 5, now).await;

        let rate = tracker.rate_at(CATEGORY, RecoveryStrategy::Rollback, now).await.unwrap();
        assert!(rate.rate < 0.1, "rate was {}", rate.rate);
    }

    #[tokio::test]
    async fn test_human_review_is_never_overridden() {
        let tracker = AdaptiveTracker::new(86_400);
        let now = Utc::now();
        record_many(&tracker, RecoveryStrategy::Decomposition, 10, 0, now).await;

        let alt = tracker
            .best_alternative(CATEGORY, RecoveryStrategy::HumanReview, 5, 0.15, now)
            .await;
        assert!(alt.is_none());
    }
}
