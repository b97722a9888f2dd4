//! Distance Calculator.
//!
//! Scores a principle's fragility (0.0 = robust, 1.0 = fragile) from three
//! sub-metrics:
//!
//! - language ambiguity: density of hedging terms in the description
//! - criteria informality: share of criteria that are free text
//! - historical failure: `1 - success rate`
//!
//! Results are cached per (principle, content hash). Callers racing on the
//! same key wait for the in-flight computation instead of repeating it.

mod ambiguity;

pub use ambiguity::AmbiguityScorer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use qec_model::{content_hash, Principle};

use crate::config::{DistanceConfig, DistanceWeights};
use crate::history::OutcomeHistory;
use crate::store::{CachedDistance, EngineStore};
use crate::types::Result;

/// Where the success rate behind a score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessRateSource {
    History,
    Principle,
    Neutral,
}

/// Sub-metrics of a distance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceBreakdown {
    pub ambiguity: f64,
    pub informality: f64,
    pub historical_failure: f64,
    pub success_rate: f64,
    pub success_rate_source: SuccessRateSource,
}

/// A computed distance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceScore {
    pub principle_id: String,
    pub content_hash: String,
    pub score: f64,
    pub breakdown: DistanceBreakdown,
    pub computed_at: DateTime<Utc>,
}

/// Principle fragility scorer.
pub struct DistanceCalculator {
    config: DistanceConfig,
    weights: DistanceWeights,
    scorer: Arc<AmbiguityScorer>,
    history: Option<Arc<dyn OutcomeHistory>>,
    store: Arc<EngineStore>,
    computations: AtomicU64,
}

impl DistanceCalculator {
    /// Create a calculator over the shared store.
    pub fn new(config: DistanceConfig, store: Arc<EngineStore>) -> Result<Self> {
        let scorer = AmbiguityScorer::new(&config.ambiguity_patterns, config.ambiguity_saturation)?;
        Ok(Self {
            weights: config.weights.normalized()?,
            config,
            scorer: Arc::new(scorer),
            history: None,
            store,
            computations: AtomicU64::new(0),
        })
    }

    /// Read success rates from an outcome history.
    pub fn with_history(mut self, history: Arc<dyn OutcomeHistory>) -> Self {
        self.history = Some(history);
        self
    }

    /// The ambiguity scorer, shared with the predictor.
    pub fn scorer(&self) -> Arc<AmbiguityScorer> {
        self.scorer.clone()
    }

    /// Number of underlying computations performed.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::SeqCst)
    }

    /// Score a principle, using the cache when fresh.
    pub async fn score(&self, principle: &Principle) -> Result<DistanceScore> {
        principle.validate()?;
        let hash = content_hash(principle)?;

        let slot = self.store.distance_slot(&principle.id, &hash);
        let mut cached = slot.lock().await;

        if let Some(entry) = cached.as_ref() {
            if entry.cached_at.elapsed() < self.config.cache_ttl() {
                debug!(principle_id = %principle.id, score = entry.score.score, "Distance cache hit");
                return Ok(entry.score.clone());
            }
        }
        debug!(principle_id = %principle.id, "Distance cache miss");

        let score = self.compute(principle, hash).await?;
        *cached = Some(CachedDistance {
            score: score.clone(),
            cached_at: Instant::now(),
        });
        drop(cached);

        self.store.evict_stale_distances(&principle.id, &score.content_hash);
        Ok(score)
    }

    /// Score a principle and write the result back onto it.
    pub async fn score_and_record(&self, principle: &mut Principle) -> Result<DistanceScore> {
        let score = self.score(principle).await?;
        principle.record_distance(score.score, score.computed_at);
        Ok(score)
    }

    /// Forget cached scores for a principle.
    pub fn invalidate(&self, principle_id: &str) {
        self.store.invalidate_distance(principle_id);
    }

    async fn success_rate(&self, principle: &Principle) -> Result<(f64, SuccessRateSource)> {
        if let Some(history) = &self.history {
            let rate = self
                .config
                .history_retry
                .run("success_rate", || history.success_rate(&principle.id))
                .await?;
            if let Some(rate) = rate {
                return Ok((rate.clamp(0.0, 1.0), SuccessRateSource::History));
            }
        }
        Ok(match principle.historical_success_rate {
            Some(rate) => (rate, SuccessRateSource::Principle),
            None => (self.config.neutral_success_rate, SuccessRateSource::Neutral),
        })
    }

    async fn compute(&self, principle: &Principle, content_hash: String) -> Result<DistanceScore> {
        let ambiguity = self.scorer.score(&principle.description);
        let informality = 1.0 - principle.formality_ratio();
        let (success_rate, success_rate_source) = self.success_rate(principle).await?;
        let historical_failure = 1.0 - success_rate;

        let score = (self.weights.ambiguity * ambiguity
            + self.weights.formality * informality
            + self.weights.historical * historical_failure)
            .clamp(0.0, 1.0);

        self.computations.fetch_add(1, Ordering::SeqCst);
        debug!(
            principle_id = %principle.id,
            score,
            ambiguity,
            informality,
            historical_failure,
            source = ?success_rate_source,
            "Computed distance"
        );

        Ok(DistanceScore {
            principle_id: principle.id.clone(),
            content_hash,
            score,
            breakdown: DistanceBreakdown {
                ambiguity,
                informality,
                historical_failure,
                success_rate,
                success_rate_source,
            },
            computed_at: Utc::now(),
        })
    }
}
