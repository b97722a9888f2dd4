//! Engine-owned caches and shared tables.
//!
//! One `EngineStore` is created per engine and handed to each component by
//! `Arc`. It is cleared on shutdown.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::debug;

use crate::distance::DistanceScore;
use crate::predictor::ErrorPrediction;
use crate::recovery::AdaptiveTracker;

/// Distance cache key: principle ID and content hash.
pub type DistanceKey = (String, String);

/// A cached distance score.
#[derive(Debug, Clone)]
pub struct CachedDistance {
    pub score: DistanceScore,
    pub cached_at: Instant,
}

/// Per-key distance slot. Holding its lock serializes computation for the key.
pub type DistanceSlot = Arc<Mutex<Option<CachedDistance>>>;

/// A cached prediction and the distance it was computed for.
#[derive(Debug, Clone)]
pub struct CachedPrediction {
    pub distance: f64,
    pub prediction: ErrorPrediction,
}

/// Shared engine state.
pub struct EngineStore {
    distances: DashMap<DistanceKey, DistanceSlot>,
    predictions: DashMap<(String, u64), CachedPrediction>,
    adaptive: Arc<AdaptiveTracker>,
}

impl EngineStore {
    /// Create an empty store.
    pub fn new(adaptive_half_life_secs: u64) -> Self {
        Self {
            distances: DashMap::new(),
            predictions: DashMap::new(),
            adaptive: Arc::new(AdaptiveTracker::new(adaptive_half_life_secs)),
        }
    }

    /// Slot for a distance key, created on first use.
    pub fn distance_slot(&self, principle_id: &str, content_hash: &str) -> DistanceSlot {
        self.distances
            .entry((principle_id.to_string(), content_hash.to_string()))
            .or_default()
            .value()
            .clone()
    }

    /// Drop distance entries for `principle_id` except the one for `keep_hash`.
    pub fn evict_stale_distances(&self, principle_id: &str, keep_hash: &str) {
        self.distances
            .retain(|(id, hash), _| id != principle_id || hash == keep_hash);
    }

    /// Drop all distance entries for a principle.
    pub fn invalidate_distance(&self, principle_id: &str) {
        self.distances.retain(|(id, _), _| id != principle_id);
        debug!(principle_id = %principle_id, "Invalidated distance cache");
    }

    /// Number of distance cache keys.
    pub fn distance_entries(&self) -> usize {
        self.distances.len()
    }

    /// Cached prediction for a principle under a model version.
    pub fn cached_prediction(&self, principle_id: &str, model_version: u64) -> Option<CachedPrediction> {
        self.predictions
            .get(&(principle_id.to_string(), model_version))
            .map(|entry| entry.value().clone())
    }

    /// Cache a prediction.
    pub fn put_prediction(&self, model_version: u64, distance: f64, prediction: ErrorPrediction) {
        self.predictions.insert(
            (prediction.principle_id.clone(), model_version),
            CachedPrediction { distance, prediction },
        );
    }

    /// Drop cached predictions for a principle.
    pub fn invalidate_prediction(&self, principle_id: &str) {
        self.predictions.retain(|(id, _), _| id != principle_id);
    }

    /// Drop every cached prediction.
    pub fn clear_predictions(&self) {
        self.predictions.clear();
    }

    /// Number of cached predictions.
    pub fn prediction_entries(&self) -> usize {
        self.predictions.len()
    }

    /// Adaptive strategy-success table.
    pub fn adaptive(&self) -> Arc<AdaptiveTracker> {
        self.adaptive.clone()
    }

    /// Tear down all cached state.
    pub async fn clear(&self) {
        self.distances.clear();
        self.predictions.clear();
        self.adaptive.clear().await;
        debug!("Engine store cleared");
    }
}
