//! Error Predictor.
//!
//! Predicts, per failure category, how likely a synthesis attempt against a
//! principle is to fail.
//!
//! `overall_risk` is a severity-weighted noisy-OR:
//! `1 - Π(1 - w_c * p_c)`. Each category independently contributes a chance
//! of a failure that matters, scaled by its severity, so one high-severity
//! category dominates many low-severity ones and the result stays in [0, 1].
//!
//! Predictions run against the last committed model snapshot. Retraining
//! builds a new snapshot off to the side and swaps it in.

mod features;
mod model;

pub use features::{FeatureVector, FEATURE_COUNT};
pub use model::{CategoryProbabilities, FailureModel, LabelledOutcome, LinearFailureModel, CATEGORY_COUNT};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use qec_model::Principle;

use crate::config::PredictorConfig;
use crate::distance::AmbiguityScorer;
use crate::store::EngineStore;
use crate::types::{FailureCategory, QecError, RecoveryStrategy, Result};

/// Failure prediction for one principle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPrediction {
    pub id: String,
    pub principle_id: String,
    /// Marginal failure probability per category
    pub probabilities: BTreeMap<FailureCategory, f64>,
    /// Severity-weighted aggregate (0.0 - 1.0)
    pub overall_risk: f64,
    /// Category with the highest severity-adjusted probability
    pub primary_category: FailureCategory,
    pub recommended_strategy: RecoveryStrategy,
    pub confidence: f64,
    /// Model snapshot version; `None` when degraded
    pub model_version: Option<u64>,
    /// True when no usable model produced this prediction
    pub degraded: bool,
    pub distance_score: f64,
    pub predicted_at: DateTime<Utc>,
}

impl ErrorPrediction {
    /// Probability for a category.
    pub fn probability(&self, category: FailureCategory) -> f64 {
        self.probabilities.get(&category).copied().unwrap_or(0.0)
    }
}

/// Severity-weighted noisy-OR over category probabilities.
pub fn aggregate_risk(probabilities: &CategoryProbabilities, config: &PredictorConfig) -> f64 {
    let survival: f64 = FailureCategory::all()
        .iter()
        .map(|c| 1.0 - config.severity(*c) * probabilities[c.index()])
        .product();
    (1.0 - survival).clamp(0.0, 1.0)
}

/// Category with the highest severity-adjusted probability. Ties go to the
/// earlier category.
pub fn primary_category(probabilities: &CategoryProbabilities, config: &PredictorConfig) -> FailureCategory {
    let mut best = FailureCategory::SyntaxError;
    let mut best_score = f64::MIN;
    for category in FailureCategory::all() {
        let score = config.severity(category) * probabilities[category.index()];
        if score > best_score {
            best = category;
            best_score = score;
        }
    }
    best
}

/// Failure predictor with a swappable model snapshot.
pub struct ErrorPredictor {
    config: PredictorConfig,
    scorer: Arc<AmbiguityScorer>,
    store: Arc<EngineStore>,
    model: Arc<RwLock<Option<Arc<dyn FailureModel>>>>,
    outcomes: Arc<RwLock<VecDeque<LabelledOutcome>>>,
    since_retrain: Arc<AtomicUsize>,
    retraining: Arc<AtomicBool>,
    computations: AtomicU64,
}

impl ErrorPredictor {
    /// Create a predictor starting from the prior linear model.
    pub fn new(config: PredictorConfig, scorer: Arc<AmbiguityScorer>, store: Arc<EngineStore>) -> Self {
        let prior: Arc<dyn FailureModel> =
            Arc::new(LinearFailureModel::prior(config.learning_rate, config.epochs));
        Self {
            config,
            scorer,
            store,
            model: Arc::new(RwLock::new(Some(prior))),
            outcomes: Arc::new(RwLock::new(VecDeque::new())),
            since_retrain: Arc::new(AtomicUsize::new(0)),
            retraining: Arc::new(AtomicBool::new(false)),
            computations: AtomicU64::new(0),
        }
    }

    /// Use a specific model snapshot.
    pub fn with_model(mut self, model: Arc<dyn FailureModel>) -> Self {
        self.model = Arc::new(RwLock::new(Some(model)));
        self
    }

    /// Start with no model; predictions are degraded until one is trained.
    pub fn without_model(mut self) -> Self {
        self.model = Arc::new(RwLock::new(None));
        self
    }

    /// Current model snapshot.
    pub async fn model_snapshot(&self) -> Result<Arc<dyn FailureModel>> {
        self.model
            .read()
            .await
            .clone()
            .ok_or_else(|| QecError::ModelUnavailable("no committed model snapshot".to_string()))
    }

    /// Version of the committed model, if any.
    pub async fn model_version(&self) -> Option<u64> {
        self.model.read().await.as_ref().map(|m| m.version())
    }

    /// Number of predictions computed (cache hits excluded).
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::SeqCst)
    }

    /// Predict failure modes for a principle at the given distance.
    pub async fn predict(&self, principle: &Principle, distance: f64) -> Result<ErrorPrediction> {
        principle.validate()?;
        if !(0.0..=1.0).contains(&distance) {
            return Err(QecError::Input(format!(
                "distance score {} for {} is outside [0, 1]",
                distance, principle.id
            )));
        }

        let model = match self.model_snapshot().await {
            Ok(model) => model,
            Err(e) => {
                warn!(principle_id = %principle.id, error = %e, "Predicting in degraded mode");
                return Ok(self.degraded(principle, distance));
            }
        };
        let version = model.version();

        if let Some(cached) = self.store.cached_prediction(&principle.id, version) {
            if (cached.distance - distance).abs() < self.config.materiality_threshold {
                debug!(principle_id = %principle.id, version, "Prediction cache hit");
                return Ok(cached.prediction);
            }
            debug!(
                principle_id = %principle.id,
                cached = cached.distance,
                distance,
                "Distance changed materially, recomputing prediction"
            );
            self.store.invalidate_prediction(&principle.id);
        } else {
            debug!(principle_id = %principle.id, version, "Prediction cache miss");
        }

        let features = self.features(principle, distance);
        let probabilities = match model.predict(&features) {
            Ok(p) => p,
            Err(e) => {
                warn!(principle_id = %principle.id, version, error = %e, "Model failed, predicting in degraded mode");
                return Ok(self.degraded(principle, distance));
            }
        };

        let accuracy = model.accuracy().unwrap_or(self.config.prior_accuracy);
        let prediction = self.build(principle, distance, probabilities, accuracy, Some(version));
        self.computations.fetch_add(1, Ordering::SeqCst);
        self.store.put_prediction(version, distance, prediction.clone());

        debug!(
            principle_id = %principle.id,
            risk = prediction.overall_risk,
            primary = %prediction.primary_category,
            strategy = %prediction.recommended_strategy,
            "Predicted failure modes"
        );
        Ok(prediction)
    }

    fn features(&self, principle: &Principle, distance: f64) -> FeatureVector {
        FeatureVector::extract(principle, self.scorer.score(&principle.description), distance)
    }

    fn build(
        &self,
        principle: &Principle,
        distance: f64,
        raw: CategoryProbabilities,
        accuracy: f64,
        model_version: Option<u64>,
    ) -> ErrorPrediction {
        let mut probabilities = raw;
        for p in probabilities.iter_mut() {
            *p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.5 };
        }

        let primary = primary_category(&probabilities, &self.config);
        let certainty = probabilities.iter().map(|p| (2.0 * p - 1.0).abs()).sum::<f64>()
            / CATEGORY_COUNT as f64;

        ErrorPrediction {
            id: uuid::Uuid::new_v4().to_string(),
            principle_id: principle.id.clone(),
            probabilities: FailureCategory::all()
                .iter()
                .map(|c| (*c, probabilities[c.index()]))
                .collect(),
            overall_risk: aggregate_risk(&probabilities, &self.config),
            primary_category: primary,
            recommended_strategy: primary.default_strategy(),
            confidence: (certainty * accuracy).clamp(0.0, 1.0),
            model_version,
            degraded: model_version.is_none(),
            distance_score: distance,
            predicted_at: Utc::now(),
        }
    }

    fn degraded(&self, principle: &Principle, distance: f64) -> ErrorPrediction {
        self.build(principle, distance, [0.5; CATEGORY_COUNT], 0.0, None)
    }

    /// Log an outcome for training. Spawns a background retrain once enough
    /// outcomes have accumulated.
    pub async fn record_outcome(&self, principle: &Principle, distance: f64, failures: Vec<FailureCategory>) {
        let outcome = LabelledOutcome {
            principle_id: principle.id.clone(),
            features: self.features(principle, distance.clamp(0.0, 1.0)),
            failures,
            recorded_at: Utc::now(),
        };

        // Counted under the lock so a retrain snapshot and its count agree
        let pending = {
            let mut outcomes = self.outcomes.write().await;
            outcomes.push_back(outcome);
            while outcomes.len() > self.config.max_outcomes {
                outcomes.pop_front();
            }
            self.since_retrain.fetch_add(1, Ordering::SeqCst) + 1
        };
        if pending >= self.config.retrain_after && !self.retraining.swap(true, Ordering::SeqCst) {
            let task = self.retrain_task();
            tokio::spawn(async move {
                if let Err(e) = task.run().await {
                    error!(error = %e, "Background retrain failed");
                }
            });
        }
    }

    /// Retrain synchronously. Returns the committed version, or `None` when
    /// a retrain is already running.
    pub async fn retrain_now(&self) -> Result<Option<u64>> {
        if self.retraining.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.retrain_task().run().await.map(Some)
    }

    fn retrain_task(&self) -> RetrainTask {
        RetrainTask {
            config: self.config.clone(),
            store: self.store.clone(),
            model: self.model.clone(),
            outcomes: self.outcomes.clone(),
            since_retrain: self.since_retrain.clone(),
            retraining: self.retraining.clone(),
        }
    }

    /// Number of outcomes retained for training.
    pub async fn outcome_count(&self) -> usize {
        self.outcomes.read().await.len()
    }
}

/// Owned handles needed to retrain off the request path.
struct RetrainTask {
    config: PredictorConfig,
    store: Arc<EngineStore>,
    model: Arc<RwLock<Option<Arc<dyn FailureModel>>>>,
    outcomes: Arc<RwLock<VecDeque<LabelledOutcome>>>,
    since_retrain: Arc<AtomicUsize>,
    retraining: Arc<AtomicBool>,
}

impl RetrainTask {
    async fn run(self) -> Result<u64> {
        let result = self.train_and_commit().await;
        self.retraining.store(false, Ordering::SeqCst);
        result
    }

    async fn train_and_commit(&self) -> Result<u64> {
        let (outcomes, consumed) = {
            let outcomes = self.outcomes.read().await;
            let consumed = self.since_retrain.load(Ordering::SeqCst);
            (outcomes.iter().cloned().collect::<Vec<LabelledOutcome>>(), consumed)
        };
        let base: Arc<dyn FailureModel> = match self.model.read().await.clone() {
            Some(model) => model,
            None => Arc::new(LinearFailureModel::prior(self.config.learning_rate, self.config.epochs)),
        };
        let next_version = base.version() + 1;

        info!(outcomes = outcomes.len(), from_version = base.version(), "Retraining failure model");
        let trained = tokio::task::spawn_blocking(move || base.train(&outcomes, next_version))
            .await
            .map_err(|e| QecError::ModelUnavailable(format!("training task failed: {}", e)))??;

        *self.model.write().await = Some(trained.clone());
        self.store.clear_predictions();
        // Outcomes logged during training count toward the next retrain
        self.since_retrain.fetch_sub(consumed, Ordering::SeqCst);

        info!(
            version = trained.version(),
            accuracy = trained.accuracy().unwrap_or(0.0),
            "Committed failure model"
        );
        Ok(trained.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistanceConfig;
    use qec_model::PrincipleCategory;
    use std::time::Duration;

    fn scorer() -> Arc<AmbiguityScorer> {
        let config = DistanceConfig::default();
        Arc::new(AmbiguityScorer::new(&config.ambiguity_patterns, config.ambiguity_saturation).unwrap())
    }

    fn predictor(config: PredictorConfig) -> ErrorPredictor {
        ErrorPredictor::new(config, scorer(), Arc::new(EngineStore::new(3600)))
    }

    fn principle() -> Principle {
        Principle::new(
            "p-vague",
            "Moderators should generally remove harmful content where possible",
            PrincipleCategory::Safety,
        )
    }

    struct BrokenModel;

    impl FailureModel for BrokenModel {
        fn version(&self) -> u64 {
            7
        }

        fn accuracy(&self) -> Option<f64> {
            None
        }

        fn predict(&self, _features: &FeatureVector) -> Result<CategoryProbabilities> {
            Err(QecError::ModelUnavailable("weights corrupted".to_string()))
        }

        fn train(&self, _outcomes: &[LabelledOutcome], _next_version: u64) -> Result<Arc<dyn FailureModel>> {
            Err(QecError::ModelUnavailable("cannot train".to_string()))
        }
    }

    #[test]
    fn test_noisy_or_risk() {
        let config = PredictorConfig::default();
        let mut p = [0.0; CATEGORY_COUNT];
        assert_eq!(aggregate_risk(&p, &config), 0.0);

        p[FailureCategory::BiasDetected.index()] = 0.5;
        p[FailureCategory::Timeout.index()] = 0.5;
        // 1 - (1 - 1.0 * 0.5) * (1 - 0.4 * 0.5)
        assert!((aggregate_risk(&p, &config) - 0.6).abs() < 1e-9);
        assert_eq!(primary_category(&p, &config), FailureCategory::BiasDetected);
    }

    #[test]
    fn test_severity_outranks_raw_probability() {
        let config = PredictorConfig::default();
        let mut p = [0.0; CATEGORY_COUNT];
        p[FailureCategory::Timeout.index()] = 0.6;
        p[FailureCategory::SemanticConflict.index()] = 0.5;
        // 0.4 * 0.6 < 0.9 * 0.5
        assert_eq!(primary_category(&p, &config), FailureCategory::SemanticConflict);
    }

    #[tokio::test]
    async fn test_predict() {
        let predictor = predictor(PredictorConfig::default());
        let prediction = predictor.predict(&principle(), 0.8).await.unwrap();

        assert!(!prediction.degraded);
        assert_eq!(prediction.model_version, Some(1));
        assert_eq!(prediction.probabilities.len(), 8);
        assert!(prediction.probabilities.values().all(|p| (0.0..=1.0).contains(p)));
        assert!((0.0..=1.0).contains(&prediction.overall_risk));
        assert!((0.0..=1.0).contains(&prediction.confidence));
        assert!(prediction.confidence > 0.0);
        assert_eq!(
            prediction.recommended_strategy,
            prediction.primary_category.default_strategy()
        );

        let max_weighted = FailureCategory::all()
            .iter()
            .map(|c| c.default_severity() * prediction.probability(*c))
            .fold(0.0, f64::max);
        assert!(prediction.overall_risk >= max_weighted);
    }

    #[tokio::test]
    async fn test_prediction_cache_and_materiality() {
        let predictor = predictor(PredictorConfig::default());
        let first = predictor.predict(&principle(), 0.50).await.unwrap();
        let second = predictor.predict(&principle(), 0.52).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(predictor.computations(), 1);

        let third = predictor.predict(&principle(), 0.70).await.unwrap();
        assert_ne!(first.id, third.id);
        assert_eq!(predictor.computations(), 2);
    }

    #[tokio::test]
    async fn test_missing_model_degrades() {
        let predictor = predictor(PredictorConfig::default()).without_model();
        let prediction = predictor.predict(&principle(), 0.5).await.unwrap();

        assert!(prediction.degraded);
        assert_eq!(prediction.confidence, 0.0);
        assert_eq!(prediction.model_version, None);
        assert!(prediction.probabilities.values().all(|p| *p == 0.5));
        assert!(matches!(
            predictor.model_snapshot().await,
            Err(QecError::ModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failing_model_degrades() {
        let predictor = predictor(PredictorConfig::default()).with_model(Arc::new(BrokenModel));
        let prediction = predictor.predict(&principle(), 0.5).await.unwrap();
        assert!(prediction.degraded);
        assert_eq!(prediction.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_distance_rejected() {
        let predictor = predictor(PredictorConfig::default());
        assert!(matches!(
            predictor.predict(&principle(), 1.5).await,
            Err(QecError::Input(_))
        ));
    }

    #[tokio::test]
    async fn test_retrain_now_commits_and_invalidates() {
        let predictor = predictor(PredictorConfig::default());
        predictor.predict(&principle(), 0.5).await.unwrap();
        assert_eq!(predictor.store.prediction_entries(), 1);

        predictor
            .record_outcome(&principle(), 0.5, vec![FailureCategory::AmbiguousPrinciple])
            .await;
        assert_eq!(predictor.retrain_now().await.unwrap(), Some(2));
        assert_eq!(predictor.model_version().await, Some(2));
        assert_eq!(predictor.store.prediction_entries(), 0);

        let prediction = predictor.predict(&principle(), 0.5).await.unwrap();
        assert_eq!(prediction.model_version, Some(2));
    }

    #[tokio::test]
    async fn test_retrain_without_outcomes_keeps_model() {
        let predictor = predictor(PredictorConfig::default());
        assert!(predictor.retrain_now().await.is_err());
        assert_eq!(predictor.model_version().await, Some(1));
        // Flag is released after a failed retrain
        assert!(!predictor.retraining.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_background_retrain_after_threshold() {
        let config = PredictorConfig {
            retrain_after: 3,
            ..Default::default()
        };
        let predictor = predictor(config);

        for _ in 0..3 {
            predictor.record_outcome(&principle(), 0.6, vec![]).await;
        }

        let mut version = predictor.model_version().await;
        for _ in 0..100 {
            if version == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            version = predictor.model_version().await;
        }
        assert_eq!(version, Some(2));
    }

    /// Linear model whose training blocks until released.
    struct GatedModel {
        inner: LinearFailureModel,
        entered: Arc<AtomicBool>,
        release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl FailureModel for GatedModel {
        fn version(&self) -> u64 {
            self.inner.version()
        }

        fn accuracy(&self) -> Option<f64> {
            self.inner.accuracy()
        }

        fn predict(&self, features: &FeatureVector) -> Result<CategoryProbabilities> {
            self.inner.predict(features)
        }

        fn train(&self, outcomes: &[LabelledOutcome], next_version: u64) -> Result<Arc<dyn FailureModel>> {
            self.entered.store(true, Ordering::SeqCst);
            self.release.lock().unwrap().recv().unwrap();
            self.inner.train(outcomes, next_version)
        }
    }

    #[tokio::test]
    async fn test_predictions_served_while_retraining() {
        let config = PredictorConfig {
            retrain_after: 100,
            ..Default::default()
        };
        let entered = Arc::new(AtomicBool::new(false));
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let model = GatedModel {
            inner: LinearFailureModel::prior(config.learning_rate, config.epochs),
            entered: entered.clone(),
            release: std::sync::Mutex::new(release_rx),
        };
        let predictor = Arc::new(predictor(config).with_model(Arc::new(model)));

        predictor.record_outcome(&principle(), 0.6, vec![]).await;
        let retrain = {
            let predictor = predictor.clone();
            tokio::spawn(async move { predictor.retrain_now().await })
        };
        for _ in 0..200 {
            if entered.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(entered.load(Ordering::SeqCst));

        let during = predictor.predict(&principle(), 0.5).await.unwrap();
        assert_eq!(during.model_version, Some(1));
        assert!(!during.degraded);

        for _ in 0..2 {
            predictor.record_outcome(&principle(), 0.6, vec![]).await;
        }
        release_tx.send(()).unwrap();

        assert_eq!(retrain.await.unwrap().unwrap(), Some(2));
        assert_eq!(predictor.since_retrain.load(Ordering::SeqCst), 2);

        let after = predictor.predict(&principle(), 0.5).await.unwrap();
        assert_eq!(after.model_version, Some(2));
    }

    #[tokio::test]
    async fn test_outcome_window_is_bounded() {
        let config = PredictorConfig {
            max_outcomes: 2,
            retrain_after: 100,
            ..Default::default()
        };
        let predictor = predictor(config);
        for _ in 0..5 {
            predictor.record_outcome(&principle(), 0.6, vec![]).await;
        }
        assert_eq!(predictor.outcome_count().await, 2);
    }
}
