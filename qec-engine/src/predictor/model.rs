//! Failure models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::features::{FeatureVector, FEATURE_COUNT};
use crate::types::{FailureCategory, QecError, Result};

/// Number of failure categories.
pub const CATEGORY_COUNT: usize = 8;

/// Per-category failure probabilities, indexed by [`FailureCategory::index`].
pub type CategoryProbabilities = [f64; CATEGORY_COUNT];

/// A logged outcome with the features it was predicted from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelledOutcome {
    pub principle_id: String,
    pub features: FeatureVector,
    /// Categories that actually failed; empty on success
    pub failures: Vec<FailureCategory>,
    pub recorded_at: DateTime<Utc>,
}

impl LabelledOutcome {
    fn label(&self, category: FailureCategory) -> f64 {
        if self.failures.contains(&category) {
            1.0
        } else {
            0.0
        }
    }
}

/// A trained failure classifier.
///
/// Implementations are immutable snapshots: training returns a new model.
pub trait FailureModel: Send + Sync {
    /// Monotonic model version.
    fn version(&self) -> u64;

    /// Accuracy measured at training time, if any.
    fn accuracy(&self) -> Option<f64>;

    /// Failure probability per category.
    fn predict(&self, features: &FeatureVector) -> Result<CategoryProbabilities>;

    /// Train a successor model on logged outcomes.
    fn train(&self, outcomes: &[LabelledOutcome], next_version: u64) -> Result<Arc<dyn FailureModel>>;
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// One logistic scorer per failure category.
#[derive(Debug, Clone)]
pub struct LinearFailureModel {
    version: u64,
    weights: [[f64; FEATURE_COUNT]; CATEGORY_COUNT],
    bias: [f64; CATEGORY_COUNT],
    accuracy: Option<f64>,
    learning_rate: f64,
    epochs: usize,
}

impl LinearFailureModel {
    /// Untrained model with hand-set priors, version 1.
    pub fn prior(learning_rate: f64, epochs: usize) -> Self {
        use FeatureVector as F;

        let mut weights = [[0.0; FEATURE_COUNT]; CATEGORY_COUNT];
        let mut bias = [-2.5; CATEGORY_COUNT];
        let mut set = |category: FailureCategory, feature: usize, w: f64| {
            weights[category.index()][feature] = w;
        };

        set(FailureCategory::SyntaxError, F::COMPLEXITY, 1.0);
        set(FailureCategory::SyntaxError, F::INFORMALITY, 0.8);
        set(FailureCategory::SemanticConflict, F::DEPENDENCIES, 1.5);
        set(FailureCategory::SemanticConflict, F::DISTANCE, 1.0);
        set(FailureCategory::AmbiguousPrinciple, F::AMBIGUITY, 3.0);
        set(FailureCategory::AmbiguousPrinciple, F::INFORMALITY, 1.0);
        set(FailureCategory::ExcessiveComplexity, F::LENGTH, 2.0);
        set(FailureCategory::ExcessiveComplexity, F::COMPLEXITY, 2.0);
        set(FailureCategory::Timeout, F::LENGTH, 1.5);
        set(FailureCategory::Timeout, F::COMPLEXITY, 1.0);
        set(FailureCategory::LowConfidence, F::DISTANCE, 2.0);
        set(FailureCategory::LowConfidence, F::AMBIGUITY, 1.0);
        set(FailureCategory::ValidationFailure, F::INFORMALITY, 2.0);
        set(FailureCategory::ValidationFailure, F::DISTANCE, 1.0);
        set(FailureCategory::BiasDetected, F::CATEGORY_WEIGHT, 1.0);
        set(FailureCategory::BiasDetected, F::AMBIGUITY, 0.5);

        bias[FailureCategory::ExcessiveComplexity.index()] = -3.0;
        bias[FailureCategory::Timeout.index()] = -3.0;
        bias[FailureCategory::BiasDetected.index()] = -3.5;

        Self {
            version: 1,
            weights,
            bias,
            accuracy: None,
            learning_rate,
            epochs,
        }
    }

    fn probability(&self, category: usize, features: &FeatureVector) -> f64 {
        let z: f64 = self.weights[category]
            .iter()
            .zip(features.values.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias[category];
        sigmoid(z)
    }
}

impl FailureModel for LinearFailureModel {
    fn version(&self) -> u64 {
        self.version
    }

    fn accuracy(&self) -> Option<f64> {
        self.accuracy
    }

    fn predict(&self, features: &FeatureVector) -> Result<CategoryProbabilities> {
        if !features.is_finite() {
            return Err(QecError::ModelUnavailable(
                "feature vector contains non-finite values".to_string(),
            ));
        }
        let mut probabilities = [0.0; CATEGORY_COUNT];
        for (i, p) in probabilities.iter_mut().enumerate() {
            *p = self.probability(i, features);
        }
        Ok(probabilities)
    }

    fn train(&self, outcomes: &[LabelledOutcome], next_version: u64) -> Result<Arc<dyn FailureModel>> {
        if outcomes.is_empty() {
            return Err(QecError::ModelUnavailable("no outcomes to train on".to_string()));
        }

        let mut next = self.clone();
        next.version = next_version;

        for _ in 0..self.epochs {
            for outcome in outcomes {
                for category in FailureCategory::all() {
                    let i = category.index();
                    let error = next.probability(i, &outcome.features) - outcome.label(category);
                    for (w, x) in next.weights[i].iter_mut().zip(outcome.features.values.iter()) {
                        *w -= self.learning_rate * error * x;
                    }
                    next.bias[i] -= self.learning_rate * error;
                }
            }
        }

        let mut correct = 0usize;
        for outcome in outcomes {
            for category in FailureCategory::all() {
                let predicted = next.probability(category.index(), &outcome.features) >= 0.5;
                if predicted == (outcome.label(category) > 0.5) {
                    correct += 1;
                }
            }
        }
        next.accuracy = Some(correct as f64 / (outcomes.len() * CATEGORY_COUNT) as f64);

        Ok(Arc::new(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(ambiguity: f64) -> FeatureVector {
        let mut values = [0.2; FEATURE_COUNT];
        values[FeatureVector::AMBIGUITY] = ambiguity;
        FeatureVector { values }
    }

    fn outcome(ambiguity: f64, failures: Vec<FailureCategory>) -> LabelledOutcome {
        LabelledOutcome {
            principle_id: "p".to_string(),
            features: features(ambiguity),
            failures,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_prior_tracks_ambiguity() {
        let model = LinearFailureModel::prior(0.1, 10);
        let clear = model.predict(&features(0.0)).unwrap();
        let vague = model.predict(&features(1.0)).unwrap();

        let i = FailureCategory::AmbiguousPrinciple.index();
        assert!(vague[i] > clear[i]);
        assert!(clear.iter().chain(vague.iter()).all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_training_learns_labels() {
        let model = LinearFailureModel::prior(0.5, 50);
        let mut outcomes = Vec::new();
        for _ in 0..20 {
            outcomes.push(outcome(1.0, vec![FailureCategory::Timeout]));
            outcomes.push(outcome(0.0, vec![]));
        }

        let trained = model.train(&outcomes, 2).unwrap();
        assert_eq!(trained.version(), 2);
        assert!(trained.accuracy().unwrap() > 0.9);

        let i = FailureCategory::Timeout.index();
        let before = model.predict(&features(1.0)).unwrap()[i];
        let after = trained.predict(&features(1.0)).unwrap()[i];
        assert!(after > 0.5 && after > before);
        assert!(trained.predict(&features(0.0)).unwrap()[i] < 0.5);
    }

    #[test]
    fn test_train_without_outcomes_fails() {
        let model = LinearFailureModel::prior(0.1, 10);
        assert!(matches!(model.train(&[], 2), Err(QecError::ModelUnavailable(_))));
    }

    #[test]
    fn test_non_finite_features_rejected() {
        let model = LinearFailureModel::prior(0.1, 10);
        assert!(model.predict(&features(f64::NAN)).is_err());
    }
}
