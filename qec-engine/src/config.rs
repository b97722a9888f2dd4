//! Configuration for the QEC engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use crate::retry::RetryPolicy;
use crate::types::{FailureCategory, QecError, RecoveryStrategy, Result};

/// Configuration for a QEC engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Distance calculator configuration
    pub distance: DistanceConfig,
    /// Error predictor configuration
    pub predictor: PredictorConfig,
    /// Recovery dispatcher configuration
    pub recovery: RecoveryConfig,
    /// Fidelity monitor configuration
    pub fidelity: FidelityConfig,
    /// General settings
    pub general: GeneralConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            distance: DistanceConfig::default(),
            predictor: PredictorConfig::default(),
            recovery: RecoveryConfig::default(),
            fidelity: FidelityConfig::default(),
            general: GeneralConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new config with engine ID.
    pub fn new(engine_id: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.general.engine_id = engine_id.into();
        config
    }

    /// Load config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| QecError::Config(e.to_string()))
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| QecError::Config(e.to_string()))
    }

    /// Check the configuration and normalize weight sets in place.
    pub fn validate(&mut self) -> Result<()> {
        self.distance.weights = self.distance.weights.normalized()?;
        self.fidelity.weights = self.fidelity.weights.normalized()?;

        if !(0.0..=1.0).contains(&self.distance.neutral_success_rate) {
            return Err(QecError::Config(
                "distance.neutral_success_rate must be within [0, 1]".to_string(),
            ));
        }
        let saturation = self.distance.ambiguity_saturation;
        if !(saturation > 0.0 && saturation.is_finite()) {
            return Err(QecError::Config(
                "distance.ambiguity_saturation must be positive".to_string(),
            ));
        }
        if self.predictor.severity_weights.values().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(QecError::Config(
                "predictor severity weights must be within [0, 1]".to_string(),
            ));
        }
        unit_interval("predictor.materiality_threshold", self.predictor.materiality_threshold)?;
        unit_interval("fidelity.hysteresis", self.fidelity.hysteresis)?;
        unit_interval("fidelity.missing_default", self.fidelity.missing_default)?;

        let fidelity = &self.fidelity;
        if fidelity.interval_secs == 0 {
            return Err(QecError::Config("fidelity.interval_secs must be positive".to_string()));
        }
        if fidelity.max_snapshots == 0 {
            return Err(QecError::Config("fidelity.max_snapshots must be at least 1".to_string()));
        }
        let ordered = 0.0 < fidelity.amber_threshold
            && fidelity.amber_threshold < fidelity.green_threshold
            && fidelity.green_threshold <= 1.0;
        if !ordered {
            return Err(QecError::Config(format!(
                "fidelity thresholds must satisfy 0 < amber ({}) < green ({}) <= 1",
                fidelity.amber_threshold, fidelity.green_threshold
            )));
        }
        Ok(())
    }
}

fn unit_interval(field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(QecError::Config(format!("{} must be within [0, 1], got {}", field, value)))
    }
}

/// Normalize a weight vector to sum to 1, rejecting negative or all-zero sets.
fn normalize_weights(section: &str, weights: &mut [f64]) -> Result<()> {
    if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(QecError::Config(format!("{} weights must be non-negative", section)));
    }
    let sum: f64 = weights.iter().sum();
    if sum <= 0.0 {
        return Err(QecError::Config(format!("{} weights must not all be zero", section)));
    }
    if (sum - 1.0).abs() > 1e-9 {
        warn!(section, sum, "Weights do not sum to 1, normalizing");
        for w in weights.iter_mut() {
            *w /= sum;
        }
    }
    Ok(())
}

/// Distance calculator weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceWeights {
    pub ambiguity: f64,
    pub formality: f64,
    pub historical: f64,
}

impl Default for DistanceWeights {
    fn default() -> Self {
        Self {
            ambiguity: 0.3,
            formality: 0.4,
            historical: 0.3,
        }
    }
}

impl DistanceWeights {
    /// Weights rescaled to sum to 1.
    pub fn normalized(&self) -> Result<Self> {
        let mut w = [self.ambiguity, self.formality, self.historical];
        normalize_weights("distance", &mut w)?;
        Ok(Self {
            ambiguity: w[0],
            formality: w[1],
            historical: w[2],
        })
    }
}

/// Distance calculator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    /// Sub-metric weights
    pub weights: DistanceWeights,
    /// Success rate assumed when no history exists
    pub neutral_success_rate: f64,
    /// Cache entry lifetime (seconds)
    pub cache_ttl_secs: u64,
    /// Hedging/vague term patterns (case-insensitive regex)
    pub ambiguity_patterns: Vec<String>,
    /// Hedge-term density that maps to full ambiguity
    pub ambiguity_saturation: f64,
    /// Retry policy for history lookups
    pub history_retry: RetryPolicy,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            weights: DistanceWeights::default(),
            neutral_success_rate: 0.5,
            cache_ttl_secs: 3600,
            ambiguity_patterns: default_ambiguity_patterns(),
            ambiguity_saturation: 0.15,
            history_retry: RetryPolicy::default(),
        }
    }
}

impl DistanceConfig {
    /// Cache TTL as a duration.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_ambiguity_patterns() -> Vec<String> {
    [
        r"\bshould\b",
        r"\bmay\b",
        r"\bmight\b",
        r"\bcould\b",
        r"\bpossibly\b",
        r"\bappropriate(ly)?\b",
        r"\breasonabl[ey]\b",
        r"\bgenerally\b",
        r"\busually\b",
        r"\boften\b",
        r"\bsometimes\b",
        r"\bwhere possible\b",
        r"\bas needed\b",
        r"\bif feasible\b",
        r"\badequate(ly)?\b",
        r"\bsufficient(ly)?\b",
        r"\bsignificant(ly)?\b",
        r"\bvarious\b",
        r"\bapproximately\b",
        r"\btypically\b",
        r"\blikely\b",
        r"\betc\b",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Error predictor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Severity weight per failure category
    pub severity_weights: BTreeMap<FailureCategory, f64>,
    /// Distance change that invalidates a cached prediction
    pub materiality_threshold: f64,
    /// Logged outcomes that trigger a retrain
    pub retrain_after: usize,
    /// Maximum outcomes kept for training
    pub max_outcomes: usize,
    /// SGD learning rate
    pub learning_rate: f64,
    /// SGD passes over the outcome window
    pub epochs: usize,
    /// Accuracy assumed for a model with no measured accuracy
    pub prior_accuracy: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            severity_weights: FailureCategory::all()
                .iter()
                .map(|c| (*c, c.default_severity()))
                .collect(),
            materiality_threshold: 0.05,
            retrain_after: 50,
            max_outcomes: 5000,
            learning_rate: 0.1,
            epochs: 20,
            prior_accuracy: 0.7,
        }
    }
}

impl PredictorConfig {
    /// Severity weight for a category, falling back to the built-in default.
    pub fn severity(&self, category: FailureCategory) -> f64 {
        self.severity_weights
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_severity())
    }
}

/// Execution bounds for a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Timeout per attempt (ms)
    pub timeout_ms: u64,
    /// Maximum attempts
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `backoff_ms * n`
    pub backoff_ms: u64,
}

impl StrategyConfig {
    /// Defaults scaled by category severity.
    pub fn for_severity(severity: f64) -> Self {
        if severity >= 0.8 {
            Self {
                timeout_ms: 30_000,
                max_attempts: 3,
                backoff_ms: 200,
            }
        } else if severity >= 0.5 {
            Self {
                timeout_ms: 15_000,
                max_attempts: 2,
                backoff_ms: 100,
            }
        } else {
            Self {
                timeout_ms: 10_000,
                max_attempts: 2,
                backoff_ms: 100,
            }
        }
    }

    /// Attempt timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Recovery dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Per-strategy bounds; strategies not listed derive from severity
    pub strategies: BTreeMap<RecoveryStrategy, StrategyConfig>,
    /// Fallback strategy per category (one hop)
    pub fallbacks: BTreeMap<FailureCategory, RecoveryStrategy>,
    /// Success-rate lead required for an adaptive override
    pub override_margin: f64,
    /// Samples required before a strategy's rate is trusted
    pub min_samples: u32,
    /// Half-life of adaptive statistics (seconds)
    pub half_life_secs: u64,
    /// Samples drawn by the consensus strategy
    pub consensus_samples: usize,
    /// Maximum retained recovery attempts
    pub attempt_log_capacity: usize,
    /// Maximum retained escalation records
    pub escalation_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        use FailureCategory as C;
        use RecoveryStrategy as S;

        Self {
            strategies: BTreeMap::new(),
            fallbacks: [
                (C::SyntaxError, S::IncrementalRefinement),
                (C::SemanticConflict, S::Decomposition),
                (C::AmbiguousPrinciple, S::SimplifiedPrompt),
                (C::ExcessiveComplexity, S::SimplifiedPrompt),
                (C::Timeout, S::Decomposition),
                (C::LowConfidence, S::MultiModelConsensus),
                (C::ValidationFailure, S::Rollback),
            ]
            .into_iter()
            .collect(),
            override_margin: 0.15,
            min_samples: 5,
            half_life_secs: 86_400,
            consensus_samples: 3,
            attempt_log_capacity: 10_000,
            escalation_capacity: 1000,
        }
    }
}

/// Fidelity component weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FidelityWeights {
    pub principle_coverage: f64,
    pub synthesis_success: f64,
    pub enforcement_reliability: f64,
    pub adaptation_speed: f64,
    pub stakeholder_satisfaction: f64,
    pub appeal_frequency: f64,
}

impl Default for FidelityWeights {
    fn default() -> Self {
        Self {
            principle_coverage: 0.25,
            synthesis_success: 0.20,
            enforcement_reliability: 0.20,
            adaptation_speed: 0.15,
            stakeholder_satisfaction: 0.10,
            appeal_frequency: 0.10,
        }
    }
}

impl FidelityWeights {
    /// Weights in component order.
    pub fn as_array(&self) -> [f64; 6] {
        [
            self.principle_coverage,
            self.synthesis_success,
            self.enforcement_reliability,
            self.adaptation_speed,
            self.stakeholder_satisfaction,
            self.appeal_frequency,
        ]
    }

    /// Weights rescaled to sum to 1.
    pub fn normalized(&self) -> Result<Self> {
        let mut w = self.as_array();
        normalize_weights("fidelity", &mut w)?;
        Ok(Self {
            principle_coverage: w[0],
            synthesis_success: w[1],
            enforcement_reliability: w[2],
            adaptation_speed: w[3],
            stakeholder_satisfaction: w[4],
            appeal_frequency: w[5],
        })
    }
}

/// Fidelity monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FidelityConfig {
    /// Aggregation interval (seconds)
    pub interval_secs: u64,
    /// Component weights
    pub weights: FidelityWeights,
    /// Composite at or above which the level is green
    pub green_threshold: f64,
    /// Composite at or above which the level is amber
    pub amber_threshold: f64,
    /// Margin required to move to a better level
    pub hysteresis: f64,
    /// Trailing window for component readings (seconds)
    pub window_secs: u64,
    /// Snapshot retention (hours)
    pub retention_hours: u64,
    /// Maximum snapshots kept
    pub max_snapshots: usize,
    /// Snapshot is stale after `interval * staleness_factor`
    pub staleness_factor: f64,
    /// Value used for a component that has never been observed
    pub missing_default: f64,
    /// Retry policy for metric source reads
    pub source_retry: RetryPolicy,
    /// Recovery time that scores zero adaptation speed (seconds)
    pub adaptation_target_secs: u64,
    /// Maximum alerts kept in history
    pub alert_capacity: usize,
}

impl Default for FidelityConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300, // 5 minutes
            weights: FidelityWeights::default(),
            green_threshold: 0.85,
            amber_threshold: 0.70,
            hysteresis: 0.01,
            window_secs: 3600,
            retention_hours: 168,
            max_snapshots: 2016,
            staleness_factor: 2.0,
            missing_default: 0.5,
            source_retry: RetryPolicy::default(),
            adaptation_target_secs: 3600,
            alert_capacity: 500,
        }
    }
}

impl FidelityConfig {
    /// Aggregation interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Engine ID
    pub engine_id: String,
    /// Analysis runs enhanced when true; degraded otherwise
    pub enabled: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            engine_id: uuid::Uuid::new_v4().to_string(),
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.distance.weights, DistanceWeights::default());
        assert_eq!(config.fidelity.interval_secs, 300);
        assert_eq!(config.recovery.fallbacks.get(&FailureCategory::BiasDetected), None);
        assert!(config.general.enabled);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = EngineConfig::new("test-engine");
        let yaml = config.to_yaml().unwrap();
        let parsed = EngineConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.general.engine_id, "test-engine");
        assert_eq!(
            parsed.recovery.fallbacks.get(&FailureCategory::Timeout),
            Some(&RecoveryStrategy::Decomposition)
        );
        assert_eq!(parsed.predictor.severity(FailureCategory::BiasDetected), 1.0);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "fidelity:\n  interval_secs: 60\ngeneral:\n  engine_id: e-1\n  enabled: false\n";
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.fidelity.interval_secs, 60);
        assert_eq!(config.fidelity.green_threshold, 0.85);
        assert!(!config.general.enabled);
    }

    #[test]
    fn test_weights_are_normalized() {
        let mut config = EngineConfig::default();
        config.distance.weights = DistanceWeights {
            ambiguity: 1.0,
            formality: 2.0,
            historical: 1.0,
        };
        config.validate().unwrap();
        assert!((config.distance.weights.formality - 0.5).abs() < 1e-9);

        let sum: f64 = config.fidelity.weights.as_array().iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_weight_rejected() {
        let mut config = EngineConfig::default();
        config.fidelity.weights.appeal_frequency = -0.1;
        assert!(matches!(config.validate(), Err(QecError::Config(_))));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = EngineConfig::default();
        config.fidelity.amber_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_fields_rejected() {
        let mut config = EngineConfig::default();
        config.fidelity.hysteresis = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fidelity.missing_default = -0.1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.predictor.materiality_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fidelity.max_snapshots = 0;
        assert!(matches!(config.validate(), Err(QecError::Config(_))));

        let mut config = EngineConfig::default();
        config.distance.ambiguity_saturation = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_bounds_scale_with_severity() {
        let high = StrategyConfig::for_severity(1.0);
        let low = StrategyConfig::for_severity(0.4);
        assert!(high.timeout_ms > low.timeout_ms);
        assert!(high.max_attempts > low.max_attempts);
    }
}
