//! Core types for the QEC engine.

use serde::{Deserialize, Serialize};
use std::fmt;

use qec_model::ModelError;
use qec_synthesis::SynthesisError;

/// Why a synthesis/validation attempt is expected to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Generated rule does not parse
    SyntaxError,
    /// Generated rule contradicts another principle
    SemanticConflict,
    /// Principle wording admits several readings
    AmbiguousPrinciple,
    /// Principle is too large to synthesize in one pass
    ExcessiveComplexity,
    /// Synthesis does not finish in time
    Timeout,
    /// Synthesis finishes with low confidence
    LowConfidence,
    /// Generated rule fails its validation tests
    ValidationFailure,
    /// Generated rule treats groups unequally
    BiasDetected,
}

impl FailureCategory {
    /// All categories, in declaration order.
    pub fn all() -> [Self; 8] {
        [
            Self::SyntaxError,
            Self::SemanticConflict,
            Self::AmbiguousPrinciple,
            Self::ExcessiveComplexity,
            Self::Timeout,
            Self::LowConfidence,
            Self::ValidationFailure,
            Self::BiasDetected,
        ]
    }

    /// Position in [`FailureCategory::all`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyntaxError => "syntax_error",
            Self::SemanticConflict => "semantic_conflict",
            Self::AmbiguousPrinciple => "ambiguous_principle",
            Self::ExcessiveComplexity => "excessive_complexity",
            Self::Timeout => "timeout",
            Self::LowConfidence => "low_confidence",
            Self::ValidationFailure => "validation_failure",
            Self::BiasDetected => "bias_detected",
        }
    }

    /// Default severity weight (0.0 - 1.0).
    pub fn default_severity(&self) -> f64 {
        match self {
            Self::BiasDetected => 1.0,
            Self::SemanticConflict => 0.9,
            Self::ValidationFailure => 0.8,
            Self::AmbiguousPrinciple => 0.7,
            Self::ExcessiveComplexity => 0.6,
            Self::SyntaxError => 0.5,
            Self::LowConfidence => 0.5,
            Self::Timeout => 0.4,
        }
    }

    /// Strategy recommended for this category.
    pub fn default_strategy(&self) -> RecoveryStrategy {
        match self {
            Self::SyntaxError => RecoveryStrategy::SimplifiedPrompt,
            Self::SemanticConflict => RecoveryStrategy::MultiModelConsensus,
            Self::AmbiguousPrinciple => RecoveryStrategy::Disambiguation,
            Self::ExcessiveComplexity => RecoveryStrategy::Decomposition,
            Self::Timeout => RecoveryStrategy::SimplifiedPrompt,
            Self::LowConfidence => RecoveryStrategy::IncrementalRefinement,
            Self::ValidationFailure => RecoveryStrategy::IncrementalRefinement,
            Self::BiasDetected => RecoveryStrategy::HumanReview,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remediation approach for a failed synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Re-synthesize from a reduced statement
    SimplifiedPrompt,
    /// Synthesize each clause separately and combine
    Decomposition,
    /// Strip vague terms before synthesis
    Disambiguation,
    /// Hand the case to a human reviewer
    HumanReview,
    /// Sample several patches and keep the majority
    MultiModelConsensus,
    /// Revise the previous patch using validation feedback
    IncrementalRefinement,
    /// Restore the last patch that validated
    Rollback,
    /// Emit a conservative deny-by-default rule
    EmergencyFallback,
}

impl RecoveryStrategy {
    /// All strategies, in declaration order.
    pub fn all() -> [Self; 8] {
        [
            Self::SimplifiedPrompt,
            Self::Decomposition,
            Self::Disambiguation,
            Self::HumanReview,
            Self::MultiModelConsensus,
            Self::IncrementalRefinement,
            Self::Rollback,
            Self::EmergencyFallback,
        ]
    }

    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimplifiedPrompt => "simplified_prompt",
            Self::Decomposition => "decomposition",
            Self::Disambiguation => "disambiguation",
            Self::HumanReview => "human_review",
            Self::MultiModelConsensus => "multi_model_consensus",
            Self::IncrementalRefinement => "incremental_refinement",
            Self::Rollback => "rollback",
            Self::EmergencyFallback => "emergency_fallback",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine component, for error attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Distance,
    Predictor,
    Recovery,
    Fidelity,
    Engine,
}

impl Component {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Distance => "distance",
            Self::Predictor => "predictor",
            Self::Recovery => "recovery",
            Self::Fidelity => "fidelity",
            Self::Engine => "engine",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for the QEC engine.
#[derive(Debug, thiserror::Error)]
pub enum QecError {
    /// Malformed principle or conflict data
    #[error("Invalid input: {0}")]
    Input(String),

    /// No prediction model snapshot
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// A strategy attempt exceeded its timeout
    #[error("Strategy {strategy} timed out after {timeout_ms}ms")]
    StrategyTimeout {
        strategy: RecoveryStrategy,
        timeout_ms: u64,
    },

    /// A strategy used all its attempts
    #[error("Strategy {strategy} exhausted after {attempts} attempts")]
    StrategyExhausted {
        strategy: RecoveryStrategy,
        attempts: u32,
    },

    /// Fidelity components could not be sourced
    #[error("Aggregation data missing for: {0:?}")]
    AggregationDataMissing(Vec<String>),

    /// An external collaborator failed
    #[error("{component} collaborator failed: {message}")]
    Collaborator { component: Component, message: String },

    /// Synthesis backend error
    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    /// Work was cancelled by shutdown or stop
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Caller lacks the required role
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ModelError> for QecError {
    fn from(e: ModelError) -> Self {
        QecError::Input(e.to_string())
    }
}

impl QecError {
    /// Component the error originated in.
    pub fn component(&self) -> Component {
        match self {
            QecError::ModelUnavailable(_) => Component::Predictor,
            QecError::StrategyTimeout { .. }
            | QecError::StrategyExhausted { .. }
            | QecError::Synthesis(_)
            | QecError::Cancelled(_) => Component::Recovery,
            QecError::AggregationDataMissing(_) => Component::Fidelity,
            QecError::Collaborator { component, .. } => *component,
            QecError::Input(_) | QecError::Unauthorized(_) | QecError::Config(_) => {
                Component::Engine
            }
        }
    }

    /// Whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            QecError::Collaborator { .. } | QecError::StrategyTimeout { .. } => true,
            QecError::Synthesis(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, QecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_table() {
        assert_eq!(FailureCategory::all().len(), 8);
        for (i, category) in FailureCategory::all().iter().enumerate() {
            assert_eq!(category.index(), i);
            let severity = category.default_severity();
            assert!((0.0..=1.0).contains(&severity));
        }
        assert_eq!(
            FailureCategory::BiasDetected.default_strategy(),
            RecoveryStrategy::HumanReview
        );
    }

    #[test]
    fn test_error_attribution() {
        let err = QecError::StrategyExhausted {
            strategy: RecoveryStrategy::Rollback,
            attempts: 3,
        };
        assert_eq!(err.component(), Component::Recovery);
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Strategy rollback exhausted after 3 attempts");

        let err = QecError::Collaborator {
            component: Component::Distance,
            message: "history store offline".to_string(),
        };
        assert_eq!(err.component(), Component::Distance);
        assert!(err.is_retryable());

        let err: QecError = ModelError::InvalidPrinciple("empty".to_string()).into();
        assert!(matches!(err, QecError::Input(_)));
    }
}
