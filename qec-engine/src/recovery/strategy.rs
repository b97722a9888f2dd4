//! Recovery handler trait and the strategy lookup table.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use qec_model::{Principle, ValidationTest};
use qec_synthesis::{SynthesisBackend, SynthesisRequest, ValidationReport};

use super::handlers;
use crate::config::{PredictorConfig, RecoveryConfig, StrategyConfig};
use crate::distance::AmbiguityScorer;
use crate::types::{FailureCategory, RecoveryStrategy, Result};

/// Everything a handler needs for one attempt.
#[derive(Clone)]
pub struct RecoveryContext {
    pub conflict_id: String,
    pub principle: Principle,
    pub category: FailureCategory,
    pub tests: Vec<ValidationTest>,
    /// 1-based attempt within the current strategy
    pub attempt: u32,
    /// Patch from the previous failed attempt
    pub previous_patch: Option<String>,
    /// Validation failures of the previous attempt
    pub previous_failures: Vec<String>,
    /// Last patch that validated for this principle
    pub last_good_patch: Option<String>,
    pub consensus_samples: usize,
    pub scorer: Arc<AmbiguityScorer>,
}

impl RecoveryContext {
    /// Machine-checkable assertions from the validation tests, deduplicated.
    pub fn assertions(&self) -> Vec<String> {
        let mut assertions: Vec<String> = Vec::new();
        for test in self.tests.iter().filter(|t| t.machine_checkable) {
            if !assertions.contains(&test.assertion) {
                assertions.push(test.assertion.clone());
            }
        }
        assertions
    }

    /// Request for `statement` carrying this attempt's assertions.
    pub fn request(&self, statement: impl Into<String>) -> SynthesisRequest {
        SynthesisRequest::new(&self.principle.id, statement)
            .with_conflict(&self.conflict_id)
            .with_assertions(self.assertions())
            .with_attempt(self.attempt)
    }
}

/// Result of one strategy attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// Patch passed validation
    Patched {
        patch: String,
        confidence: f64,
        report: ValidationReport,
    },
    /// Patch missing or failed validation
    Rejected {
        patch: Option<String>,
        failures: Vec<String>,
    },
    /// Automation must stop; a human takes over
    Escalate { reason: String },
}

/// One recovery strategy.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Strategy tag this handler implements.
    fn strategy(&self) -> RecoveryStrategy;

    /// Make one attempt.
    async fn attempt(&self, ctx: &RecoveryContext, backend: &dyn SynthesisBackend) -> Result<AttemptOutcome>;
}

/// Entry in the strategy table.
#[derive(Clone)]
pub struct StrategyEntry {
    pub config: Option<StrategyConfig>,
    pub handler: Arc<dyn RecoveryHandler>,
}

/// Immutable strategy lookup, built once from configuration.
pub struct StrategyTable {
    entries: HashMap<RecoveryStrategy, StrategyEntry>,
    fallbacks: HashMap<FailureCategory, RecoveryStrategy>,
    severities: HashMap<FailureCategory, f64>,
}

impl StrategyTable {
    /// Build the table with the built-in handlers.
    pub fn new(recovery: &RecoveryConfig, predictor: &PredictorConfig) -> Self {
        let entries = handlers::builtin()
            .into_iter()
            .map(|handler| {
                let strategy = handler.strategy();
                (
                    strategy,
                    StrategyEntry {
                        config: recovery.strategies.get(&strategy).copied(),
                        handler,
                    },
                )
            })
            .collect();

        Self {
            entries,
            fallbacks: recovery.fallbacks.iter().map(|(c, s)| (*c, *s)).collect(),
            severities: FailureCategory::all()
                .iter()
                .map(|c| (*c, predictor.severity(*c)))
                .collect(),
        }
    }

    /// Replace the handler for a strategy.
    pub fn with_handler(mut self, handler: Arc<dyn RecoveryHandler>) -> Self {
        let strategy = handler.strategy();
        let config = self.entries.get(&strategy).and_then(|e| e.config);
        self.entries.insert(strategy, StrategyEntry { config, handler });
        self
    }

    /// Handler for a strategy.
    pub fn handler(&self, strategy: RecoveryStrategy) -> Option<Arc<dyn RecoveryHandler>> {
        self.entries.get(&strategy).map(|e| e.handler.clone())
    }

    /// Execution bounds for a strategy applied to a category. Explicit
    /// overrides win; otherwise bounds scale with category severity.
    pub fn config(&self, strategy: RecoveryStrategy, category: FailureCategory) -> StrategyConfig {
        self.entries
            .get(&strategy)
            .and_then(|e| e.config)
            .unwrap_or_else(|| {
                let severity = self
                    .severities
                    .get(&category)
                    .copied()
                    .unwrap_or_else(|| category.default_severity());
                StrategyConfig::for_severity(severity)
            })
    }

    /// Fallback strategy for a category, if configured.
    pub fn fallback(&self, category: FailureCategory) -> Option<RecoveryStrategy> {
        self.fallbacks.get(&category).copied()
    }
}
