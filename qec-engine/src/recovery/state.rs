//! Recovery state machine and its records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use qec_model::{Principle, ValidationTest};

use crate::predictor::ErrorPrediction;
use crate::types::{FailureCategory, RecoveryStrategy};

/// State of one recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Pending,
    StrategySelected,
    Applying,
    Succeeded,
    Failed,
    Escalated,
}

impl RecoveryState {
    /// Whether the state machine may move from `self` to `next`.
    ///
    /// `Failed` re-enters `StrategySelected` for the fallback hop. A run
    /// cancelled mid-attempt also ends in `Failed`.
    pub fn can_transition(&self, next: RecoveryState) -> bool {
        use RecoveryState::*;
        matches!(
            (self, next),
            (Pending, StrategySelected)
                | (StrategySelected, Applying)
                | (Applying, Succeeded)
                | (Applying, Failed)
                | (Applying, Escalated)
                | (Failed, StrategySelected)
                | (Failed, Escalated)
        )
    }

    /// Whether no further transitions follow.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryState::Succeeded | RecoveryState::Escalated)
    }
}

/// Outcome of an attempt or terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failure,
    Escalated,
}

/// One entry in the append-only recovery log.
///
/// Transitions carry distinct `from`/`to` states. Individual strategy
/// attempts are logged with `from == to == Applying` and an outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: String,
    pub run_id: String,
    pub conflict_id: String,
    pub principle_id: String,
    pub category: FailureCategory,
    pub strategy: Option<RecoveryStrategy>,
    pub from: RecoveryState,
    pub to: RecoveryState,
    /// Attempt number within the strategy; 0 for pure transitions
    pub attempt: u32,
    pub outcome: Option<AttemptStatus>,
    pub elapsed_ms: u64,
    /// Prediction that triggered the run
    pub prediction_id: String,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Structured hand-off for human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: String,
    pub run_id: String,
    pub conflict_id: String,
    pub principle_id: String,
    pub category: FailureCategory,
    pub strategies_tried: Vec<RecoveryStrategy>,
    pub attempts: u32,
    pub reason: String,
    pub prediction_id: String,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

/// Input to a recovery run.
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub conflict_id: String,
    pub principle: Principle,
    pub prediction: ErrorPrediction,
    pub tests: Vec<ValidationTest>,
}

/// Result of a recovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub run_id: String,
    pub conflict_id: String,
    pub principle_id: String,
    pub final_state: RecoveryState,
    /// Strategy that produced the final outcome
    pub strategy_used: Option<RecoveryStrategy>,
    pub strategies_tried: Vec<RecoveryStrategy>,
    /// True when adaptive tracking replaced the recommended strategy
    pub overridden: bool,
    pub attempts: u32,
    pub patch: Option<String>,
    pub confidence: f64,
    pub elapsed_ms: u64,
    pub escalation: Option<EscalationRecord>,
}

impl RecoveryResult {
    /// Whether a validated patch was produced.
    pub fn succeeded(&self) -> bool {
        self.final_state == RecoveryState::Succeeded
    }
}

/// Dispatcher statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub escalated: u64,
    pub avg_elapsed_ms: u64,
}

impl DispatcherStats {
    /// Fraction of finished runs that succeeded.
    pub fn success_rate(&self) -> Option<f64> {
        if self.runs == 0 {
            None
        } else {
            Some(self.succeeded as f64 / self.runs as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use RecoveryState::*;
        assert!(Pending.can_transition(StrategySelected));
        assert!(Failed.can_transition(StrategySelected));
        assert!(Failed.can_transition(Escalated));
        assert!(!Pending.can_transition(Applying));
        assert!(!Succeeded.can_transition(StrategySelected));
        assert!(!Escalated.can_transition(StrategySelected));
        assert!(Escalated.is_terminal() && Succeeded.is_terminal());
        assert!(!Failed.is_terminal());
    }
}
