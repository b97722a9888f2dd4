//! Recovery Dispatcher.
//!
//! Maps a predicted failure category to a recovery strategy, applies it
//! under timeout and attempt bounds, falls back at most once, and hands
//! anything it cannot fix to human review.
//!
//! Strategy success rates are tracked per category with exponential decay
//! and may override the predictor's recommendation when a different
//! strategy has been materially more successful.

mod adaptive;
mod dispatcher;
mod handlers;
mod state;
mod strategy;

pub use adaptive::{AdaptiveTracker, StrategyRate};
pub use dispatcher::RecoveryDispatcher;
pub use handlers::{
    ConsensusHandler, DecompositionHandler, DisambiguationHandler, EmergencyFallbackHandler,
    HumanReviewHandler, RefinementHandler, RollbackHandler, SimplifiedPromptHandler,
};
pub use state::{
    AttemptStatus, DispatcherStats, EscalationRecord, RecoveryAttempt, RecoveryRequest,
    RecoveryResult, RecoveryState,
};
pub use strategy::{AttemptOutcome, RecoveryContext, RecoveryHandler, StrategyEntry, StrategyTable};
