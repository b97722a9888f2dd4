//! QEC Engine - conflict quality, error and correction decisions
//!
//! Decides, for conflicts between governance principles, how fragile each
//! principle is, how a rule synthesis attempt is likely to fail, and how to
//! recover when it does:
//!
//! - **Distance Calculator**: fragility score per principle, cached per content hash
//! - **Error Predictor**: per-category failure probabilities from a trainable model
//! - **Recovery Dispatcher**: strategy state machine with fallback and escalation
//! - **Fidelity Monitor**: periodic composite health score with alerts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          QecEngine                           │
//! │                                                              │
//! │  ┌──────────┐   ┌───────────┐   ┌────────────┐               │
//! │  │ Distance │──▶│ Predictor │──▶│ Dispatcher │──▶ Synthesis  │
//! │  └────┬─────┘   └─────┬─────┘   └─────┬──────┘    backend    │
//! │       │               │               │                      │
//! │       └───────────────┴───────┬───────┘                      │
//! │                       ┌───────▼───────┐                      │
//! │                       │   Fidelity    │ (periodic cycle)     │
//! │                       └───────────────┘                      │
//! │                                                              │
//! │              EngineStore (caches + adaptive table)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod distance;
pub mod engine;
pub mod fidelity;
pub mod history;
pub mod predictor;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod types;

// Re-export main types
pub use config::EngineConfig;
pub use distance::{DistanceCalculator, DistanceScore};
pub use engine::{Actor, ConflictAnalysis, PatchResult, QecEngine, Role};
pub use fidelity::{FidelityLevel, FidelityMonitor, FidelitySnapshot, MetricsRecorder};
pub use history::{InMemoryOutcomeHistory, OutcomeHistory, SynthesisOutcome};
pub use predictor::{ErrorPrediction, ErrorPredictor};
pub use recovery::{RecoveryDispatcher, RecoveryResult, RecoveryState};
pub use retry::RetryPolicy;
pub use store::EngineStore;
pub use types::*;
