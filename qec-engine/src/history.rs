//! Historical synthesis outcomes.
//!
//! The distance calculator reads per-principle success rates from here and
//! the engine appends every recovery outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::{FailureCategory, RecoveryStrategy, Result};

/// One synthesis/recovery outcome for a principle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisOutcome {
    pub principle_id: String,
    pub conflict_id: Option<String>,
    pub category: Option<FailureCategory>,
    pub strategy: Option<RecoveryStrategy>,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

impl SynthesisOutcome {
    /// Create an outcome recorded now.
    pub fn new(principle_id: impl Into<String>, success: bool) -> Self {
        Self {
            principle_id: principle_id.into(),
            conflict_id: None,
            category: None,
            strategy: None,
            success,
            recorded_at: Utc::now(),
        }
    }

    /// Attach the conflict.
    pub fn with_conflict(mut self, conflict_id: impl Into<String>) -> Self {
        self.conflict_id = Some(conflict_id.into());
        self
    }

    /// Attach the category and strategy that produced this outcome.
    pub fn with_recovery(mut self, category: FailureCategory, strategy: RecoveryStrategy) -> Self {
        self.category = Some(category);
        self.strategy = Some(strategy);
        self
    }
}

/// Store of historical synthesis outcomes.
#[async_trait]
pub trait OutcomeHistory: Send + Sync {
    /// Rolling success rate for a principle, `None` when it has no history.
    async fn success_rate(&self, principle_id: &str) -> Result<Option<f64>>;

    /// Append an outcome.
    async fn append(&self, outcome: SynthesisOutcome) -> Result<()>;
}

/// In-memory history keeping the last `window` outcomes per principle.
pub struct InMemoryOutcomeHistory {
    window: usize,
    outcomes: DashMap<String, VecDeque<bool>>,
}

impl InMemoryOutcomeHistory {
    /// Create a history with a rolling window per principle.
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            outcomes: DashMap::new(),
        }
    }

    /// Number of outcomes retained for a principle.
    pub fn len_for(&self, principle_id: &str) -> usize {
        self.outcomes.get(principle_id).map(|o| o.len()).unwrap_or(0)
    }
}

impl Default for InMemoryOutcomeHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl OutcomeHistory for InMemoryOutcomeHistory {
    async fn success_rate(&self, principle_id: &str) -> Result<Option<f64>> {
        Ok(self.outcomes.get(principle_id).and_then(|o| {
            if o.is_empty() {
                None
            } else {
                let successes = o.iter().filter(|s| **s).count();
                Some(successes as f64 / o.len() as f64)
            }
        }))
    }

    async fn append(&self, outcome: SynthesisOutcome) -> Result<()> {
        let mut entry = self.outcomes.entry(outcome.principle_id).or_default();
        entry.push_back(outcome.success);
        while entry.len() > self.window {
            entry.pop_front();
        }
        Ok(())
    }
}
