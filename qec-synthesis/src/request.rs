//! Synthesis request types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instruction that shapes how a backend synthesizes a rule.
///
/// Recovery strategies express themselves through directives rather than
/// through backend-specific prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SynthesisDirective {
    /// Produce the smallest rule that satisfies the core statement
    Simplify,
    /// Only address one clause of a decomposed principle
    FocusOnClause { index: usize, total: usize },
    /// The statement was rewritten to remove vague terms
    ResolveAmbiguity { removed_terms: Vec<String> },
    /// Revise the previous patch using validation feedback
    IncorporateFeedback {
        previous_patch: String,
        failures: Vec<String>,
    },
    /// Deny by default unless a criterion explicitly allows
    ConservativeDefault,
    /// Independent sample in a consensus round
    Sample { index: usize, of: usize },
}

/// Request to synthesize a rule patch for a principle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Unique request identifier
    pub request_id: String,
    /// Principle being synthesized
    pub principle_id: String,
    /// Conflict that triggered synthesis, if any
    pub conflict_id: Option<String>,
    /// Statement the rule must implement
    pub statement: String,
    /// Assertions the rule is expected to encode
    pub assertions: Vec<String>,
    /// Strategy directives
    pub directives: Vec<SynthesisDirective>,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: f32,
    /// Attempt number within the current strategy (1-based)
    pub attempt: u32,
    /// When the request was made
    pub requested_at: DateTime<Utc>,
}

impl SynthesisRequest {
    /// Create a new request for a principle statement.
    pub fn new(principle_id: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            principle_id: principle_id.into(),
            conflict_id: None,
            statement: statement.into(),
            assertions: Vec::new(),
            directives: Vec::new(),
            temperature: 0.7,
            attempt: 1,
            requested_at: Utc::now(),
        }
    }

    /// Set the triggering conflict.
    pub fn with_conflict(mut self, conflict_id: impl Into<String>) -> Self {
        self.conflict_id = Some(conflict_id.into());
        self
    }

    /// Set the expected assertions.
    pub fn with_assertions(mut self, assertions: Vec<String>) -> Self {
        self.assertions = assertions;
        self
    }

    /// Add a directive.
    pub fn with_directive(mut self, directive: SynthesisDirective) -> Self {
        self.directives.push(directive);
        self
    }

    /// Set temperature.
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp.clamp(0.0, 2.0);
        self
    }

    /// Set the attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    /// Whether the request carries a directive matching the predicate.
    pub fn has_directive(&self, predicate: impl Fn(&SynthesisDirective) -> bool) -> bool {
        self.directives.iter().any(predicate)
    }
}
