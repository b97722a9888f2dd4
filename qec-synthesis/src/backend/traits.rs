//! Core traits for synthesis backends.
//!
//! This module defines the `SynthesisBackend` trait - the seam between the
//! recovery dispatcher and whatever actually produces and checks rule text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use qec_model::ValidationTest;

use crate::request::SynthesisRequest;

/// Error types for synthesis operations.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    /// Backend is not available
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Request failed
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Rate limited by the backend
    #[error("Rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Parsing error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Backend produced an unusable patch
    #[error("Invalid patch: {0}")]
    InvalidPatch(String),
}

impl SynthesisError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::RateLimited { .. } | Self::NetworkError(_)
        )
    }
}

/// Core trait for synthesis backends.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Get the backend identifier.
    fn id(&self) -> &str;

    /// Check if the backend is currently available.
    async fn is_available(&self) -> bool;

    /// Produce a rule patch for the request.
    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisOutput, SynthesisError>;

    /// Run validation tests against a patch.
    async fn validate(
        &self,
        patch: &str,
        tests: &[ValidationTest],
    ) -> Result<ValidationReport, SynthesisError>;
}

/// A synthesized rule patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisOutput {
    /// Request this output answers
    pub request_id: String,
    /// Rule text
    pub content: String,
    /// Backend confidence in the patch (0.0 - 1.0)
    pub confidence: f64,
    /// Backend that produced the patch
    pub backend_id: String,
    /// When the patch was produced
    pub generated_at: DateTime<Utc>,
}

/// A single failed validation test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Failing test ID
    pub test_id: String,
    /// Why it failed
    pub message: String,
}

/// Result of running validation tests against a patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether every executed test passed
    pub passed: bool,
    /// Number of tests executed
    pub executed: usize,
    /// Number of tests skipped (not machine-checkable)
    pub skipped: usize,
    /// Failures
    pub failures: Vec<TestFailure>,
}

impl ValidationReport {
    /// A report in which every executed test passed.
    pub fn passing(executed: usize, skipped: usize) -> Self {
        Self {
            passed: true,
            executed,
            skipped,
            failures: Vec::new(),
        }
    }

    /// A report with the given failures.
    pub fn failing(executed: usize, skipped: usize, failures: Vec<TestFailure>) -> Self {
        Self {
            passed: failures.is_empty(),
            executed,
            skipped,
            failures,
        }
    }

    /// Failure messages, for feeding back into a refinement request.
    pub fn failure_messages(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.test_id, f.message))
            .collect()
    }
}
