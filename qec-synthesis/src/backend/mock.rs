//! Mock synthesis backend for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use qec_model::ValidationTest;

use super::traits::*;
use crate::request::SynthesisRequest;

/// Mock backend for testing.
///
/// Validation outcomes can be scripted; once the script runs out the default
/// outcome is used. Synthesis can be delayed to exercise timeouts.
pub struct MockBackend {
    backend_id: String,
    available: AtomicBool,
    patch_content: String,
    confidence: f64,
    delay: Option<Duration>,
    validation_script: Mutex<VecDeque<bool>>,
    default_pass: bool,
    synthesize_count: AtomicU32,
    validate_count: AtomicU32,
    requests: Mutex<Vec<SynthesisRequest>>,
}

impl MockBackend {
    /// Create a new mock backend whose patches always validate.
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            available: AtomicBool::new(true),
            patch_content: "package policy\n\ndefault allow := false\n".to_string(),
            confidence: 0.8,
            delay: None,
            validation_script: Mutex::new(VecDeque::new()),
            default_pass: true,
            synthesize_count: AtomicU32::new(0),
            validate_count: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Set the patch content.
    pub fn with_patch(mut self, content: impl Into<String>) -> Self {
        self.patch_content = content.into();
        self
    }

    /// Set the reported confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Delay every synthesis call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Script validation outcomes, consumed in order.
    pub fn with_validation_script(self, outcomes: Vec<bool>) -> Self {
        if let Ok(mut script) = self.validation_script.lock() {
            script.extend(outcomes);
        }
        self
    }

    /// Outcome used once the script is exhausted.
    pub fn with_default_pass(mut self, pass: bool) -> Self {
        self.default_pass = pass;
        self
    }

    /// Set availability.
    pub fn with_available(self, available: bool) -> Self {
        self.available.store(available, Ordering::SeqCst);
        self
    }

    /// Toggle availability at runtime.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of synthesize calls.
    pub fn synthesize_count(&self) -> u32 {
        self.synthesize_count.load(Ordering::SeqCst)
    }

    /// Number of validate calls.
    pub fn validate_count(&self) -> u32 {
        self.validate_count.load(Ordering::SeqCst)
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_validation(&self) -> bool {
        self.validation_script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or(self.default_pass)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new("mock-synthesis")
    }
}

#[async_trait]
impl SynthesisBackend for MockBackend {
    fn id(&self) -> &str {
        &self.backend_id
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisOutput, SynthesisError> {
        self.synthesize_count.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(SynthesisError::Unavailable("Mock backend disabled".to_string()));
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let request_id = request.request_id.clone();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        Ok(SynthesisOutput {
            request_id,
            content: self.patch_content.clone(),
            confidence: self.confidence,
            backend_id: self.backend_id.clone(),
            generated_at: Utc::now(),
        })
    }

    async fn validate(
        &self,
        _patch: &str,
        tests: &[ValidationTest],
    ) -> Result<ValidationReport, SynthesisError> {
        self.validate_count.fetch_add(1, Ordering::SeqCst);

        if !self.available.load(Ordering::SeqCst) {
            return Err(SynthesisError::Unavailable("Mock backend disabled".to_string()));
        }

        let executed = tests.iter().filter(|t| t.machine_checkable).count();
        let skipped = tests.len() - executed;

        if self.next_validation() {
            Ok(ValidationReport::passing(executed, skipped))
        } else {
            Ok(ValidationReport::failing(
                executed,
                skipped,
                vec![TestFailure {
                    test_id: "mock".to_string(),
                    message: "scripted validation failure".to_string(),
                }],
            ))
        }
    }
}
