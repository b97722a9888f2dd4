//! Deterministic template backend.
//!
//! Renders a rule directly from the request's assertions, without a model.
//! Validation checks that every machine-checkable assertion is encoded in the
//! patch. Useful offline and as the emergency path when no model is reachable.

use async_trait::async_trait;
use chrono::Utc;

use qec_model::{Expectation, ValidationTest};

use super::traits::*;
use crate::request::{SynthesisDirective, SynthesisRequest};

/// Template-based backend.
pub struct TemplateBackend {
    backend_id: String,
    package: String,
}

impl TemplateBackend {
    /// Create a new template backend emitting rules into `package`.
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            backend_id: "template".to_string(),
            package: package.into(),
        }
    }

    /// Render a rule for the request.
    pub fn render(&self, request: &SynthesisRequest) -> String {
        let conservative =
            request.has_directive(|d| matches!(d, SynthesisDirective::ConservativeDefault));

        let mut rule = format!(
            "package {}\n\n# principle: {}\n# {}\n\ndefault allow := {}\n",
            self.package,
            request.principle_id,
            request.statement.replace('\n', " "),
            if conservative { "false" } else { "true" }
        );

        let checkable: Vec<&String> = request
            .assertions
            .iter()
            .filter(|a| !a.starts_with('#'))
            .collect();

        if !checkable.is_empty() {
            rule.push_str("\nallow if {\n");
            for assertion in checkable {
                rule.push_str("    ");
                rule.push_str(assertion);
                rule.push('\n');
            }
            rule.push_str("}\n");
        }
        rule
    }
}

impl Default for TemplateBackend {
    fn default() -> Self {
        Self::new("qec.generated")
    }
}

#[async_trait]
impl SynthesisBackend for TemplateBackend {
    fn id(&self) -> &str {
        &self.backend_id
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisOutput, SynthesisError> {
        let content = self.render(&request);
        let confidence = if request.assertions.is_empty() { 0.3 } else { 0.6 };

        Ok(SynthesisOutput {
            request_id: request.request_id,
            content,
            confidence,
            backend_id: self.backend_id.clone(),
            generated_at: Utc::now(),
        })
    }

    async fn validate(
        &self,
        patch: &str,
        tests: &[ValidationTest],
    ) -> Result<ValidationReport, SynthesisError> {
        if patch.trim().is_empty() {
            return Err(SynthesisError::InvalidPatch("patch is empty".to_string()));
        }

        let mut executed = 0;
        let mut skipped = 0;
        let mut failures = Vec::new();

        for test in tests {
            if !test.machine_checkable {
                skipped += 1;
                continue;
            }
            executed += 1;

            // Deny cases also rely on the assertion being present.
            if !patch.contains(&test.assertion) {
                let verb = match test.expect {
                    Expectation::Allow => "allow",
                    Expectation::Deny => "deny",
                };
                failures.push(TestFailure {
                    test_id: test.id.clone(),
                    message: format!("patch cannot {} this input: missing `{}`", verb, test.assertion),
                });
            }
        }

        Ok(ValidationReport::failing(executed, skipped, failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qec_model::{translate_criteria, CriterionDsl, Principle, PrincipleCategory};

    fn principle() -> Principle {
        Principle::new("p-1", "Adults only", PrincipleCategory::Safety)
            .with_criterion(CriterionDsl::parse("user.age >= 18").unwrap())
            .with_criterion(CriterionDsl::parse("Be kind").unwrap())
    }

    #[test]
    fn test_render_and_validate() {
        let backend = TemplateBackend::default();
        let principle = principle();
        let tests = translate_criteria(&principle);
        let assertions = tests.iter().map(|t| t.assertion.clone()).collect();

        let request = SynthesisRequest::new(&principle.id, &principle.description)
            .with_assertions(assertions)
            .with_directive(SynthesisDirective::ConservativeDefault);

        let output = tokio_test::block_on(backend.synthesize(request)).unwrap();
        assert!(output.content.contains("default allow := false"));
        assert!(output.content.contains("input.user.age >= 18"));

        let report = tokio_test::block_on(backend.validate(&output.content, &tests)).unwrap();
        assert!(report.passed);
        assert_eq!(report.executed, 2);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_missing_assertion_fails() {
        let backend = TemplateBackend::default();
        let tests = translate_criteria(&principle());

        let report =
            tokio_test::block_on(backend.validate("package x\ndefault allow := true", &tests))
                .unwrap();
        assert!(!report.passed);
        assert_eq!(report.failures.len(), 2);
    }
}
