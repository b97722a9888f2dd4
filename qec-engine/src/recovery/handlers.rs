//! Built-in recovery strategy handlers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use qec_synthesis::{SynthesisBackend, SynthesisDirective, SynthesisRequest, TemplateBackend};

use super::strategy::{AttemptOutcome, RecoveryContext, RecoveryHandler};
use crate::types::{RecoveryStrategy, Result};

/// One handler per strategy.
pub fn builtin() -> Vec<Arc<dyn RecoveryHandler>> {
    vec![
        Arc::new(SimplifiedPromptHandler),
        Arc::new(DecompositionHandler),
        Arc::new(DisambiguationHandler),
        Arc::new(HumanReviewHandler),
        Arc::new(ConsensusHandler),
        Arc::new(RefinementHandler),
        Arc::new(RollbackHandler),
        Arc::new(EmergencyFallbackHandler::default()),
    ]
}

/// Validate `patch` and classify the result.
async fn check(
    ctx: &RecoveryContext,
    backend: &dyn SynthesisBackend,
    patch: String,
    confidence: f64,
) -> Result<AttemptOutcome> {
    let report = backend.validate(&patch, &ctx.tests).await?;
    if report.passed {
        Ok(AttemptOutcome::Patched {
            patch,
            confidence,
            report,
        })
    } else {
        Ok(AttemptOutcome::Rejected {
            patch: Some(patch),
            failures: report.failure_messages(),
        })
    }
}

/// Synthesize one request and validate the result.
async fn synthesize_and_check(
    ctx: &RecoveryContext,
    backend: &dyn SynthesisBackend,
    request: SynthesisRequest,
) -> Result<AttemptOutcome> {
    let output = backend.synthesize(request).await?;
    check(ctx, backend, output.content, output.confidence).await
}

/// First sentence of a statement.
fn core_statement(text: &str) -> String {
    text.split(['.', ';'])
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(text)
        .to_string()
}

/// Split a statement into independently synthesizable clauses.
fn clauses(text: &str) -> Vec<String> {
    text.split(['.', ';'])
        .flat_map(|sentence| sentence.split(" and "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Re-synthesize from the core statement only.
pub struct SimplifiedPromptHandler;

#[async_trait]
impl RecoveryHandler for SimplifiedPromptHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::SimplifiedPrompt
    }

    async fn attempt(&self, ctx: &RecoveryContext, backend: &dyn SynthesisBackend) -> Result<AttemptOutcome> {
        let request = ctx
            .request(core_statement(&ctx.principle.description))
            .with_directive(SynthesisDirective::Simplify)
            .with_temperature(0.3);
        synthesize_and_check(ctx, backend, request).await
    }
}

/// Synthesize each clause separately and validate the combined rule.
pub struct DecompositionHandler;

#[async_trait]
impl RecoveryHandler for DecompositionHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::Decomposition
    }

    async fn attempt(&self, ctx: &RecoveryContext, backend: &dyn SynthesisBackend) -> Result<AttemptOutcome> {
        let parts = clauses(&ctx.principle.description);
        let total = parts.len().max(1);
        debug!(principle_id = %ctx.principle.id, clauses = total, "Decomposing principle");

        let mut combined = Vec::with_capacity(total);
        let mut confidence: f64 = 1.0;
        for (index, clause) in parts.into_iter().enumerate() {
            let request = ctx
                .request(clause)
                .with_directive(SynthesisDirective::FocusOnClause { index, total });
            let output = backend.synthesize(request).await?;
            confidence = confidence.min(output.confidence);
            combined.push(output.content);
        }

        if combined.is_empty() {
            return Ok(AttemptOutcome::Rejected {
                patch: None,
                failures: vec!["principle has no clauses to decompose".to_string()],
            });
        }
        check(ctx, backend, combined.join("\n\n"), confidence).await
    }
}

/// Strip hedge terms before synthesis.
pub struct DisambiguationHandler;

#[async_trait]
impl RecoveryHandler for DisambiguationHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::Disambiguation
    }

    async fn attempt(&self, ctx: &RecoveryContext, backend: &dyn SynthesisBackend) -> Result<AttemptOutcome> {
        let (statement, removed_terms) = ctx.scorer.strip(&ctx.principle.description);
        let request = ctx
            .request(statement)
            .with_directive(SynthesisDirective::ResolveAmbiguity { removed_terms });
        synthesize_and_check(ctx, backend, request).await
    }
}

/// Hand off to a human reviewer.
pub struct HumanReviewHandler;

#[async_trait]
impl RecoveryHandler for HumanReviewHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::HumanReview
    }

    async fn attempt(&self, ctx: &RecoveryContext, _backend: &dyn SynthesisBackend) -> Result<AttemptOutcome> {
        Ok(AttemptOutcome::Escalate {
            reason: format!("{} failures require human review", ctx.category),
        })
    }
}

/// Sample several patches and keep the majority.
pub struct ConsensusHandler;

#[async_trait]
impl RecoveryHandler for ConsensusHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::MultiModelConsensus
    }

    async fn attempt(&self, ctx: &RecoveryContext, backend: &dyn SynthesisBackend) -> Result<AttemptOutcome> {
        let samples = ctx.consensus_samples.max(1);
        let requests = (0..samples).map(|index| {
            ctx.request(ctx.principle.description.clone())
                .with_directive(SynthesisDirective::Sample { index, of: samples })
                .with_temperature(0.9)
        });
        let outputs = futures::future::join_all(requests.map(|r| backend.synthesize(r))).await;

        // Votes keyed by trimmed content: (count, summed confidence, content)
        let mut votes: HashMap<String, (usize, f64, String)> = HashMap::new();
        for output in outputs.into_iter().flatten() {
            let entry = votes
                .entry(output.content.trim().to_string())
                .or_insert((0, 0.0, output.content.clone()));
            entry.0 += 1;
            entry.1 += output.confidence;
        }

        let winner = votes.into_values().max_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| (a.1 / a.0 as f64).total_cmp(&(b.1 / b.0 as f64)))
        });

        match winner {
            Some((count, confidence_sum, content)) if count * 2 > samples => {
                debug!(principle_id = %ctx.principle.id, votes = count, samples, "Consensus reached");
                let agreement = count as f64 / samples as f64;
                check(ctx, backend, content, confidence_sum / count as f64 * agreement).await
            }
            Some((count, _, _)) => Ok(AttemptOutcome::Rejected {
                patch: None,
                failures: vec![format!("no consensus: best patch had {} of {} votes", count, samples)],
            }),
            None => Ok(AttemptOutcome::Rejected {
                patch: None,
                failures: vec![format!("all {} samples failed", samples)],
            }),
        }
    }
}

/// Revise the previous patch using its validation failures.
pub struct RefinementHandler;

#[async_trait]
impl RecoveryHandler for RefinementHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::IncrementalRefinement
    }

    async fn attempt(&self, ctx: &RecoveryContext, backend: &dyn SynthesisBackend) -> Result<AttemptOutcome> {
        let mut request = ctx.request(ctx.principle.description.clone());
        if let Some(previous_patch) = &ctx.previous_patch {
            request = request.with_directive(SynthesisDirective::IncorporateFeedback {
                previous_patch: previous_patch.clone(),
                failures: ctx.previous_failures.clone(),
            });
        }
        synthesize_and_check(ctx, backend, request).await
    }
}

/// Restore the last patch that validated.
pub struct RollbackHandler;

#[async_trait]
impl RecoveryHandler for RollbackHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::Rollback
    }

    async fn attempt(&self, ctx: &RecoveryContext, backend: &dyn SynthesisBackend) -> Result<AttemptOutcome> {
        match &ctx.last_good_patch {
            Some(patch) => check(ctx, backend, patch.clone(), 1.0).await,
            None => Ok(AttemptOutcome::Rejected {
                patch: None,
                failures: vec![format!("no known-good patch for {}", ctx.principle.id)],
            }),
        }
    }
}

/// Render a deny-by-default rule locally, without the synthesis model.
pub struct EmergencyFallbackHandler {
    template: TemplateBackend,
}

impl Default for EmergencyFallbackHandler {
    fn default() -> Self {
        Self {
            template: TemplateBackend::new("qec.emergency"),
        }
    }
}

#[async_trait]
impl RecoveryHandler for EmergencyFallbackHandler {
    fn strategy(&self) -> RecoveryStrategy {
        RecoveryStrategy::EmergencyFallback
    }

    async fn attempt(&self, ctx: &RecoveryContext, backend: &dyn SynthesisBackend) -> Result<AttemptOutcome> {
        let request = ctx
            .request(ctx.principle.description.clone())
            .with_directive(SynthesisDirective::ConservativeDefault);
        let patch = self.template.render(&request);
        check(ctx, backend, patch, 0.3).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistanceConfig;
    use crate::distance::AmbiguityScorer;
    use crate::types::FailureCategory;
    use qec_model::{translate_criteria, CriterionDsl, Principle, PrincipleCategory};
    use qec_synthesis::MockBackend;

    fn context() -> RecoveryContext {
        let config = DistanceConfig::default();
        let principle = Principle::new(
            "p-export",
            "Exports should require consent and exports must be logged. Admins may override.",
            PrincipleCategory::Privacy,
        )
        .with_criterion(CriterionDsl::parse("require consent").unwrap());

        RecoveryContext {
            conflict_id: "c-1".to_string(),
            tests: translate_criteria(&principle),
            principle,
            category: FailureCategory::SyntaxError,
            attempt: 1,
            previous_patch: None,
            previous_failures: Vec::new(),
            last_good_patch: None,
            consensus_samples: 3,
            scorer: Arc::new(
                AmbiguityScorer::new(&config.ambiguity_patterns, config.ambiguity_saturation).unwrap(),
            ),
        }
    }

    #[test]
    fn test_clauses() {
        assert_eq!(
            clauses("A and B. C; D"),
            vec!["A".to_string(), "B".to_string(), "C".to_string(), "D".to_string()]
        );
        assert_eq!(core_statement("First part. Second part."), "First part");
    }

    #[tokio::test]
    async fn test_simplified_prompt() {
        let backend = MockBackend::default();
        let outcome = SimplifiedPromptHandler.attempt(&context(), &backend).await.unwrap();

        assert!(matches!(outcome, AttemptOutcome::Patched { .. }));
        let request = &backend.requests()[0];
        assert_eq!(request.statement, "Exports should require consent and exports must be logged");
        assert!(request.has_directive(|d| matches!(d, SynthesisDirective::Simplify)));
        assert_eq!(request.conflict_id.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn test_decomposition_synthesizes_each_clause() {
        let backend = MockBackend::default();
        let outcome = DecompositionHandler.attempt(&context(), &backend).await.unwrap();

        assert!(matches!(outcome, AttemptOutcome::Patched { .. }));
        assert_eq!(backend.synthesize_count(), 3);
        assert_eq!(backend.validate_count(), 1);
        assert!(backend.requests()[2]
            .has_directive(|d| *d == SynthesisDirective::FocusOnClause { index: 2, total: 3 }));
    }

    #[tokio::test]
    async fn test_disambiguation_strips_hedges() {
        let backend = MockBackend::default();
        DisambiguationHandler.attempt(&context(), &backend).await.unwrap();

        let request = &backend.requests()[0];
        assert!(!request.statement.contains("should"));
        assert!(request.has_directive(|d| matches!(
            d,
            SynthesisDirective::ResolveAmbiguity { removed_terms } if removed_terms.len() == 2
        )));
    }

    #[tokio::test]
    async fn test_human_review_escalates_without_backend() {
        let backend = MockBackend::default();
        let outcome = HumanReviewHandler.attempt(&context(), &backend).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Escalate { .. }));
        assert_eq!(backend.synthesize_count(), 0);
    }

    #[tokio::test]
    async fn test_consensus_majority() {
        let backend = MockBackend::default().with_confidence(0.9);
        let outcome = ConsensusHandler.attempt(&context(), &backend).await.unwrap();

        assert_eq!(backend.synthesize_count(), 3);
        match outcome {
            AttemptOutcome::Patched { confidence, .. } => assert!((confidence - 0.9).abs() < 1e-9),
            other => panic!("expected patch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refinement_uses_feedback() {
        let backend = MockBackend::default();
        let mut ctx = context();
        ctx.attempt = 2;
        ctx.previous_patch = Some("allow := true".to_string());
        ctx.previous_failures = vec!["missing consent check".to_string()];

        RefinementHandler.attempt(&ctx, &backend).await.unwrap();
        let request = &backend.requests()[0];
        assert_eq!(request.attempt, 2);
        assert!(request.has_directive(|d| matches!(d, SynthesisDirective::IncorporateFeedback { .. })));
    }

    #[tokio::test]
    async fn test_rollback() {
        let backend = MockBackend::default();
        let outcome = RollbackHandler.attempt(&context(), &backend).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Rejected { patch: None, .. }));

        let mut ctx = context();
        ctx.last_good_patch = Some("package policy\nallow := false".to_string());
        let outcome = RollbackHandler.attempt(&ctx, &backend).await.unwrap();
        match outcome {
            AttemptOutcome::Patched { patch, .. } => assert!(patch.contains("allow := false")),
            other => panic!("expected patch, got {:?}", other),
        }
        assert_eq!(backend.synthesize_count(), 0);
    }

    #[tokio::test]
    async fn test_emergency_fallback_is_conservative() {
        let backend = MockBackend::default();
        let outcome = EmergencyFallbackHandler::default()
            .attempt(&context(), &backend)
            .await
            .unwrap();

        match outcome {
            AttemptOutcome::Patched { patch, .. } => {
                assert!(patch.contains("default allow := false"));
                assert!(patch.contains("input.consent != null"));
            }
            other => panic!("expected patch, got {:?}", other),
        }
        assert_eq!(backend.synthesize_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_validation_is_rejected() {
        let backend = MockBackend::default().with_default_pass(false);
        let outcome = SimplifiedPromptHandler.attempt(&context(), &backend).await.unwrap();
        match outcome {
            AttemptOutcome::Rejected { patch, failures } => {
                assert!(patch.is_some());
                assert_eq!(failures.len(), 1);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        let backend = MockBackend::default().with_available(false);
        let err = SimplifiedPromptHandler.attempt(&context(), &backend).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
