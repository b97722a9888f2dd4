//! QecEngine - the decision engine facade.
//!
//! Wires the Distance Calculator, Error Predictor, Recovery Dispatcher and
//! Fidelity Monitor around one [`EngineStore`] and feeds their outcomes back
//! into history, training and fidelity metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use qec_model::{translate_criteria, Conflict, MemberDistance, Principle, ValidationTest};
use qec_synthesis::SynthesisBackend;

use crate::config::EngineConfig;
use crate::distance::{DistanceCalculator, DistanceScore};
use crate::fidelity::{FidelityHistory, FidelityMonitor, FidelityStatus, MetricEvent, MetricsRecorder};
use crate::history::{InMemoryOutcomeHistory, OutcomeHistory, SynthesisOutcome};
use crate::predictor::{ErrorPrediction, ErrorPredictor};
use crate::recovery::{EscalationRecord, RecoveryDispatcher, RecoveryRequest, RecoveryResult, StrategyTable};
use crate::store::EngineStore;
use crate::types::{Component, FailureCategory, QecError, RecoveryStrategy, Result};

/// Role of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

/// Caller identity for privileged operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id, Role::Admin)
    }

    fn require_admin(&self, operation: &str) -> Result<()> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            warn!(actor = %self.id, role = ?self.role, operation, "Rejected privileged operation");
            Err(QecError::Unauthorized(format!("{} requires the admin role", operation)))
        }
    }
}

/// Distance and prediction for one conflict member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberAnalysis {
    pub principle_id: String,
    pub distance: DistanceScore,
    pub prediction: ErrorPrediction,
}

/// Result of analyzing a conflict.
///
/// When `enhanced` is false the engine was disabled or a component failed;
/// `degraded_reason` and `failed_component` say why, and the analysis
/// fields are empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    pub conflict_id: String,
    pub enhanced: bool,
    pub degraded_reason: Option<String>,
    pub failed_component: Option<Component>,
    pub members: Vec<MemberAnalysis>,
    pub average_distance: Option<f64>,
    /// Category and strategy of the riskiest member
    pub primary_category: Option<FailureCategory>,
    pub recommended_strategy: Option<RecoveryStrategy>,
    /// 0.4 average distance + 0.4 max risk + 0.2 severity weight
    pub priority: Option<f64>,
    /// True when any member prediction ran without a model
    pub degraded_prediction: bool,
    pub validation_scenarios: Vec<ValidationTest>,
    pub analyzed_at: DateTime<Utc>,
}

impl ConflictAnalysis {
    fn not_enhanced(conflict_id: &str, reason: impl Into<String>, component: Option<Component>) -> Self {
        Self {
            conflict_id: conflict_id.to_string(),
            enhanced: false,
            degraded_reason: Some(reason.into()),
            failed_component: component,
            members: Vec::new(),
            average_distance: None,
            primary_category: None,
            recommended_strategy: None,
            priority: None,
            degraded_prediction: false,
            validation_scenarios: Vec::new(),
            analyzed_at: Utc::now(),
        }
    }
}

/// Result of an automated patch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchResult {
    pub conflict_id: String,
    pub enhanced: bool,
    pub degraded_reason: Option<String>,
    pub failed_component: Option<Component>,
    pub success: bool,
    /// Principle the patch targets
    pub principle_id: Option<String>,
    pub strategy_used: Option<RecoveryStrategy>,
    pub confidence: f64,
    pub patch: Option<String>,
    pub generation_ms: u64,
    pub escalation: Option<EscalationRecord>,
}

impl PatchResult {
    fn not_enhanced(conflict_id: &str, reason: impl Into<String>, component: Option<Component>) -> Self {
        Self {
            conflict_id: conflict_id.to_string(),
            enhanced: false,
            degraded_reason: Some(reason.into()),
            failed_component: component,
            success: false,
            principle_id: None,
            strategy_used: None,
            confidence: 0.0,
            patch: None,
            generation_ms: 0,
            escalation: None,
        }
    }
}

/// Priority of a conflict analysis, clamped to [0, 1].
pub fn priority_score(average_distance: f64, max_risk: f64, severity_weight: f64) -> f64 {
    (0.4 * average_distance + 0.4 * max_risk + 0.2 * severity_weight).clamp(0.0, 1.0)
}

/// The conflict QEC decision engine.
pub struct QecEngine {
    config: EngineConfig,
    enabled: AtomicBool,
    store: Arc<EngineStore>,
    history: Arc<dyn OutcomeHistory>,
    distance: DistanceCalculator,
    predictor: ErrorPredictor,
    dispatcher: RecoveryDispatcher,
    metrics: Arc<MetricsRecorder>,
    monitor: Arc<FidelityMonitor>,
}

impl QecEngine {
    /// Create an engine with in-memory outcome history.
    pub fn new(config: EngineConfig, backend: Arc<dyn SynthesisBackend>) -> Result<Self> {
        Self::with_history(config, backend, Arc::new(InMemoryOutcomeHistory::default()))
    }

    /// Create an engine over a specific outcome history.
    pub fn with_history(
        mut config: EngineConfig,
        backend: Arc<dyn SynthesisBackend>,
        history: Arc<dyn OutcomeHistory>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(EngineStore::new(config.recovery.half_life_secs));
        let distance =
            DistanceCalculator::new(config.distance.clone(), store.clone())?.with_history(history.clone());
        let scorer = distance.scorer();
        let predictor = ErrorPredictor::new(config.predictor.clone(), scorer.clone(), store.clone());

        let table = Arc::new(StrategyTable::new(&config.recovery, &config.predictor));
        let dispatcher =
            RecoveryDispatcher::new(config.recovery.clone(), table, backend, store.adaptive(), scorer);

        let metrics = Arc::new(MetricsRecorder::new(Duration::from_secs(
            config.fidelity.adaptation_target_secs,
        )));
        let monitor = Arc::new(FidelityMonitor::new(config.fidelity.clone(), metrics.clone())?);

        info!(engine_id = %config.general.engine_id, enabled = config.general.enabled, "QEC engine created");

        Ok(Self {
            enabled: AtomicBool::new(config.general.enabled),
            config,
            store,
            history,
            distance,
            predictor,
            dispatcher,
            metrics,
            monitor,
        })
    }

    /// Replace the failure predictor.
    pub fn with_predictor(mut self, predictor: ErrorPredictor) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn id(&self) -> &str {
        &self.config.general.engine_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable enhanced analysis.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            info!(engine_id = %self.id(), enabled, "Engine enabled state changed");
        }
    }

    /// Map conflict members to their principles.
    fn members<'a>(&self, conflict: &Conflict, principles: &'a [Principle]) -> Result<Vec<&'a Principle>> {
        conflict.validate()?;
        let by_id: HashMap<&str, &Principle> = principles.iter().map(|p| (p.id.as_str(), p)).collect();
        conflict
            .principle_ids
            .iter()
            .map(|id| {
                by_id.get(id.as_str()).copied().ok_or_else(|| {
                    QecError::Input(format!("conflict {} references unknown principle {}", conflict.id, id))
                })
            })
            .collect()
    }

    async fn assess(&self, principle: &Principle) -> Result<MemberAnalysis> {
        let distance = self.distance.score(principle).await?;
        let prediction = self.predictor.predict(principle, distance.score).await?;
        self.metrics
            .record(MetricEvent::PrincipleScored {
                principle_id: principle.id.clone(),
            })
            .await?;
        Ok(MemberAnalysis {
            principle_id: principle.id.clone(),
            distance,
            prediction,
        })
    }

    async fn assess_all(&self, members: &[&Principle]) -> Result<Vec<MemberAnalysis>> {
        let mut analyses = Vec::with_capacity(members.len());
        for principle in members {
            analyses.push(self.assess(principle).await?);
        }
        Ok(analyses)
    }

    /// Analyze a conflict: distances, predictions, priority and validation
    /// scenarios. Records member distances on the conflict.
    ///
    /// Malformed input is an error. A disabled engine or a failing component
    /// yields a flagged not-enhanced analysis instead.
    pub async fn analyze_conflict(
        &self,
        conflict: &mut Conflict,
        principles: &[Principle],
    ) -> Result<ConflictAnalysis> {
        let members = self.members(conflict, principles)?;
        if !self.is_enabled() {
            return Ok(ConflictAnalysis::not_enhanced(&conflict.id, "engine disabled", None));
        }

        let analyses = match self.assess_all(&members).await {
            Ok(analyses) => analyses,
            Err(e @ QecError::Input(_)) => return Err(e),
            Err(e) => {
                warn!(conflict_id = %conflict.id, component = %e.component(), error = %e, "Analysis degraded");
                return Ok(ConflictAnalysis::not_enhanced(&conflict.id, e.to_string(), Some(e.component())));
            }
        };

        let average = conflict.record_distances(
            analyses
                .iter()
                .map(|a| MemberDistance {
                    principle_id: a.principle_id.clone(),
                    distance: a.distance.score,
                })
                .collect(),
        )?;

        let riskiest = analyses
            .iter()
            .max_by(|a, b| a.prediction.overall_risk.total_cmp(&b.prediction.overall_risk));
        let max_risk = riskiest.map(|a| a.prediction.overall_risk).unwrap_or(0.0);
        let priority = priority_score(average, max_risk, conflict.severity.weight());

        let analysis = ConflictAnalysis {
            conflict_id: conflict.id.clone(),
            enhanced: true,
            degraded_reason: None,
            failed_component: None,
            average_distance: Some(average),
            primary_category: riskiest.map(|a| a.prediction.primary_category),
            recommended_strategy: riskiest.map(|a| a.prediction.recommended_strategy),
            priority: Some(priority),
            degraded_prediction: analyses.iter().any(|a| a.prediction.degraded),
            validation_scenarios: members.iter().flat_map(|p| translate_criteria(p)).collect(),
            members: analyses,
            analyzed_at: Utc::now(),
        };

        info!(
            conflict_id = %analysis.conflict_id,
            average_distance = average,
            max_risk,
            priority,
            strategy = ?analysis.recommended_strategy,
            "Conflict analyzed"
        );
        Ok(analysis)
    }

    /// Generate a patch for the riskiest member of a conflict.
    ///
    /// The recovery outcome is appended to history, logged for predictor
    /// training and fed into fidelity metrics. The conflict is marked
    /// patched or escalated accordingly.
    pub async fn generate_patch(&self, conflict: &mut Conflict, principles: &[Principle]) -> Result<PatchResult> {
        let started = Instant::now();
        let members = self.members(conflict, principles)?;
        if !self.is_enabled() {
            return Ok(PatchResult::not_enhanced(&conflict.id, "engine disabled", None));
        }

        let analyses = match self.assess_all(&members).await {
            Ok(analyses) => analyses,
            Err(e @ QecError::Input(_)) => return Err(e),
            Err(e) => {
                warn!(conflict_id = %conflict.id, component = %e.component(), error = %e, "Patch generation degraded");
                return Ok(PatchResult::not_enhanced(&conflict.id, e.to_string(), Some(e.component())));
            }
        };

        let Some((target, analysis)) = members
            .iter()
            .zip(analyses)
            .max_by(|(_, a), (_, b)| a.prediction.overall_risk.total_cmp(&b.prediction.overall_risk))
        else {
            return Err(QecError::Input(format!("conflict {} has no members", conflict.id)));
        };

        let request = RecoveryRequest {
            conflict_id: conflict.id.clone(),
            principle: (*target).clone(),
            prediction: analysis.prediction.clone(),
            tests: translate_criteria(target),
        };
        let result = match self.dispatcher.dispatch(request).await {
            Ok(result) => result,
            Err(e @ QecError::Input(_)) => return Err(e),
            Err(e) => {
                warn!(conflict_id = %conflict.id, error = %e, "Recovery unavailable, patch not enhanced");
                return Ok(PatchResult::not_enhanced(&conflict.id, e.to_string(), Some(Component::Recovery)));
            }
        };
        self.record_recovery(conflict, target, &analysis, &result).await;

        Ok(PatchResult {
            conflict_id: conflict.id.clone(),
            enhanced: true,
            degraded_reason: None,
            failed_component: None,
            success: result.succeeded(),
            principle_id: Some(target.id.clone()),
            strategy_used: result.strategy_used,
            confidence: result.confidence,
            patch: result.patch,
            generation_ms: started.elapsed().as_millis() as u64,
            escalation: result.escalation,
        })
    }

    async fn record_recovery(
        &self,
        conflict: &mut Conflict,
        principle: &Principle,
        analysis: &MemberAnalysis,
        result: &RecoveryResult,
    ) {
        let success = result.succeeded();
        let category = analysis.prediction.primary_category;

        let mut outcome = SynthesisOutcome::new(&principle.id, success).with_conflict(&conflict.id);
        if let Some(strategy) = result.strategy_used {
            outcome = outcome.with_recovery(category, strategy);
        }
        if let Err(e) = self.history.append(outcome).await {
            warn!(principle_id = %principle.id, error = %e, "Failed to append synthesis outcome");
        }
        // New history changes the success-rate input of the score
        self.distance.invalidate(&principle.id);

        let failures = if success { Vec::new() } else { vec![category] };
        self.predictor
            .record_outcome(principle, analysis.distance.score, failures)
            .await;

        for event in [
            MetricEvent::RecoveryOutcome {
                success,
                elapsed_ms: result.elapsed_ms,
            },
            MetricEvent::Decision,
        ] {
            if let Err(e) = self.metrics.record(event).await {
                warn!(error = %e, "Failed to record metric event");
            }
        }

        if success {
            conflict.attach_patch(&result.run_id);
        } else {
            conflict.escalate();
        }
    }

    /// Current fidelity. Runs a cycle on demand when none has run yet.
    pub async fn current_fidelity(&self) -> Result<FidelityStatus> {
        if let Some(status) = self.monitor.current().await {
            return Ok(status);
        }
        self.monitor.run_cycle().await?;
        self.monitor
            .current()
            .await
            .ok_or_else(|| QecError::AggregationDataMissing(vec!["snapshot".to_string()]))
    }

    /// Fidelity snapshots from the last `hours`.
    pub async fn fidelity_history(&self, hours: u64, limit: usize) -> FidelityHistory {
        self.monitor.history(hours, limit).await
    }

    /// Start the fidelity cycle. Admin only.
    pub async fn start_monitoring(&self, actor: &Actor) -> Result<()> {
        actor.require_admin("start_monitoring")?;
        info!(actor = %actor.id, "Monitoring start requested");
        self.monitor.start().await;
        Ok(())
    }

    /// Stop the fidelity cycle. Admin only.
    pub async fn stop_monitoring(&self, actor: &Actor) -> Result<()> {
        actor.require_admin("stop_monitoring")?;
        info!(actor = %actor.id, "Monitoring stop requested");
        self.monitor.stop().await;
        Ok(())
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    /// Add principles to fidelity coverage.
    pub async fn register_principles(&self, principles: &[Principle]) {
        self.metrics
            .register_principles(principles.iter().map(|p| p.id.clone()))
            .await;
    }

    /// Record an enforcement check of a synthesized rule.
    pub async fn record_enforcement(&self, success: bool) -> Result<()> {
        self.metrics.record(MetricEvent::Enforcement { success }).await
    }

    /// Record a stakeholder rating (0.0 - 1.0).
    pub async fn record_rating(&self, score: f64) -> Result<()> {
        self.metrics.record(MetricEvent::Rating { score }).await
    }

    /// Record an appeal against a decision.
    pub async fn record_appeal(&self) -> Result<()> {
        self.metrics.record(MetricEvent::Appeal).await
    }

    /// Escalations awaiting human review.
    pub async fn pending_escalations(&self) -> Vec<EscalationRecord> {
        self.dispatcher.pending_escalations().await
    }

    pub fn dispatcher(&self) -> &RecoveryDispatcher {
        &self.dispatcher
    }

    pub fn predictor(&self) -> &ErrorPredictor {
        &self.predictor
    }

    pub fn distance(&self) -> &DistanceCalculator {
        &self.distance
    }

    pub fn store(&self) -> Arc<EngineStore> {
        self.store.clone()
    }

    /// Stop monitoring, cancel recovery work and clear cached state.
    pub async fn shutdown(&self) {
        info!(engine_id = %self.id(), "Shutting down QEC engine");
        self.monitor.stop().await;
        self.dispatcher.shutdown();
        self.store.clear().await;
    }
}
