//! Recovery Dispatcher.
//!
//! Drives one state machine per failure event:
//!
//! ```text
//! Pending -> StrategySelected -> Applying -> Succeeded
//!                  ^                |   \--> Escalated
//!                  |                v
//!                  +---(fallback)-- Failed --> Escalated
//! ```
//!
//! Runs for the same conflict are serialized; different conflicts run in
//! parallel. Every transition and every attempt is appended to the recovery
//! log.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use qec_synthesis::SynthesisBackend;

use super::adaptive::AdaptiveTracker;
use super::state::*;
use super::strategy::{AttemptOutcome, RecoveryContext, StrategyTable};
use crate::config::RecoveryConfig;
use crate::distance::AmbiguityScorer;
use crate::types::{FailureCategory, QecError, RecoveryStrategy, Result};

/// Identity of a run, shared by all its log entries.
struct Run<'a> {
    id: String,
    request: &'a RecoveryRequest,
    category: FailureCategory,
    state: RecoveryState,
}

/// Feedback carried between attempts and across the fallback hop.
#[derive(Default)]
struct Feedback {
    patch: Option<String>,
    failures: Vec<String>,
}

/// How applying one strategy ended.
enum Applied {
    Success { patch: String, confidence: f64, attempts: u32 },
    Escalate { reason: String, attempts: u32 },
    Exhausted { attempts: u32, error: QecError },
    Cancelled { attempts: u32 },
}

/// Selects, applies and records recovery strategies.
pub struct RecoveryDispatcher {
    config: RecoveryConfig,
    table: Arc<StrategyTable>,
    backend: Arc<dyn SynthesisBackend>,
    adaptive: Arc<AdaptiveTracker>,
    scorer: Arc<AmbiguityScorer>,
    conflict_locks: DashMap<String, Arc<Mutex<()>>>,
    attempts: Arc<RwLock<VecDeque<RecoveryAttempt>>>,
    escalations: Arc<RwLock<VecDeque<EscalationRecord>>>,
    last_good: DashMap<String, String>,
    runs: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    escalated: AtomicU64,
    total_elapsed_ms: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    shut_down: AtomicBool,
}

impl RecoveryDispatcher {
    /// Create a dispatcher.
    pub fn new(
        config: RecoveryConfig,
        table: Arc<StrategyTable>,
        backend: Arc<dyn SynthesisBackend>,
        adaptive: Arc<AdaptiveTracker>,
        scorer: Arc<AmbiguityScorer>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            table,
            backend,
            adaptive,
            scorer,
            conflict_locks: DashMap::new(),
            attempts: Arc::new(RwLock::new(VecDeque::new())),
            escalations: Arc::new(RwLock::new(VecDeque::new())),
            last_good: DashMap::new(),
            runs: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            escalated: AtomicU64::new(0),
            total_elapsed_ms: AtomicU64::new(0),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Run recovery for a failure event.
    ///
    /// Returns `Ok` for both `Succeeded` and `Escalated` runs. A run
    /// interrupted by [`shutdown`](Self::shutdown) returns
    /// `QecError::Cancelled` after logging the interrupted attempt.
    pub async fn dispatch(&self, request: RecoveryRequest) -> Result<RecoveryResult> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(QecError::Cancelled("recovery dispatcher is shut down".to_string()));
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let conflict_id = request.conflict_id.clone();
        let lock = self.conflict_locks.entry(conflict_id.clone()).or_default().value().clone();
        let result = {
            let _guard = lock.lock().await;
            self.run(request, &mut shutdown_rx).await
        };
        drop(lock);
        // Only the map still holds an idle lock
        self.conflict_locks
            .remove_if(&conflict_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of conflicts with a run in flight or waiting.
    pub fn active_conflicts(&self) -> usize {
        self.conflict_locks.len()
    }

    async fn run(
        &self,
        request: RecoveryRequest,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<RecoveryResult> {
        let started = Instant::now();
        let mut run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            request: &request,
            category: request.prediction.primary_category,
            state: RecoveryState::Pending,
        };
        info!(
            run_id = %run.id,
            conflict_id = %request.conflict_id,
            principle_id = %request.principle.id,
            category = %run.category,
            "Starting recovery"
        );

        let recommended = request.prediction.recommended_strategy;
        let (mut strategy, overridden) = self.select(run.category, recommended).await;
        let mut tried = Vec::new();
        let mut total_attempts = 0;
        let mut feedback = Feedback::default();
        let mut hopped = false;

        loop {
            self.transition(&mut run, RecoveryState::StrategySelected, Some(strategy), None, None).await;
            tried.push(strategy);
            self.transition(&mut run, RecoveryState::Applying, Some(strategy), None, None).await;

            let applied = self.apply(&run, strategy, &mut feedback, shutdown_rx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match applied {
                Applied::Success { patch, confidence, attempts } => {
                    total_attempts += attempts;
                    self.transition(
                        &mut run,
                        RecoveryState::Succeeded,
                        Some(strategy),
                        Some(AttemptStatus::Success),
                        None,
                    )
                    .await;
                    self.adaptive.record(run.category, strategy, true).await;
                    self.last_good.insert(request.principle.id.clone(), patch.clone());
                    self.finish(&self.succeeded, elapsed_ms);

                    info!(run_id = %run.id, strategy = %strategy, attempts = total_attempts, elapsed_ms, "Recovery succeeded");
                    return Ok(RecoveryResult {
                        run_id: run.id,
                        conflict_id: request.conflict_id.clone(),
                        principle_id: request.principle.id.clone(),
                        final_state: RecoveryState::Succeeded,
                        strategy_used: Some(strategy),
                        strategies_tried: tried,
                        overridden,
                        attempts: total_attempts,
                        patch: Some(patch),
                        confidence,
                        elapsed_ms,
                        escalation: None,
                    });
                }
                Applied::Escalate { reason, attempts } => {
                    total_attempts += attempts;
                    self.adaptive.record(run.category, strategy, false).await;
                    return Ok(self
                        .escalate(&mut run, strategy, tried, overridden, total_attempts, reason, elapsed_ms)
                        .await);
                }
                Applied::Exhausted { attempts, error } => {
                    total_attempts += attempts;
                    self.transition(
                        &mut run,
                        RecoveryState::Failed,
                        Some(strategy),
                        Some(AttemptStatus::Failure),
                        Some(error.to_string()),
                    )
                    .await;
                    self.adaptive.record(run.category, strategy, false).await;

                    match self.table.fallback(run.category) {
                        Some(fallback) if !hopped && !tried.contains(&fallback) => {
                            info!(run_id = %run.id, from = %strategy, to = %fallback, "Falling back");
                            strategy = fallback;
                            hopped = true;
                        }
                        _ => {
                            let reason = format!("{}; no fallback remaining", error);
                            return Ok(self
                                .escalate(&mut run, strategy, tried, overridden, total_attempts, reason, elapsed_ms)
                                .await);
                        }
                    }
                }
                Applied::Cancelled { attempts } => {
                    self.transition(
                        &mut run,
                        RecoveryState::Failed,
                        Some(strategy),
                        Some(AttemptStatus::Failure),
                        Some("cancelled by shutdown".to_string()),
                    )
                    .await;
                    self.finish(&self.failed, elapsed_ms);
                    warn!(run_id = %run.id, attempts = total_attempts + attempts, "Recovery cancelled");
                    return Err(QecError::Cancelled(format!(
                        "recovery run {} for conflict {} was cancelled",
                        run.id, request.conflict_id
                    )));
                }
            }
        }
    }

    /// Recommended strategy, unless adaptive tracking shows a materially
    /// better one for this category.
    async fn select(&self, category: FailureCategory, recommended: RecoveryStrategy) -> (RecoveryStrategy, bool) {
        let alternative = self
            .adaptive
            .best_alternative(
                category,
                recommended,
                self.config.min_samples,
                self.config.override_margin,
                Utc::now(),
            )
            .await;

        match alternative {
            Some(alt) => {
                info!(
                    category = %category,
                    recommended = %recommended,
                    chosen = %alt.strategy,
                    rate = alt.rate,
                    "Adaptive strategy override"
                );
                (alt.strategy, true)
            }
            None => (recommended, false),
        }
    }

    /// Apply one strategy within its attempt and timeout bounds.
    async fn apply(
        &self,
        run: &Run<'_>,
        strategy: RecoveryStrategy,
        feedback: &mut Feedback,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Applied {
        let bounds = self.table.config(strategy, run.category);
        let max_attempts = bounds.max_attempts.max(1);

        let Some(handler) = self.table.handler(strategy) else {
            return Applied::Exhausted {
                attempts: 0,
                error: QecError::Config(format!("no handler registered for {}", strategy)),
            };
        };

        let request = run.request;
        let mut ctx = RecoveryContext {
            conflict_id: request.conflict_id.clone(),
            principle: request.principle.clone(),
            category: run.category,
            tests: request.tests.clone(),
            attempt: 1,
            previous_patch: None,
            previous_failures: Vec::new(),
            last_good_patch: self.last_good_patch(&request.principle.id),
            consensus_samples: self.config.consensus_samples,
            scorer: self.scorer.clone(),
        };

        for attempt in 1..=max_attempts {
            if self.shut_down.load(Ordering::SeqCst) {
                return Applied::Cancelled { attempts: attempt - 1 };
            }
            ctx.attempt = attempt;
            ctx.previous_patch = feedback.patch.clone();
            ctx.previous_failures = feedback.failures.clone();

            let started = Instant::now();
            let result = tokio::select! {
                r = tokio::time::timeout(bounds.timeout(), handler.attempt(&ctx, self.backend.as_ref())) => r,
                _ = shutdown_rx.recv() => {
                    self.log_attempt(run, strategy, attempt, AttemptStatus::Failure, started, Some("cancelled by shutdown".to_string())).await;
                    return Applied::Cancelled { attempts: attempt };
                }
            };

            match result {
                Ok(Ok(AttemptOutcome::Patched { patch, confidence, report })) => {
                    let note = format!("{} tests passed, {} skipped", report.executed, report.skipped);
                    self.log_attempt(run, strategy, attempt, AttemptStatus::Success, started, Some(note)).await;
                    return Applied::Success { patch, confidence, attempts: attempt };
                }
                Ok(Ok(AttemptOutcome::Escalate { reason })) => {
                    self.log_attempt(run, strategy, attempt, AttemptStatus::Escalated, started, Some(reason.clone())).await;
                    return Applied::Escalate { reason, attempts: attempt };
                }
                Ok(Ok(AttemptOutcome::Rejected { patch, failures })) => {
                    debug!(run_id = %run.id, strategy = %strategy, attempt, failures = failures.len(), "Patch rejected");
                    self.log_attempt(run, strategy, attempt, AttemptStatus::Failure, started, Some(failures.join("; "))).await;
                    if patch.is_some() {
                        feedback.patch = patch;
                    }
                    feedback.failures = failures;
                }
                Ok(Err(e)) => {
                    warn!(run_id = %run.id, strategy = %strategy, attempt, error = %e, "Strategy attempt failed");
                    self.log_attempt(run, strategy, attempt, AttemptStatus::Failure, started, Some(e.to_string())).await;
                }
                Err(_) => {
                    let e = QecError::StrategyTimeout {
                        strategy,
                        timeout_ms: bounds.timeout_ms,
                    };
                    warn!(run_id = %run.id, strategy = %strategy, attempt, "Strategy attempt timed out");
                    self.log_attempt(run, strategy, attempt, AttemptStatus::Failure, started, Some(e.to_string())).await;
                }
            }

            if attempt < max_attempts && bounds.backoff_ms > 0 {
                let delay = Duration::from_millis(bounds.backoff_ms * attempt as u64);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => return Applied::Cancelled { attempts: attempt },
                }
            }
        }

        Applied::Exhausted {
            attempts: max_attempts,
            error: QecError::StrategyExhausted {
                strategy,
                attempts: max_attempts,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn escalate(
        &self,
        run: &mut Run<'_>,
        strategy: RecoveryStrategy,
        tried: Vec<RecoveryStrategy>,
        overridden: bool,
        attempts: u32,
        reason: String,
        elapsed_ms: u64,
    ) -> RecoveryResult {
        self.transition(
            run,
            RecoveryState::Escalated,
            Some(strategy),
            Some(AttemptStatus::Escalated),
            Some(reason.clone()),
        )
        .await;

        let request = run.request;
        let record = EscalationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            conflict_id: request.conflict_id.clone(),
            principle_id: request.principle.id.clone(),
            category: run.category,
            strategies_tried: tried.clone(),
            attempts,
            reason,
            prediction_id: request.prediction.id.clone(),
            acknowledged: false,
            created_at: Utc::now(),
        };

        {
            let mut escalations = self.escalations.write().await;
            escalations.push_back(record.clone());
            while escalations.len() > self.config.escalation_capacity {
                escalations.pop_front();
            }
        }
        self.finish(&self.escalated, elapsed_ms);

        warn!(
            run_id = %run.id,
            escalation_id = %record.id,
            conflict_id = %record.conflict_id,
            category = %record.category,
            strategies = ?record.strategies_tried,
            reason = %record.reason,
            "Recovery escalated for human review"
        );

        RecoveryResult {
            run_id: run.id.clone(),
            conflict_id: request.conflict_id.clone(),
            principle_id: request.principle.id.clone(),
            final_state: RecoveryState::Escalated,
            strategy_used: Some(strategy),
            strategies_tried: tried,
            overridden,
            attempts,
            patch: None,
            confidence: 0.0,
            elapsed_ms,
            escalation: Some(record),
        }
    }

    async fn transition(
        &self,
        run: &mut Run<'_>,
        to: RecoveryState,
        strategy: Option<RecoveryStrategy>,
        outcome: Option<AttemptStatus>,
        note: Option<String>,
    ) {
        debug_assert!(run.state.can_transition(to), "{:?} -> {:?}", run.state, to);
        debug!(run_id = %run.id, from = ?run.state, to = ?to, strategy = ?strategy, "Recovery transition");

        let entry = self.entry(run, strategy, run.state, to, 0, outcome, 0, note);
        run.state = to;
        self.append(entry).await;
    }

    async fn log_attempt(
        &self,
        run: &Run<'_>,
        strategy: RecoveryStrategy,
        attempt: u32,
        outcome: AttemptStatus,
        started: Instant,
        note: Option<String>,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let entry = self.entry(
            run,
            Some(strategy),
            RecoveryState::Applying,
            RecoveryState::Applying,
            attempt,
            Some(outcome),
            elapsed_ms,
            note,
        );
        self.append(entry).await;
    }

    #[allow(clippy::too_many_arguments)]
    fn entry(
        &self,
        run: &Run<'_>,
        strategy: Option<RecoveryStrategy>,
        from: RecoveryState,
        to: RecoveryState,
        attempt: u32,
        outcome: Option<AttemptStatus>,
        elapsed_ms: u64,
        note: Option<String>,
    ) -> RecoveryAttempt {
        RecoveryAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            conflict_id: run.request.conflict_id.clone(),
            principle_id: run.request.principle.id.clone(),
            category: run.category,
            strategy,
            from,
            to,
            attempt,
            outcome,
            elapsed_ms,
            prediction_id: run.request.prediction.id.clone(),
            note,
            recorded_at: Utc::now(),
        }
    }

    async fn append(&self, entry: RecoveryAttempt) {
        let mut attempts = self.attempts.write().await;
        attempts.push_back(entry);
        while attempts.len() > self.config.attempt_log_capacity {
            attempts.pop_front();
        }
    }

    fn finish(&self, counter: &AtomicU64, elapsed_ms: u64) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_elapsed_ms.fetch_add(elapsed_ms, Ordering::SeqCst);
    }

    /// Log entries for a conflict, oldest first.
    pub async fn attempts_for(&self, conflict_id: &str) -> Vec<RecoveryAttempt> {
        let attempts = self.attempts.read().await;
        attempts
            .iter()
            .filter(|a| a.conflict_id == conflict_id)
            .cloned()
            .collect()
    }

    /// Most recent log entries, newest first.
    pub async fn recent_attempts(&self, limit: usize) -> Vec<RecoveryAttempt> {
        let attempts = self.attempts.read().await;
        attempts.iter().rev().take(limit).cloned().collect()
    }

    /// Escalations not yet acknowledged.
    pub async fn pending_escalations(&self) -> Vec<EscalationRecord> {
        let escalations = self.escalations.read().await;
        escalations.iter().filter(|e| !e.acknowledged).cloned().collect()
    }

    /// Mark an escalation as picked up by a reviewer.
    pub async fn acknowledge_escalation(&self, escalation_id: &str) -> bool {
        let mut escalations = self.escalations.write().await;
        match escalations.iter_mut().find(|e| e.id == escalation_id) {
            Some(record) => {
                record.acknowledged = true;
                info!(escalation_id = %escalation_id, "Escalation acknowledged");
                true
            }
            None => false,
        }
    }

    /// Last patch that validated for a principle.
    pub fn last_good_patch(&self, principle_id: &str) -> Option<String> {
        self.last_good.get(principle_id).map(|p| p.value().clone())
    }

    /// Remember a known-good patch for rollback.
    pub fn remember_good_patch(&self, principle_id: impl Into<String>, patch: impl Into<String>) {
        self.last_good.insert(principle_id.into(), patch.into());
    }

    /// Dispatcher statistics.
    pub fn stats(&self) -> DispatcherStats {
        let runs = self.runs.load(Ordering::SeqCst);
        DispatcherStats {
            runs,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            escalated: self.escalated.load(Ordering::SeqCst),
            avg_elapsed_ms: if runs > 0 {
                self.total_elapsed_ms.load(Ordering::SeqCst) / runs
            } else {
                0
            },
        }
    }

    /// Cancel in-flight attempts and refuse new runs.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(());
            info!("Recovery dispatcher shut down");
        }
    }
}
