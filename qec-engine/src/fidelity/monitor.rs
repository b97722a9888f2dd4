//! Periodic fidelity aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::alerts::{Alert, AlertManager};
use super::components::*;
use super::source::MetricsSource;
use crate::config::{FidelityConfig, FidelityWeights};
use crate::types::{QecError, Result};

/// Trend of the composite over a history window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

/// Composite change between history halves that counts as a trend.
const TREND_DELTA: f64 = 0.02;

/// Scheduler bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickState {
    pub last_tick: Option<DateTime<Utc>>,
    pub next_tick: Option<DateTime<Utc>>,
    pub cycle_count: u64,
}

/// Latest snapshot and its context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FidelityStatus {
    pub snapshot: FidelitySnapshot,
    /// True when the cycle is stopped or the snapshot is older than the
    /// staleness bound
    pub stale: bool,
    pub running: bool,
    pub active_alerts: Vec<Alert>,
    pub tick: TickState,
}

/// Rollup over a history query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FidelitySummary {
    pub count: usize,
    pub average: Option<f64>,
    pub trend: Trend,
    pub alert_count: usize,
}

/// Snapshots in a trailing window plus their rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FidelityHistory {
    /// Oldest first
    pub snapshots: Vec<FidelitySnapshot>,
    pub summary: FidelitySummary,
}

/// Aggregates component readings into snapshots on a fixed interval.
pub struct FidelityMonitor {
    config: FidelityConfig,
    weights: FidelityWeights,
    interval: Duration,
    source: Arc<dyn MetricsSource>,
    snapshots: Arc<RwLock<VecDeque<FidelitySnapshot>>>,
    last_known: Arc<RwLock<[Option<f64>; COMPONENT_COUNT]>>,
    alerts: AlertManager,
    tick: Arc<RwLock<TickState>>,
    /// Serializes cycles so snapshots and alert state advance together
    cycle_lock: Mutex<()>,
    running: AtomicBool,
    stop_tx: Mutex<Option<broadcast::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FidelityMonitor {
    /// Create a stopped monitor. Weights are normalized once here.
    pub fn new(config: FidelityConfig, source: Arc<dyn MetricsSource>) -> Result<Self> {
        let weights = config.weights.normalized()?;
        if config.interval_secs == 0 {
            return Err(QecError::Config("fidelity interval must be positive".to_string()));
        }
        if config.max_snapshots == 0 {
            return Err(QecError::Config("fidelity must retain at least one snapshot".to_string()));
        }
        Ok(Self {
            weights,
            interval: config.interval(),
            source,
            snapshots: Arc::new(RwLock::new(VecDeque::new())),
            last_known: Arc::new(RwLock::new([None; COMPONENT_COUNT])),
            alerts: AlertManager::new(config.green_threshold, config.amber_threshold, config.alert_capacity),
            tick: Arc::new(RwLock::new(TickState::default())),
            cycle_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
            config,
        })
    }

    /// Override the cycle interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the background cycle. The first cycle runs immediately.
    /// Starting a running monitor is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut stop_tx = self.stop_tx.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Fidelity monitor already running");
            return;
        }

        let (tx, mut rx) = broadcast::channel(1);
        *stop_tx = Some(tx);

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.run_cycle().await {
                            error!(error = %e, "Fidelity cycle failed");
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
            debug!("Fidelity cycle loop exited");
        });
        *self.task.lock().await = Some(handle);

        info!(interval_ms = self.interval.as_millis() as u64, "Fidelity monitor started");
    }

    /// Stop the background cycle. An in-flight cycle finishes first.
    pub async fn stop(&self) {
        let mut stop_tx = self.stop_tx.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Fidelity cycle task ended abnormally");
            }
        }
        self.tick.write().await.next_tick = None;
        info!("Fidelity monitor stopped");
    }

    /// Run one aggregation cycle.
    ///
    /// Components the source cannot provide fall back to their last-known
    /// value (or the configured default) and mark the snapshot partial.
    pub async fn run_cycle(&self) -> Result<FidelitySnapshot> {
        let _cycle = self.cycle_lock.lock().await;
        let window = Duration::from_secs(self.config.window_secs);
        let readings = match self
            .config
            .source_retry
            .run("fidelity.readings", || self.source.readings(window))
            .await
        {
            Ok(readings) => readings,
            Err(e) => {
                warn!(error = %e, "Metric source unavailable; using last-known values");
                Default::default()
            }
        };

        let mut values = [0.0; COMPONENT_COUNT];
        let mut missing = Vec::new();
        {
            let mut last_known = self.last_known.write().await;
            for component in FidelityComponent::all() {
                let i = component.index();
                match readings.get(component).filter(|v| v.is_finite()) {
                    Some(v) => {
                        values[i] = v.clamp(0.0, 1.0);
                        last_known[i] = Some(values[i]);
                    }
                    None => {
                        values[i] = last_known[i].unwrap_or(self.config.missing_default);
                        missing.push(component);
                    }
                }
            }
        }

        if !missing.is_empty() {
            let e = QecError::AggregationDataMissing(missing.iter().map(|c| c.to_string()).collect());
            warn!(error = %e, "Fidelity snapshot is partial");
        }

        let components = FidelityComponents::from_array(values);
        let composite = components.composite(&self.weights);
        let now = Utc::now();

        let cycle = {
            let mut tick = self.tick.write().await;
            tick.cycle_count += 1;
            tick.last_tick = Some(now);
            tick.next_tick = self
                .is_running()
                .then(|| chrono::Duration::from_std(self.interval).ok())
                .flatten()
                .map(|interval| now + interval);
            tick.cycle_count
        };

        let snapshot = {
            let mut snapshots = self.snapshots.write().await;
            let previous = snapshots.back().map(|s| s.level);
            let level = classify_with_hysteresis(
                previous,
                composite,
                self.config.green_threshold,
                self.config.amber_threshold,
                self.config.hysteresis,
            );
            let snapshot = FidelitySnapshot {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: now,
                components,
                composite,
                level,
                weights: self.weights,
                partial: !missing.is_empty(),
                missing,
                cycle,
            };

            snapshots.push_back(snapshot.clone());
            let cutoff = now - chrono::Duration::hours(self.config.retention_hours.min(i32::MAX as u64) as i64);
            while snapshots
                .front()
                .map_or(false, |s| s.timestamp < cutoff || snapshots.len() > self.config.max_snapshots)
            {
                snapshots.pop_front();
            }
            snapshot
        };

        self.alerts.observe(&snapshot).await;

        info!(
            cycle,
            composite = snapshot.composite,
            level = %snapshot.level,
            partial = snapshot.partial,
            "Fidelity cycle complete"
        );
        Ok(snapshot)
    }

    /// Last snapshot, if any cycle has run.
    pub async fn current(&self) -> Option<FidelityStatus> {
        let snapshot = self.snapshots.read().await.back().cloned()?;
        let running = self.is_running();
        let age = (Utc::now() - snapshot.timestamp).to_std().unwrap_or_default();
        let bound = self.interval.mul_f64(self.config.staleness_factor.max(1.0));

        Some(FidelityStatus {
            stale: !running || age > bound,
            running,
            active_alerts: self.alerts.active().await,
            tick: self.tick.read().await.clone(),
            snapshot,
        })
    }

    /// Snapshots from the last `hours`, newest `limit` of them, oldest first.
    pub async fn history(&self, hours: u64, limit: usize) -> FidelityHistory {
        let since = Utc::now() - chrono::Duration::hours(hours.min(i32::MAX as u64) as i64);
        let snapshots: Vec<FidelitySnapshot> = {
            let all = self.snapshots.read().await;
            let mut recent: Vec<FidelitySnapshot> = all
                .iter()
                .rev()
                .filter(|s| s.timestamp >= since)
                .take(limit)
                .cloned()
                .collect();
            recent.reverse();
            recent
        };

        let composites: Vec<f64> = snapshots.iter().map(|s| s.composite).collect();
        let summary = FidelitySummary {
            count: snapshots.len(),
            average: mean(&composites),
            trend: trend(&composites),
            alert_count: self.alerts.raised_since(since).await,
        };
        FidelityHistory { snapshots, summary }
    }

    /// Scheduler bookkeeping.
    pub async fn tick_state(&self) -> TickState {
        self.tick.read().await.clone()
    }

    /// Most recent alerts, newest first.
    pub async fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerts.recent(limit).await
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Compare the mean of the older half with the newer half.
fn trend(composites: &[f64]) -> Trend {
    if composites.len() < 2 {
        return Trend::Stable;
    }
    let (older, newer) = composites.split_at(composites.len() / 2);
    match (mean(older), mean(newer)) {
        (Some(a), Some(b)) if b - a > TREND_DELTA => Trend::Improving,
        (Some(a), Some(b)) if a - b > TREND_DELTA => Trend::Declining,
        _ => Trend::Stable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fidelity::source::ComponentReadings;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Source returning scripted readings; the last one repeats.
    struct ScriptedSource {
        script: std::sync::Mutex<VecDeque<ComponentReadings>>,
        last: std::sync::Mutex<ComponentReadings>,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(script: Vec<ComponentReadings>) -> Self {
            Self {
                script: std::sync::Mutex::new(script.into()),
                last: std::sync::Mutex::new(ComponentReadings::default()),
                failures_left: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            }
        }

        fn failing_first(self, n: u32) -> Self {
            self.failures_left.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedSource {
        async fn readings(&self, _window: Duration) -> Result<ComponentReadings> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(QecError::Collaborator {
                    component: crate::types::Component::Fidelity,
                    message: "metrics store unreachable".to_string(),
                });
            }
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                *last = next;
            }
            Ok(*last)
        }
    }

    fn uniform(value: f64) -> ComponentReadings {
        FidelityComponent::all()
            .into_iter()
            .fold(ComponentReadings::default(), |r, c| r.with(c, value))
    }

    fn config() -> FidelityConfig {
        FidelityConfig {
            source_retry: crate::retry::RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_composite_and_level() {
        let source = Arc::new(ScriptedSource::new(vec![uniform(0.9)]));
        let monitor = FidelityMonitor::new(config(), source).unwrap();

        let snapshot = monitor.run_cycle().await.unwrap();
        assert!((snapshot.composite - 0.9).abs() < 1e-9);
        assert_eq!(snapshot.level, FidelityLevel::Green);
        assert!(!snapshot.partial);
        assert_eq!(snapshot.cycle, 1);

        let status = monitor.current().await.unwrap();
        assert!(status.stale, "stopped monitor reports stale snapshots");
        assert!(status.active_alerts.is_empty());
    }

    #[tokio::test]
    async fn test_missing_component_uses_last_known_value() {
        let partial = uniform(0.9);
        let mut partial_missing = ComponentReadings::default();
        for c in FidelityComponent::all().into_iter().skip(1) {
            partial_missing.set(c, 0.9);
        }
        let source = Arc::new(ScriptedSource::new(vec![
            partial.with(FidelityComponent::PrincipleCoverage, 0.4),
            partial_missing,
        ]));
        let monitor = FidelityMonitor::new(config(), source).unwrap();

        monitor.run_cycle().await.unwrap();
        let snapshot = monitor.run_cycle().await.unwrap();
        assert!(snapshot.partial);
        assert_eq!(snapshot.missing, vec![FidelityComponent::PrincipleCoverage]);
        assert_eq!(snapshot.components.principle_coverage, 0.4);
    }

    #[tokio::test]
    async fn test_never_seen_component_uses_default() {
        let source = Arc::new(ScriptedSource::new(vec![ComponentReadings::default()]));
        let monitor = FidelityMonitor::new(config(), source).unwrap();

        let snapshot = monitor.run_cycle().await.unwrap();
        assert_eq!(snapshot.missing.len(), COMPONENT_COUNT);
        assert!((snapshot.composite - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.level, FidelityLevel::Red);
        assert_eq!(monitor.current().await.unwrap().active_alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_source_failure_is_retried() {
        let source = Arc::new(ScriptedSource::new(vec![uniform(0.8)]).failing_first(2));
        let monitor = FidelityMonitor::new(config(), source.clone()).unwrap();

        let snapshot = monitor.run_cycle().await.unwrap();
        assert!(!snapshot.partial);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_history_summary() {
        let source = Arc::new(ScriptedSource::new(vec![
            uniform(0.6),
            uniform(0.65),
            uniform(0.9),
            uniform(0.95),
        ]));
        let monitor = FidelityMonitor::new(config(), source).unwrap();
        for _ in 0..4 {
            monitor.run_cycle().await.unwrap();
        }

        let history = monitor.history(24, 100).await;
        assert_eq!(history.summary.count, 4);
        assert_eq!(history.summary.trend, Trend::Improving);
        assert!((history.summary.average.unwrap() - 0.775).abs() < 1e-9);
        // Red at first; green clears it without raising
        assert_eq!(history.summary.alert_count, 1);
        assert!(history.snapshots.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let limited = monitor.history(24, 2).await;
        assert_eq!(limited.snapshots.len(), 2);
        assert_eq!(limited.snapshots[1].cycle, 4);
        assert_eq!(limited.summary.trend, Trend::Improving);
    }

    #[tokio::test]
    async fn test_snapshot_retention() {
        let source = Arc::new(ScriptedSource::new(vec![uniform(0.9)]));
        let mut config = config();
        config.max_snapshots = 3;
        let monitor = FidelityMonitor::new(config, source).unwrap();
        for _ in 0..5 {
            monitor.run_cycle().await.unwrap();
        }

        let history = monitor.history(24, 100).await;
        assert_eq!(history.snapshots.len(), 3);
        assert_eq!(history.snapshots[0].cycle, 3);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let source = Arc::new(ScriptedSource::new(vec![uniform(0.9)]));
        let monitor = Arc::new(
            FidelityMonitor::new(config(), source)
                .unwrap()
                .with_interval(Duration::from_millis(20)),
        );

        monitor.start().await;
        monitor.start().await;
        assert!(monitor.is_running());
        tokio::time::sleep(Duration::from_millis(70)).await;

        let status = monitor.current().await.unwrap();
        assert!(!status.stale);
        assert!(status.tick.next_tick.is_some());

        monitor.stop().await;
        assert!(!monitor.is_running());
        let cycles = monitor.tick_state().await.cycle_count;
        assert!(cycles >= 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let tick = monitor.tick_state().await;
        assert_eq!(tick.cycle_count, cycles);
        assert!(tick.next_tick.is_none());
        assert!(monitor.current().await.unwrap().stale);
    }

    #[test]
    fn test_rejects_zero_interval_and_retention() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        let mut zero_interval = config();
        zero_interval.interval_secs = 0;
        assert!(FidelityMonitor::new(zero_interval, source.clone()).is_err());

        let mut zero_retention = config();
        zero_retention.max_snapshots = 0;
        assert!(FidelityMonitor::new(zero_retention, source).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cycles_keep_alerts_in_step() {
        // Every cycle flips between green and red
        let script = (0..10).map(|i| uniform(if i % 2 == 0 { 0.95 } else { 0.5 })).collect();
        let monitor = Arc::new(FidelityMonitor::new(config(), Arc::new(ScriptedSource::new(script))).unwrap());

        let cycles = (0..10).map(|_| {
            let monitor = monitor.clone();
            async move { monitor.run_cycle().await }
        });
        for result in futures::future::join_all(cycles).await {
            result.unwrap();
        }

        let history = monitor.history(1, 10).await;
        let order: Vec<u64> = history.snapshots.iter().map(|s| s.cycle).collect();
        assert_eq!(order, (1..=10).collect::<Vec<u64>>());

        let last = history.snapshots.last().unwrap();
        assert_eq!(last.level, FidelityLevel::Red);
        let active = monitor.current().await.unwrap().active_alerts;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].snapshot_id, last.id);
        assert_eq!(active[0].level, FidelityLevel::Red);
    }
}
