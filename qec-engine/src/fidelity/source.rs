//! Metric sources for the fidelity cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::trace;

use super::components::{FidelityComponent, COMPONENT_COUNT};
use crate::types::{QecError, Result};

/// Per-component readings over a trailing window. `None` means no data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentReadings {
    values: [Option<f64>; COMPONENT_COUNT],
}

impl ComponentReadings {
    pub fn get(&self, component: FidelityComponent) -> Option<f64> {
        self.values[component.index()]
    }

    pub fn set(&mut self, component: FidelityComponent, value: f64) {
        self.values[component.index()] = Some(value);
    }

    pub fn with(mut self, component: FidelityComponent, value: f64) -> Self {
        self.set(component, value);
        self
    }

    /// Components without a reading.
    pub fn missing(&self) -> Vec<FidelityComponent> {
        FidelityComponent::all()
            .into_iter()
            .filter(|c| self.get(*c).is_none())
            .collect()
    }
}

/// Source of fidelity component readings.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Readings over the trailing `window`.
    async fn readings(&self, window: Duration) -> Result<ComponentReadings>;
}

/// Event fed into the recorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricEvent {
    /// A principle's distance score was computed
    PrincipleScored { principle_id: String },
    /// A recovery run finished
    RecoveryOutcome { success: bool, elapsed_ms: u64 },
    /// A synthesized rule was enforced
    Enforcement { success: bool },
    /// A stakeholder rated an outcome (0.0 - 1.0)
    Rating { score: f64 },
    /// A decision was appealed
    Appeal,
    /// A decision was made
    Decision,
}

/// In-memory event log that derives component readings.
pub struct MetricsRecorder {
    adaptation_target: Duration,
    capacity: usize,
    registered: Arc<RwLock<HashSet<String>>>,
    events: Arc<RwLock<VecDeque<(DateTime<Utc>, MetricEvent)>>>,
}

impl MetricsRecorder {
    /// Default number of retained events.
    pub const DEFAULT_CAPACITY: usize = 50_000;

    /// Create a recorder. Recoveries taking `adaptation_target` or longer
    /// score zero adaptation speed.
    pub fn new(adaptation_target: Duration) -> Self {
        Self {
            adaptation_target,
            capacity: Self::DEFAULT_CAPACITY,
            registered: Arc::new(RwLock::new(HashSet::new())),
            events: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Add principles to the coverage denominator.
    pub async fn register_principles<I, S>(&self, principle_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registered = self.registered.write().await;
        registered.extend(principle_ids.into_iter().map(Into::into));
    }

    /// Record an event now.
    pub async fn record(&self, event: MetricEvent) -> Result<()> {
        self.record_at(event, Utc::now()).await
    }

    /// Record an event at `at`.
    pub async fn record_at(&self, event: MetricEvent, at: DateTime<Utc>) -> Result<()> {
        match &event {
            MetricEvent::Rating { score } if !(0.0..=1.0).contains(score) => {
                return Err(QecError::Input(format!("rating {} outside [0, 1]", score)));
            }
            MetricEvent::PrincipleScored { principle_id } => {
                self.registered.write().await.insert(principle_id.clone());
            }
            _ => {}
        }

        trace!(event = ?event, "Recorded metric event");
        let mut events = self.events.write().await;
        events.push_back((at, event));
        while events.len() > self.capacity {
            events.pop_front();
        }
        Ok(())
    }

    /// Number of retained events.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    fn ratio(hits: usize, total: usize) -> Option<f64> {
        (total > 0).then(|| hits as f64 / total as f64)
    }

    /// Readings over the `window` ending at `now`.
    pub async fn readings_at(&self, window: Duration, now: DateTime<Utc>) -> ComponentReadings {
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let target_ms = self.adaptation_target.as_millis().max(1) as f64;

        let mut scored = HashSet::new();
        let (mut recoveries, mut recovered) = (0, 0);
        let mut speed_sum = 0.0;
        let (mut enforcements, mut enforced) = (0, 0);
        let (mut ratings, mut rating_sum) = (0, 0.0);
        let (mut appeals, mut decisions) = (0, 0);

        let events = self.events.read().await;
        for (_, event) in events.iter().filter(|(at, _)| *at >= since && *at <= now) {
            match event {
                MetricEvent::PrincipleScored { principle_id } => {
                    scored.insert(principle_id.as_str());
                }
                MetricEvent::RecoveryOutcome { success, elapsed_ms } => {
                    recoveries += 1;
                    if *success {
                        recovered += 1;
                        speed_sum += (1.0 - *elapsed_ms as f64 / target_ms).max(0.0);
                    }
                }
                MetricEvent::Enforcement { success } => {
                    enforcements += 1;
                    if *success {
                        enforced += 1;
                    }
                }
                MetricEvent::Rating { score } => {
                    ratings += 1;
                    rating_sum += score;
                }
                MetricEvent::Appeal => appeals += 1,
                MetricEvent::Decision => decisions += 1,
            }
        }

        let registered = self.registered.read().await.len();
        let mut readings = ComponentReadings::default();
        let values = [
            (FidelityComponent::PrincipleCoverage, Self::ratio(scored.len(), registered)),
            (FidelityComponent::SynthesisSuccess, Self::ratio(recovered, recoveries)),
            (FidelityComponent::EnforcementReliability, Self::ratio(enforced, enforcements)),
            (
                FidelityComponent::AdaptationSpeed,
                (recoveries > 0).then(|| speed_sum / recoveries as f64),
            ),
            (
                FidelityComponent::StakeholderSatisfaction,
                (ratings > 0).then(|| rating_sum / ratings as f64),
            ),
            (
                FidelityComponent::AppealFrequency,
                Self::ratio(appeals, decisions).map(|rate| 1.0 - rate),
            ),
        ];
        for (component, value) in values {
            if let Some(v) = value {
                readings.set(component, v.clamp(0.0, 1.0));
            }
        }
        readings
    }
}

#[async_trait]
impl MetricsSource for MetricsRecorder {
    async fn readings(&self, window: Duration) -> Result<ComponentReadings> {
        Ok(self.readings_at(window, Utc::now()).await)
    }
}
