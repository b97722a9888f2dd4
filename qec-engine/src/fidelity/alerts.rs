//! Level-change alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::components::{FidelityLevel, FidelitySnapshot};

/// Alert raised when fidelity drops out of green.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: FidelityLevel,
    pub previous_level: Option<FidelityLevel>,
    pub message: String,
    /// Threshold the composite fell below
    pub threshold: f64,
    pub composite: f64,
    pub snapshot_id: String,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.cleared_at.is_none()
    }
}

/// Raises and clears alerts as the level changes.
///
/// At most one alert is active at a time. An unchanged level never
/// re-raises; any level change clears the active alert, and a change to a
/// non-green level raises a new one.
pub struct AlertManager {
    green_threshold: f64,
    amber_threshold: f64,
    capacity: usize,
    last_level: Arc<RwLock<Option<FidelityLevel>>>,
    alerts: Arc<RwLock<VecDeque<Alert>>>,
}

impl AlertManager {
    pub fn new(green_threshold: f64, amber_threshold: f64, capacity: usize) -> Self {
        Self {
            green_threshold,
            amber_threshold,
            capacity: capacity.max(1),
            last_level: Arc::new(RwLock::new(None)),
            alerts: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Update alert state for a new snapshot. Returns the alert raised, if any.
    pub async fn observe(&self, snapshot: &FidelitySnapshot) -> Option<Alert> {
        let mut last_level = self.last_level.write().await;
        let previous = *last_level;
        if previous == Some(snapshot.level) {
            return None;
        }
        *last_level = Some(snapshot.level);

        let mut alerts = self.alerts.write().await;
        for alert in alerts.iter_mut().filter(|a| a.is_active()) {
            alert.cleared_at = Some(snapshot.timestamp);
            info!(alert_id = %alert.id, level = %alert.level, now = %snapshot.level, "Fidelity alert cleared");
        }

        let threshold = match snapshot.level {
            FidelityLevel::Green => return None,
            FidelityLevel::Amber => self.green_threshold,
            FidelityLevel::Red => self.amber_threshold,
        };

        let alert = Alert {
            id: uuid::Uuid::new_v4().to_string(),
            level: snapshot.level,
            previous_level: previous,
            message: format!(
                "Fidelity {} ({:.3}) is below the {:.2} threshold",
                snapshot.level, snapshot.composite, threshold
            ),
            threshold,
            composite: snapshot.composite,
            snapshot_id: snapshot.id.clone(),
            raised_at: snapshot.timestamp,
            cleared_at: None,
        };
        warn!(
            alert_id = %alert.id,
            level = %alert.level,
            previous = ?previous,
            composite = alert.composite,
            "Fidelity alert raised"
        );

        alerts.push_back(alert.clone());
        while alerts.len() > self.capacity {
            alerts.pop_front();
        }
        Some(alert)
    }

    /// Alerts not yet cleared.
    pub async fn active(&self) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        alerts.iter().filter(|a| a.is_active()).cloned().collect()
    }

    /// Number of alerts raised at or after `since`.
    pub async fn raised_since(&self, since: DateTime<Utc>) -> usize {
        let alerts = self.alerts.read().await;
        alerts.iter().filter(|a| a.raised_at >= since).count()
    }

    /// Most recent alerts, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        alerts.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FidelityWeights;
    use crate::fidelity::components::FidelityComponents;

    fn snapshot(level: FidelityLevel, composite: f64) -> FidelitySnapshot {
        FidelitySnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            components: FidelityComponents::from_array([composite; 6]),
            composite,
            level,
            weights: FidelityWeights::default(),
            partial: false,
            missing: Vec::new(),
            cycle: 0,
        }
    }

    #[tokio::test]
    async fn test_level_changes_raise_and_clear() {
        let manager = AlertManager::new(0.85, 0.70, 10);

        assert!(manager.observe(&snapshot(FidelityLevel::Green, 0.9)).await.is_none());

        let amber = manager.observe(&snapshot(FidelityLevel::Amber, 0.75)).await.unwrap();
        assert_eq!(amber.threshold, 0.85);
        assert_eq!(amber.previous_level, Some(FidelityLevel::Green));

        // Same level does not re-raise
        assert!(manager.observe(&snapshot(FidelityLevel::Amber, 0.74)).await.is_none());
        assert_eq!(manager.active().await.len(), 1);

        let red = manager.observe(&snapshot(FidelityLevel::Red, 0.5)).await.unwrap();
        let active = manager.active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, red.id);

        assert!(manager.observe(&snapshot(FidelityLevel::Green, 0.9)).await.is_none());
        assert!(manager.active().await.is_empty());
        assert_eq!(manager.recent(10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let manager = AlertManager::new(0.85, 0.70, 2);
        for level in [FidelityLevel::Amber, FidelityLevel::Red, FidelityLevel::Amber, FidelityLevel::Red] {
            manager.observe(&snapshot(level, 0.5)).await;
        }
        assert_eq!(manager.recent(10).await.len(), 2);
    }
}
