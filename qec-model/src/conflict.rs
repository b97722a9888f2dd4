//! Conflicts between principles.
//!
//! A conflict is created when two or more principles are found in tension.
//! It is mutated as analysis results and patches are attached, and is never
//! deleted: a resolved conflict keeps its history and may be superseded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ModelError, Result};

/// Kind of tension between principles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Principles protect competing values
    ValueTension,
    /// Principles claim the same scope with different rules
    ScopeOverlap,
    /// No clear precedence between principles
    PriorityAmbiguity,
    /// Principles cannot both be satisfied
    Contradiction,
    /// Principles compete for the same limited resource
    ResourceContention,
}

/// Severity of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl ConflictSeverity {
    /// Numeric weight (0.0 - 1.0) used in priority scoring.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }
}

impl Default for ConflictSeverity {
    fn default() -> Self {
        Self::Medium
    }
}

/// Lifecycle status of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Newly detected
    Detected,
    /// Analysis attached
    Analyzing,
    /// A patch has been proposed
    PatchProposed,
    /// Conflict resolved
    Resolved,
    /// Automation gave up; waiting on human review
    Escalated,
}

/// Distance score of one conflict member at analysis time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDistance {
    /// Principle ID
    pub principle_id: String,
    /// Distance score (0.0 - 1.0)
    pub distance: f64,
}

/// A detected tension between principles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    /// Unique conflict ID
    pub id: String,
    /// Principles in tension
    pub principle_ids: Vec<String>,
    /// Kind of tension
    pub conflict_type: ConflictType,
    /// Severity
    pub severity: ConflictSeverity,
    /// Human-readable description
    pub description: String,
    /// Per-member distance scores from the latest analysis
    pub member_distances: Vec<MemberDistance>,
    /// Mean of `member_distances`
    pub average_distance: Option<f64>,
    /// Lifecycle status
    pub status: ConflictStatus,
    /// Attached patch IDs
    pub patch_ids: Vec<String>,
    /// Conflict that replaced this one, if any
    pub superseded_by: Option<String>,
    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl Conflict {
    /// Create a new conflict between principles.
    pub fn new(
        principle_ids: Vec<String>,
        conflict_type: ConflictType,
        severity: ConflictSeverity,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            principle_ids,
            conflict_type,
            severity,
            description: String::new(),
            member_distances: Vec::new(),
            average_distance: None,
            status: ConflictStatus::Detected,
            patch_ids: Vec::new(),
            superseded_by: None,
            detected_at: now,
            updated_at: now,
        }
    }

    /// Set the conflict ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Reject malformed conflict data.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ModelError::InvalidConflict(
                "conflict id must not be empty".to_string(),
            ));
        }
        if self.principle_ids.len() < 2 {
            return Err(ModelError::InvalidConflict(format!(
                "conflict {} needs at least two principles, got {}",
                self.id,
                self.principle_ids.len()
            )));
        }
        let unique: HashSet<&String> = self.principle_ids.iter().collect();
        if unique.len() != self.principle_ids.len() {
            return Err(ModelError::InvalidConflict(format!(
                "conflict {} lists a principle more than once",
                self.id
            )));
        }
        Ok(())
    }

    /// Attach the distances of every member and recompute the average.
    ///
    /// The distances must cover exactly the conflict's members.
    pub fn record_distances(&mut self, distances: Vec<MemberDistance>) -> Result<f64> {
        let members: HashSet<&str> = self.principle_ids.iter().map(String::as_str).collect();
        let scored: HashSet<&str> = distances.iter().map(|d| d.principle_id.as_str()).collect();

        if distances.len() != self.principle_ids.len() || members != scored {
            return Err(ModelError::InvalidConflict(format!(
                "distances for conflict {} do not match its {} members",
                self.id,
                self.principle_ids.len()
            )));
        }
        if let Some(bad) = distances.iter().find(|d| !(0.0..=1.0).contains(&d.distance)) {
            return Err(ModelError::InvalidConflict(format!(
                "distance for {} outside [0, 1]: {}",
                bad.principle_id, bad.distance
            )));
        }

        let average = average_distance(&distances);
        self.member_distances = distances;
        self.average_distance = Some(average);
        if self.status == ConflictStatus::Detected {
            self.status = ConflictStatus::Analyzing;
        }
        self.touch();
        Ok(average)
    }

    /// Attach a generated patch.
    pub fn attach_patch(&mut self, patch_id: impl Into<String>) {
        self.patch_ids.push(patch_id.into());
        if !self.is_closed() {
            self.status = ConflictStatus::PatchProposed;
        }
        self.touch();
    }

    /// Mark the conflict as waiting on human review.
    pub fn escalate(&mut self) {
        if !self.is_closed() {
            self.status = ConflictStatus::Escalated;
            self.touch();
        }
    }

    /// Mark the conflict resolved, optionally naming its successor.
    pub fn resolve(&mut self, superseded_by: Option<String>) {
        self.status = ConflictStatus::Resolved;
        self.superseded_by = superseded_by;
        self.touch();
    }

    /// Whether the conflict has reached a resolved state.
    pub fn is_closed(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Arithmetic mean of member distances (0.0 for an empty set).
pub fn average_distance(distances: &[MemberDistance]) -> f64 {
    if distances.is_empty() {
        return 0.0;
    }
    distances.iter().map(|d| d.distance).sum::<f64>() / distances.len() as f64
}
