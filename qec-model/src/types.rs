//! Core types for principles and their validation criteria.
//!
//! A principle is a single governance rule. Its description is free text, but
//! its validation criteria are typed so that the machine-checkable part can be
//! translated into validation tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Category of a governance principle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PrincipleCategory {
    /// Harm prevention and safety limits
    Safety,
    /// Data handling and personal information
    Privacy,
    /// Equal treatment and non-discrimination
    Fairness,
    /// Disclosure and explainability duties
    Transparency,
    /// Responsibility and audit obligations
    Accountability,
    /// Self-determination of affected parties
    Autonomy,
    /// Process rules for the governing body itself
    Governance,
    /// Day-to-day operational rules
    Operational,
}

impl PrincipleCategory {
    /// Relative complexity of rules in this category (0.0 - 1.0).
    ///
    /// Categories that usually involve trade-offs between parties are harder
    /// to synthesize correctly.
    pub fn complexity_weight(&self) -> f64 {
        match self {
            Self::Fairness => 0.9,
            Self::Safety => 0.8,
            Self::Privacy => 0.7,
            Self::Autonomy => 0.7,
            Self::Governance => 0.6,
            Self::Accountability => 0.5,
            Self::Transparency => 0.4,
            Self::Operational => 0.3,
        }
    }

    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safety => "safety",
            Self::Privacy => "privacy",
            Self::Fairness => "fairness",
            Self::Transparency => "transparency",
            Self::Accountability => "accountability",
            Self::Autonomy => "autonomy",
            Self::Governance => "governance",
            Self::Operational => "operational",
        }
    }

    /// All categories, in declaration order.
    pub fn all() -> [Self; 8] {
        [
            Self::Safety,
            Self::Privacy,
            Self::Fairness,
            Self::Transparency,
            Self::Accountability,
            Self::Autonomy,
            Self::Governance,
            Self::Operational,
        ]
    }
}

impl Default for PrincipleCategory {
    fn default() -> Self {
        Self::Operational
    }
}

/// Comparison operator used in predicate criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl ComparisonOperator {
    /// Parse the textual operator used by the criteria DSL.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::NotEq),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Gte),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Lte),
            "in" => Some(Self::In),
            _ => None,
        }
    }

    /// Operator symbol in rule-language assertions.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::In => "in",
        }
    }
}

/// The typed shape of a validation criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriterionKind {
    /// `field op value` over the request input
    Predicate {
        field: String,
        operator: ComparisonOperator,
        value: serde_json::Value,
    },
    /// The input must carry this field
    Requires { field: String },
    /// The named action must never be allowed
    Prohibits { action: String },
    /// Natural-language criterion, not machine-checkable
    FreeText,
}

/// A validation criterion attached to a principle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCriterion {
    /// Unique identifier
    pub id: String,
    /// Original text of the criterion
    pub description: String,
    /// Typed form
    pub kind: CriterionKind,
}

impl ValidationCriterion {
    /// Create a free-text criterion.
    pub fn free_text(description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            kind: CriterionKind::FreeText,
        }
    }

    /// Create a criterion of the given kind.
    pub fn new(description: impl Into<String>, kind: CriterionKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            kind,
        }
    }

    /// Whether this criterion can be checked by a machine.
    pub fn is_structured(&self) -> bool {
        !matches!(self.kind, CriterionKind::FreeText)
    }
}

/// A governance principle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principle {
    /// Immutable identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// The principle statement
    pub description: String,
    /// Category of the principle
    pub category: PrincipleCategory,
    /// Structured validation criteria
    pub criteria: Vec<ValidationCriterion>,
    /// IDs of principles this one depends on
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Last computed fragility score (0.0 = robust, 1.0 = fragile)
    pub distance_score: Option<f64>,
    /// When `distance_score` was last written
    pub score_updated_at: Option<DateTime<Utc>>,
    /// Rolling synthesis success rate (0.0 - 1.0)
    pub historical_success_rate: Option<f64>,
}

impl Principle {
    /// Create a new principle with no criteria.
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        category: PrincipleCategory,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: description.into(),
            category,
            criteria: Vec::new(),
            dependencies: Vec::new(),
            distance_score: None,
            score_updated_at: None,
            historical_success_rate: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a criterion.
    pub fn with_criterion(mut self, criterion: ValidationCriterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    /// Add a dependency on another principle.
    pub fn with_dependency(mut self, principle_id: impl Into<String>) -> Self {
        self.dependencies.push(principle_id.into());
        self
    }

    /// Set the historical success rate.
    pub fn with_success_rate(mut self, rate: f64) -> Self {
        self.historical_success_rate = Some(rate);
        self
    }

    /// Record a freshly computed distance score.
    pub fn record_distance(&mut self, score: f64, at: DateTime<Utc>) {
        self.distance_score = Some(score.clamp(0.0, 1.0));
        self.score_updated_at = Some(at);
    }

    /// Fraction of criteria that are machine-checkable.
    ///
    /// A principle without criteria is treated as entirely informal.
    pub fn formality_ratio(&self) -> f64 {
        if self.criteria.is_empty() {
            return 0.0;
        }
        let structured = self.criteria.iter().filter(|c| c.is_structured()).count();
        structured as f64 / self.criteria.len() as f64
    }

    /// Reject malformed principle data.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ModelError::InvalidPrinciple(
                "principle id must not be empty".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(ModelError::InvalidPrinciple(format!(
                "principle {} has an empty description",
                self.id
            )));
        }
        for (name, value) in [
            ("distance_score", self.distance_score),
            ("historical_success_rate", self.historical_success_rate),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) || v.is_nan() {
                    return Err(ModelError::InvalidPrinciple(format!(
                        "principle {} has {} outside [0, 1]: {}",
                        self.id, name, v
                    )));
                }
            }
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(ModelError::InvalidPrinciple(format!(
                "principle {} depends on itself",
                self.id
            )));
        }
        Ok(())
    }
}
