//! Fidelity components, composite score and level classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::FidelityWeights;

/// Number of fidelity components.
pub const COMPONENT_COUNT: usize = 6;

/// One of the six health components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FidelityComponent {
    /// Share of registered principles scored in the window
    PrincipleCoverage,
    /// Share of recovery runs that produced a validated patch
    SynthesisSuccess,
    /// Share of enforcement checks that behaved as expected
    EnforcementReliability,
    /// How quickly failures were recovered
    AdaptationSpeed,
    /// Mean stakeholder rating
    StakeholderSatisfaction,
    /// Inverted appeal rate
    AppealFrequency,
}

impl FidelityComponent {
    /// All components, in weight order.
    pub fn all() -> [Self; COMPONENT_COUNT] {
        [
            Self::PrincipleCoverage,
            Self::SynthesisSuccess,
            Self::EnforcementReliability,
            Self::AdaptationSpeed,
            Self::StakeholderSatisfaction,
            Self::AppealFrequency,
        ]
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrincipleCoverage => "principle_coverage",
            Self::SynthesisSuccess => "synthesis_success",
            Self::EnforcementReliability => "enforcement_reliability",
            Self::AdaptationSpeed => "adaptation_speed",
            Self::StakeholderSatisfaction => "stakeholder_satisfaction",
            Self::AppealFrequency => "appeal_frequency",
        }
    }
}

impl fmt::Display for FidelityComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six component scores of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FidelityComponents {
    pub principle_coverage: f64,
    pub synthesis_success: f64,
    pub enforcement_reliability: f64,
    pub adaptation_speed: f64,
    pub stakeholder_satisfaction: f64,
    pub appeal_frequency: f64,
}

impl FidelityComponents {
    /// Build from values in component order.
    pub fn from_array(values: [f64; COMPONENT_COUNT]) -> Self {
        Self {
            principle_coverage: values[0],
            synthesis_success: values[1],
            enforcement_reliability: values[2],
            adaptation_speed: values[3],
            stakeholder_satisfaction: values[4],
            appeal_frequency: values[5],
        }
    }

    /// Values in component order.
    pub fn as_array(&self) -> [f64; COMPONENT_COUNT] {
        [
            self.principle_coverage,
            self.synthesis_success,
            self.enforcement_reliability,
            self.adaptation_speed,
            self.stakeholder_satisfaction,
            self.appeal_frequency,
        ]
    }

    pub fn get(&self, component: FidelityComponent) -> f64 {
        self.as_array()[component.index()]
    }

    /// Weighted sum of the components, clamped to [0, 1].
    pub fn composite(&self, weights: &FidelityWeights) -> f64 {
        self.as_array()
            .iter()
            .zip(weights.as_array())
            .map(|(value, weight)| value * weight)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }
}

/// Health level of the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FidelityLevel {
    Green,
    Amber,
    Red,
}

impl FidelityLevel {
    /// 0 is healthiest.
    fn rank(&self) -> u8 {
        match self {
            Self::Green => 0,
            Self::Amber => 1,
            Self::Red => 2,
        }
    }

    /// Whether `self` is healthier than `other`.
    pub fn is_better_than(&self, other: FidelityLevel) -> bool {
        self.rank() < other.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Amber => "amber",
            Self::Red => "red",
        }
    }
}

impl fmt::Display for FidelityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a composite against the green and amber thresholds.
pub fn classify(composite: f64, green: f64, amber: f64) -> FidelityLevel {
    if composite >= green {
        FidelityLevel::Green
    } else if composite >= amber {
        FidelityLevel::Amber
    } else {
        FidelityLevel::Red
    }
}

/// Classify with hysteresis relative to the previous level.
///
/// Degrading is immediate. Improving to a level requires clearing its
/// threshold by `margin`; otherwise the best level that is cleared wins,
/// and failing that the previous level holds.
pub fn classify_with_hysteresis(
    previous: Option<FidelityLevel>,
    composite: f64,
    green: f64,
    amber: f64,
    margin: f64,
) -> FidelityLevel {
    let raw = classify(composite, green, amber);
    let Some(previous) = previous else {
        return raw;
    };
    if !raw.is_better_than(previous) {
        return raw;
    }

    if raw == FidelityLevel::Green && composite >= green + margin {
        FidelityLevel::Green
    } else if previous == FidelityLevel::Red && composite >= amber + margin {
        FidelityLevel::Amber
    } else {
        previous
    }
}

/// One aggregation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FidelitySnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub components: FidelityComponents,
    pub composite: f64,
    pub level: FidelityLevel,
    /// Weights the composite was computed with
    pub weights: FidelityWeights,
    /// True when some components fell back to last-known values
    pub partial: bool,
    pub missing: Vec<FidelityComponent>,
    /// Aggregation cycle number
    pub cycle: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(0.87, 0.85, 0.70), FidelityLevel::Green);
        assert_eq!(classify(0.85, 0.85, 0.70), FidelityLevel::Green);
        assert_eq!(classify(0.72, 0.85, 0.70), FidelityLevel::Amber);
        assert_eq!(classify(0.50, 0.85, 0.70), FidelityLevel::Red);
    }

    #[test]
    fn test_composite_uses_weights() {
        let weights = FidelityWeights::default();
        let all_ones = FidelityComponents::from_array([1.0; COMPONENT_COUNT]);
        assert!((all_ones.composite(&weights) - 1.0).abs() < 1e-9);

        let only_coverage = FidelityComponents::from_array([1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert!((only_coverage.composite(&weights) - 0.25).abs() < 1e-9);
        assert_eq!(only_coverage.get(FidelityComponent::PrincipleCoverage), 1.0);
    }

    #[test]
    fn test_hysteresis() {
        use FidelityLevel::*;
        let classify = |prev, c| classify_with_hysteresis(prev, c, 0.85, 0.70, 0.01);

        // Degrading is immediate
        assert_eq!(classify(Some(Green), 0.849), Amber);
        assert_eq!(classify(Some(Amber), 0.69), Red);

        // Improving needs the margin
        assert_eq!(classify(Some(Amber), 0.855), Amber);
        assert_eq!(classify(Some(Amber), 0.861), Green);
        assert_eq!(classify(Some(Red), 0.705), Red);
        assert_eq!(classify(Some(Red), 0.855), Amber);

        assert_eq!(classify(None, 0.855), Green);
    }
}
