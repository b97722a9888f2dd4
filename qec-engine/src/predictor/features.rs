//! Feature extraction for failure prediction.

use serde::{Deserialize, Serialize};

use qec_model::Principle;

/// Number of features in a [`FeatureVector`].
pub const FEATURE_COUNT: usize = 7;

const LENGTH_SCALE_WORDS: f64 = 100.0;
const CLAUSE_SCALE: f64 = 10.0;
const DEPENDENCY_SCALE: f64 = 5.0;

/// Clause connectives counted toward structural complexity.
const CONNECTIVES: [&str; 6] = ["and", "or", "unless", "except", "if", "when"];

/// Normalized numeric features of a principle, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: [f64; FEATURE_COUNT],
}

impl FeatureVector {
    pub const LENGTH: usize = 0;
    pub const COMPLEXITY: usize = 1;
    pub const AMBIGUITY: usize = 2;
    pub const DISTANCE: usize = 3;
    pub const CATEGORY_WEIGHT: usize = 4;
    pub const DEPENDENCIES: usize = 5;
    pub const INFORMALITY: usize = 6;

    /// Extract features for a principle.
    pub fn extract(principle: &Principle, ambiguity: f64, distance: f64) -> Self {
        let words: Vec<String> = principle
            .description
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .collect();

        let sentences = principle
            .description
            .split(['.', ';', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .count();
        let connectives = words.iter().filter(|w| CONNECTIVES.contains(&w.as_str())).count();
        let commas = principle.description.matches(',').count();
        let clauses = sentences + connectives + commas;

        let mut values = [0.0; FEATURE_COUNT];
        values[Self::LENGTH] = words.len() as f64 / LENGTH_SCALE_WORDS;
        values[Self::COMPLEXITY] = clauses as f64 / CLAUSE_SCALE;
        values[Self::AMBIGUITY] = ambiguity;
        values[Self::DISTANCE] = distance;
        values[Self::CATEGORY_WEIGHT] = principle.category.complexity_weight();
        values[Self::DEPENDENCIES] = principle.dependencies.len() as f64 / DEPENDENCY_SCALE;
        values[Self::INFORMALITY] = 1.0 - principle.formality_ratio();

        for v in values.iter_mut() {
            *v = v.clamp(0.0, 1.0);
        }
        Self { values }
    }

    /// Whether every feature is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qec_model::PrincipleCategory;

    #[test]
    fn test_extract() {
        let principle = Principle::new(
            "p-1",
            "Members may vote, unless suspended. Votes are public when the quorum is met.",
            PrincipleCategory::Governance,
        )
        .with_dependency("p-0");

        let features = FeatureVector::extract(&principle, 0.4, 0.6);

        // 2 sentences, "unless", "when", one comma
        assert!((features.values[FeatureVector::COMPLEXITY] - 0.5).abs() < 1e-9);
        assert!((features.values[FeatureVector::LENGTH] - 0.13).abs() < 1e-9);
        assert_eq!(features.values[FeatureVector::AMBIGUITY], 0.4);
        assert_eq!(features.values[FeatureVector::DISTANCE], 0.6);
        assert!((features.values[FeatureVector::DEPENDENCIES] - 0.2).abs() < 1e-9);
        assert_eq!(features.values[FeatureVector::INFORMALITY], 1.0);
        assert!(features.values.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
