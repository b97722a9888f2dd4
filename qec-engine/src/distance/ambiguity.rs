//! Hedging-term detection.

use regex::{Regex, RegexBuilder};

use crate::types::{QecError, Result};

/// Scores how much of a text is hedging or vague language.
#[derive(Debug, Clone)]
pub struct AmbiguityScorer {
    patterns: Vec<Regex>,
    saturation: f64,
}

impl AmbiguityScorer {
    /// Compile a pattern set. `saturation` is the hedge-term density that
    /// scores 1.0.
    pub fn new(patterns: &[String], saturation: f64) -> Result<Self> {
        if !(saturation > 0.0 && saturation.is_finite()) {
            return Err(QecError::Config("ambiguity saturation must be positive".to_string()));
        }
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| QecError::Config(format!("invalid ambiguity pattern {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { patterns, saturation })
    }

    /// Number of hedge-term occurrences in `text`.
    pub fn matches(&self, text: &str) -> usize {
        self.patterns.iter().map(|p| p.find_iter(text).count()).sum()
    }

    /// Ambiguity score (0.0 - 1.0).
    pub fn score(&self, text: &str) -> f64 {
        let words = text.split_whitespace().count();
        if words == 0 {
            return 0.0;
        }
        let density = self.matches(text) as f64 / words as f64;
        (density / self.saturation).min(1.0)
    }

    /// `text` with hedge terms removed, and the removed terms.
    pub fn strip(&self, text: &str) -> (String, Vec<String>) {
        let mut removed = Vec::new();
        let mut stripped = text.to_string();
        for pattern in &self.patterns {
            for m in pattern.find_iter(&stripped) {
                removed.push(m.as_str().to_lowercase());
            }
            stripped = pattern.replace_all(&stripped, "").into_owned();
        }
        let stripped = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        (stripped, removed)
    }
}
