//! Content hashing for principles.
//!
//! The hash covers everything that changes a principle's fragility analysis
//! (description, category and criteria) and nothing that is derived from it.
//! Criterion IDs are identity, not content, and are left out.

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::Principle;

/// Compute SHA256 hash of content.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Hash the analysis-relevant content of a principle.
pub fn content_hash(principle: &Principle) -> Result<String> {
    let criteria: Vec<_> = principle
        .criteria
        .iter()
        .map(|c| (&c.description, &c.kind))
        .collect();
    let criteria = serde_json::to_string(&criteria)?;

    let mut hasher = Sha256::new();
    hasher.update(principle.description.as_bytes());
    hasher.update([0u8]);
    hasher.update(principle.category.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(criteria.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PrincipleCategory, ValidationCriterion};

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_content_hash_ignores_scores() {
        let mut principle =
            Principle::new("p-1", "Users must consent", PrincipleCategory::Privacy);
        let before = content_hash(&principle).unwrap();

        principle.record_distance(0.4, chrono::Utc::now());
        principle.historical_success_rate = Some(0.9);
        assert_eq!(content_hash(&principle).unwrap(), before);

        principle
            .criteria
            .push(ValidationCriterion::free_text("Consent must be informed"));
        assert_ne!(content_hash(&principle).unwrap(), before);
    }

    #[test]
    fn test_content_hash_ignores_criterion_ids() {
        let build = || {
            Principle::new("p-1", "Users must consent", PrincipleCategory::Privacy)
                .with_criterion(ValidationCriterion::free_text("Consent must be informed"))
        };
        let (a, b) = (build(), build());
        assert_ne!(a.criteria[0].id, b.criteria[0].id);
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }
}
