//! Data model for the conflict QEC decision engine.
//!
//! - [`Principle`]: a governance rule with typed validation criteria
//! - [`Conflict`]: a tension between two or more principles
//! - [`CriterionDsl`]: parses criteria text into typed criteria
//! - [`translate_criteria`]: derives validation tests from criteria
//! - [`content_hash`]: hashes the analysis-relevant content of a principle
//!
//! # Example
//!
//! ```ignore
//! use qec_model::{CriterionDsl, Principle, PrincipleCategory, translate_criteria};
//!
//! let principle = Principle::new("p-1", "Adults only", PrincipleCategory::Safety)
//!     .with_criterion(CriterionDsl::parse("user.age >= 18")?);
//!
//! let tests = translate_criteria(&principle);
//! ```

pub mod conflict;
pub mod error;
pub mod hash;
pub mod types;
pub mod validation;

// Re-export main types
pub use conflict::{
    average_distance, Conflict, ConflictSeverity, ConflictStatus, ConflictType, MemberDistance,
};
pub use error::{ModelError, Result};
pub use hash::{compute_hash, content_hash};
pub use types::*;
pub use validation::{translate_criteria, translate_criterion, CriterionDsl, Expectation, ValidationTest};
