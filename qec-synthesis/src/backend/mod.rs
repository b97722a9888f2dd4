//! Synthesis backend abstraction layer.
//!
//! Provides a trait-based interface over whatever produces and validates
//! rule patches:
//! - Remote synthesis service over HTTP
//! - Deterministic template backend
//! - Mock backend for testing

pub mod http;
pub mod mock;
pub mod template;
pub mod traits;

pub use http::HttpSynthesisBackend;
pub use mock::MockBackend;
pub use template::TemplateBackend;
pub use traits::{SynthesisBackend, SynthesisError, SynthesisOutput, TestFailure, ValidationReport};
