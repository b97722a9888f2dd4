//! QEC Synthesis - rule synthesis and validation backends
//!
//! The recovery dispatcher never talks to a model directly. It builds a
//! [`SynthesisRequest`] shaped by strategy directives and hands it to a
//! [`SynthesisBackend`], then asks the same backend to run the validation
//! tests derived from the principle's criteria.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         RecoveryDispatcher              │
//! │  (strategy directives + attempts)       │
//! └────────────────┬────────────────────────┘
//!                  │
//!      ┌───────────┼───────────────┐
//!      ▼           ▼               ▼
//! ┌──────────┐ ┌──────────┐ ┌──────────┐
//! │   HTTP   │ │ Template │ │   Mock   │
//! └──────────┘ └──────────┘ └──────────┘
//! ```

pub mod backend;
pub mod request;

// Re-export main types for convenience
pub use backend::{
    HttpSynthesisBackend, MockBackend, SynthesisBackend, SynthesisError, SynthesisOutput,
    TemplateBackend, TestFailure, ValidationReport,
};
pub use request::{SynthesisDirective, SynthesisRequest};
