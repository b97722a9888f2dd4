//! Fidelity Monitor.
//!
//! Periodically aggregates six weighted component scores into a composite
//! system-health score, classifies it green/amber/red, and raises or clears
//! alerts when the level changes.

mod alerts;
mod components;
mod monitor;
mod source;

pub use alerts::{Alert, AlertManager};
pub use components::{
    classify, classify_with_hysteresis, FidelityComponent, FidelityComponents, FidelityLevel,
    FidelitySnapshot, COMPONENT_COUNT,
};
pub use monitor::{FidelityHistory, FidelityMonitor, FidelityStatus, FidelitySummary, TickState, Trend};
pub use source::{ComponentReadings, MetricEvent, MetricsRecorder, MetricsSource};
