//! Metric calculation engine.
//!
//! Metrics are parameterized SQL templates from a YAML catalog, executed
//! per period against the warehouse and written as time-series points:
//! - **period**: typed period codes (`h`, `d`, `d7`, `w`, `m`, `q`, `y`,
//!   `y10`) plus aggregation, and the recompute schedule predicate
//! - **template**: `{{period:col}}` / `{{from}}` / `{{to}}` expansion with
//!   window-length computation
//! - **spec**: the YAML metric catalog
//! - **engine**: execution shapes (plain, multi-row fan-out, multi-value,
//!   histogram, merged-series, custom-data) and failure policy

pub mod engine;
pub mod period;
pub mod spec;
pub mod template;

pub use engine::{EngineStats, MetricEngine, MetricError};
pub use period::{compute_period_at, ComputeFlags, Period, PeriodError, PeriodKind};
pub use spec::{Metric, MetricsConfig};
pub use template::{expand, TemplateContext};
