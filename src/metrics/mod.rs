//! Prometheus metrics for generation runs.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pattern_forge::metrics::{GenerationMetrics, MetricsCollector};
//!
//! let metrics = Arc::new(GenerationMetrics::new()?);
//! let collector = MetricsCollector::new(metrics.clone());
//! collector.record_accepted("circle_area");
//! println!("{}", metrics.export());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::GenerationMetrics;
