//! High-level recording interface over [`GenerationMetrics`].
//!
//! The orchestrator talks to a [`MetricsCollector`], which is a no-op when
//! metrics are disabled, so the run loop never branches on configuration.

use std::sync::Arc;
use std::time::Duration;

use super::prometheus::GenerationMetrics;
use crate::orchestrator::PatternStatus;
use crate::validation::Verdict;

/// Records run metrics when a registry is attached.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Option<Arc<GenerationMetrics>>,
}

impl MetricsCollector {
    /// A collector that records into `metrics`.
    pub fn new(metrics: Arc<GenerationMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
        }
    }

    /// A collector that discards everything.
    pub fn disabled() -> Self {
        Self { metrics: None }
    }

    pub fn metrics(&self) -> Option<&Arc<GenerationMetrics>> {
        self.metrics.as_ref()
    }

    /// Records a validation verdict and how long it took.
    pub fn record_verdict(&self, verdict: &Verdict, elapsed: Duration) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let (stage, outcome) = match verdict.failing_stage {
            Some(stage) => (stage.as_str(), "rejected"),
            None => (
                verdict.stages_run.last().map(|s| s.as_str()).unwrap_or("none"),
                "accepted",
            ),
        };
        metrics
            .candidates_total
            .with_label_values(&[stage, outcome])
            .inc();
        metrics.validation_seconds.observe(elapsed.as_secs_f64());

        tracing::trace!(
            pattern_id = %verdict.pattern_id,
            stage = stage,
            outcome = outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Recorded verdict metric"
        );
    }

    /// Records a candidate dropped as a duplicate of an accepted sample.
    pub fn record_duplicate(&self) {
        if let Some(metrics) = &self.metrics {
            metrics
                .candidates_total
                .with_label_values(&["dedup", "duplicate"])
                .inc();
        }
    }

    /// Records an accepted sample for a pattern.
    pub fn record_accepted(&self, pattern_id: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.accepted_total.with_label_values(&[pattern_id]).inc();
        }
    }

    /// Records a pattern entering a terminal status.
    pub fn record_transition(&self, status: PatternStatus) {
        if let Some(metrics) = &self.metrics {
            metrics
                .pattern_transitions_total
                .with_label_values(&[status.as_str()])
                .inc();
        }
    }

    pub fn set_in_flight(&self, n: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.validations_in_flight.set(n as f64);
        }
    }

    /// Records the time spent in the run loop.
    pub fn record_run(&self, outcome: &str, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics
                .run_seconds
                .with_label_values(&[outcome])
                .inc_by(elapsed.as_secs_f64());
        }
    }
}
