//! Prometheus metrics registration and export.
//!
//! Each [`GenerationMetrics`] owns its own registry, so concurrent runs (and
//! tests) never share counters.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
    TextEncoder,
};

/// Metrics recorded during one generation run.
#[derive(Clone)]
pub struct GenerationMetrics {
    registry: Registry,
    /// Validated candidates, labeled by deciding stage and outcome.
    pub candidates_total: IntCounterVec,
    /// Accepted samples, labeled by pattern.
    pub accepted_total: IntCounterVec,
    /// Patterns reaching a terminal status, labeled by status.
    pub pattern_transitions_total: IntCounterVec,
    /// Wall-clock seconds spent validating one candidate.
    pub validation_seconds: Histogram,
    /// Candidates currently being validated.
    pub validations_in_flight: Gauge,
    /// Seconds spent in the run loop, labeled by final outcome.
    pub run_seconds: CounterVec,
}

impl std::fmt::Debug for GenerationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationMetrics").finish_non_exhaustive()
    }
}

impl GenerationMetrics {
    /// Creates all metrics and registers them with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let candidates_total = IntCounterVec::new(
            Opts::new("forge_candidates_total", "Candidates processed by the pipeline"),
            &["stage", "outcome"],
        )?;

        let accepted_total = IntCounterVec::new(
            Opts::new("forge_accepted_total", "Accepted samples per pattern"),
            &["pattern"],
        )?;

        let pattern_transitions_total = IntCounterVec::new(
            Opts::new(
                "forge_pattern_transitions_total",
                "Patterns reaching a terminal status",
            ),
            &["status"],
        )?;

        let validation_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "forge_validation_seconds",
                "Time spent validating one candidate",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;

        let validations_in_flight = Gauge::new(
            "forge_validations_in_flight",
            "Candidates currently being validated",
        )?;

        let run_seconds = CounterVec::new(
            Opts::new("forge_run_seconds", "Time spent in the generation loop"),
            &["outcome"],
        )?;

        registry.register(Box::new(candidates_total.clone()))?;
        registry.register(Box::new(accepted_total.clone()))?;
        registry.register(Box::new(pattern_transitions_total.clone()))?;
        registry.register(Box::new(validation_seconds.clone()))?;
        registry.register(Box::new(validations_in_flight.clone()))?;
        registry.register(Box::new(run_seconds.clone()))?;

        Ok(Self {
            registry,
            candidates_total,
            accepted_total,
            pattern_transitions_total,
            validation_seconds,
            validations_in_flight,
            run_seconds,
        })
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Exports all metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}
