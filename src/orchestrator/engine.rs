//! The generation loop.
//!
//! One async task owns all run state. It draws assignments, renders
//! candidates and dispatches them to the validation pipeline, keeping up to
//! `max_concurrent_validations` in flight. Verdicts come back through a
//! `FuturesUnordered` and are integrated one at a time.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ConfigError, RenderError, RunError};
use crate::generator::resolver::{BindingResolver, ExhaustionReason, Resolution};
use crate::generator::{CandidateSample, SampleGenerator};
use crate::metrics::{GenerationMetrics, MetricsCollector};
use crate::orchestrator::config::GenerationConfig;
use crate::orchestrator::report::{
    AbortReason, DiagnosticsSender, PatternWarning, RejectionRecord, RunOutcome, RunReport,
};
use crate::orchestrator::state::{GenerationState, Integration, PatternStatus};
use crate::pattern::{Pattern, PatternMetadata};
use crate::sink::{DatasetRecord, DatasetSink};
use crate::validation::{StageKind, ValidationPipeline, Verdict};

/// Requests a running generation to stop.
///
/// Cancelling stops dispatch; candidates already being validated finish (or
/// hit their timeout), their verdicts are integrated and the sink is flushed.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of drawing one candidate for a pattern.
enum Draw {
    Candidate(CandidateSample),
    /// Rendered source matches an accepted sample.
    Duplicate,
    Exhausted(ExhaustionReason),
    Malformed(RenderError),
}

/// Drives patterns through resolution, rendering and validation until the
/// target is met or every pattern is spent.
pub struct GenerationOrchestrator {
    config: GenerationConfig,
    pipeline: Arc<ValidationPipeline>,
    generator: SampleGenerator,
    resolver: BindingResolver,
    diagnostics: Option<DiagnosticsSender>,
    cancellation: CancellationHandle,
    metrics: MetricsCollector,
    seed_fingerprints: HashSet<String>,
}

impl std::fmt::Debug for GenerationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOrchestrator")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .field("seed_fingerprints", &self.seed_fingerprints.len())
            .finish_non_exhaustive()
    }
}

impl GenerationOrchestrator {
    /// Creates an orchestrator with the standard validation pipeline.
    pub fn new(config: GenerationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let pipeline = ValidationPipeline::new(&config.pipeline_config());
        Ok(Self::with_pipeline(config, pipeline))
    }

    /// Creates an orchestrator around a custom pipeline.
    pub fn with_pipeline(config: GenerationConfig, pipeline: ValidationPipeline) -> Self {
        let resolver = BindingResolver::new(config.max_draws, config.enumeration_threshold);
        Self {
            config,
            pipeline: Arc::new(pipeline),
            generator: SampleGenerator::new(),
            resolver,
            diagnostics: None,
            cancellation: CancellationHandle::new(),
            metrics: MetricsCollector::disabled(),
            seed_fingerprints: HashSet::new(),
        }
    }

    /// Sends a [`RejectionRecord`] for every rejected candidate.
    pub fn with_diagnostics(mut self, sender: DiagnosticsSender) -> Self {
        self.diagnostics = Some(sender);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<GenerationMetrics>) -> Self {
        self.metrics = MetricsCollector::new(metrics);
        self
    }

    /// Treats these fingerprints as already accepted, e.g. when resuming
    /// into an existing dataset.
    pub fn with_seed_fingerprints<I>(mut self, fingerprints: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.seed_fingerprints.extend(fingerprints);
        self
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &ValidationPipeline {
        &self.pipeline
    }

    /// Applies the category and complexity filters and drops malformed or
    /// duplicate patterns.
    fn select_patterns<I>(&self, patterns: I) -> (Vec<Pattern>, Vec<PatternWarning>)
    where
        I: IntoIterator<Item = Pattern>,
    {
        let (min, max) = self.config.complexity_range;
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        let mut warnings = Vec::new();

        for pattern in patterns {
            if pattern.complexity < min || pattern.complexity > max {
                debug!(pattern_id = %pattern.id, complexity = pattern.complexity, "Pattern outside complexity range");
                continue;
            }
            if !self.config.categories.is_empty()
                && !self.config.categories.contains(&pattern.category)
            {
                debug!(pattern_id = %pattern.id, category = %pattern.category, "Pattern category not selected");
                continue;
            }
            if let Err(e) = pattern.validate() {
                warn!(pattern_id = %pattern.id, error = %e, "Skipping malformed pattern");
                warnings.push(PatternWarning {
                    pattern_id: pattern.id.clone(),
                    message: e.to_string(),
                });
                continue;
            }
            if !seen.insert(pattern.id.clone()) {
                warn!(pattern_id = %pattern.id, "Skipping duplicate pattern ID");
                warnings.push(PatternWarning {
                    pattern_id: pattern.id.clone(),
                    message: "duplicate pattern ID".to_string(),
                });
                continue;
            }
            selected.push(pattern);
        }

        (selected, warnings)
    }

    /// Draws a fresh assignment for pattern `idx` and renders it.
    fn draw(&self, state: &mut GenerationState, idx: usize, rng: &mut ChaCha8Rng) -> Draw {
        let resolution = {
            let progress = state.progress(idx);
            self.resolver.resolve(&progress.pattern, &progress.drawn, rng)
        };
        let assignment = match resolution {
            Resolution::Assigned(assignment) => assignment,
            Resolution::Exhausted(reason) => return Draw::Exhausted(reason),
        };

        state.record_draw(idx, assignment.clone());
        match self.generator.generate(&state.progress(idx).pattern, assignment) {
            Ok(candidate) if state.is_known_fingerprint(&candidate.fingerprint) => Draw::Duplicate,
            Ok(candidate) => Draw::Candidate(candidate),
            Err(e) => Draw::Malformed(e),
        }
    }

    fn report_rejection(&self, candidate: &CandidateSample, verdict: &Verdict, stage: StageKind) {
        let detail = verdict
            .rejection
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| format!("rejected at {}", stage));
        debug!(
            pattern_id = %candidate.pattern_id,
            bindings = %candidate.assignment,
            stage = %stage,
            detail = %detail,
            "Candidate rejected"
        );
        if let Some(tx) = &self.diagnostics {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(RejectionRecord {
                pattern_id: candidate.pattern_id.clone(),
                assignment: candidate.assignment.clone(),
                stage,
                detail,
                rejection: verdict.rejection.clone(),
            });
        }
    }

    fn build_report(
        &self,
        run_id: &str,
        state: &GenerationState,
        outcome: RunOutcome,
        warnings: &[PatternWarning],
        started_at: DateTime<Utc>,
    ) -> RunReport {
        let mut report =
            RunReport::from_progress(run_id, state.target(), self.config.seed, state.patterns());
        report.outcome = outcome;
        report.warnings = warnings.to_vec();
        report.started_at = started_at;
        report.finished_at = Utc::now();
        report
    }

    /// Runs generation over `patterns`, writing accepted records to `sink`.
    ///
    /// Returns the run report for `Completed`, `Starved` and cancelled runs.
    ///
    /// # Errors
    ///
    /// - [`RunError::Config`] if the configuration is invalid.
    /// - [`RunError::Sink`] if the sink fails; the run stops.
    /// - [`RunError::Validation`] if the pipeline cannot run at all (missing
    ///   interpreter, sandbox failure).
    ///
    /// Both runtime errors carry the partial report, and the sink has been
    /// flushed where possible.
    pub async fn run<I>(&self, patterns: I, sink: &mut dyn DatasetSink) -> Result<RunReport, RunError>
    where
        I: IntoIterator<Item = Pattern>,
    {
        self.config.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        let (patterns, mut warnings) = self.select_patterns(patterns);
        info!(
            run_id = %run_id,
            patterns = patterns.len(),
            target = self.config.target,
            quota = %self.config.quota,
            seed = self.config.seed,
            stages = ?self.pipeline.stage_kinds(),
            "Starting generation run"
        );

        let mut state = GenerationState::new(
            patterns,
            self.config.target,
            self.config.quota_limit(),
            self.config.max_attempts_per_pattern,
        );
        state.seed_fingerprints(self.seed_fingerprints.iter().cloned());

        if let Err(source) = self.pipeline.prepare().await {
            error!(run_id = %run_id, error = %source, "Validation pipeline cannot start");
            let outcome = RunOutcome::Aborted {
                reason: AbortReason::ValidationFailure,
            };
            self.metrics.record_run(outcome.as_str(), clock.elapsed());
            let report = self.build_report(&run_id, &state, outcome, &warnings, started_at);
            return Err(RunError::Validation {
                source,
                report: Box::new(report),
            });
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut in_flight = FuturesUnordered::new();
        let concurrency = self.config.max_concurrent_validations;

        let outcome = loop {
            let cancelled = self.cancellation.is_cancelled();

            if !cancelled {
                while in_flight.len() < concurrency && state.has_capacity() {
                    let Some(idx) = state.next_dispatchable() else {
                        break;
                    };
                    match self.draw(&mut state, idx, &mut rng) {
                        Draw::Candidate(candidate) => {
                            state.begin(idx);
                            let pipeline = Arc::clone(&self.pipeline);
                            in_flight.push(async move {
                                let started = Instant::now();
                                let result = pipeline.validate(&candidate).await;
                                (idx, candidate, result, started.elapsed())
                            });
                        }
                        Draw::Duplicate => {
                            state.record_duplicate(idx);
                            self.metrics.record_duplicate();
                        }
                        Draw::Exhausted(reason) => {
                            if state.mark_exhausted(idx, reason) {
                                info!(
                                    pattern_id = %state.progress(idx).pattern.id,
                                    reason = ?reason,
                                    accepted = state.progress(idx).accepted,
                                    "Pattern exhausted"
                                );
                                self.metrics.record_transition(PatternStatus::Exhausted);
                            }
                        }
                        Draw::Malformed(e) => {
                            let pattern_id = state.progress(idx).pattern.id.clone();
                            warn!(pattern_id = %pattern_id, error = %e, "Removing pattern that failed to render");
                            if state.transition(idx, PatternStatus::Malformed) {
                                self.metrics.record_transition(PatternStatus::Malformed);
                            }
                            warnings.push(PatternWarning {
                                pattern_id,
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
            self.metrics.set_in_flight(in_flight.len());

            let Some((idx, candidate, result, elapsed)) = in_flight.next().await else {
                if state.is_complete() {
                    break RunOutcome::Completed;
                }
                if cancelled {
                    break RunOutcome::Aborted {
                        reason: AbortReason::Cancelled,
                    };
                }
                break RunOutcome::Starved;
            };

            let verdict: Verdict = match result {
                Ok(verdict) => verdict,
                Err(source) => {
                    error!(pattern_id = %candidate.pattern_id, error = %source, "Validation pipeline failed");
                    // Dropping pending validations kills their child processes.
                    drop(in_flight);
                    if let Err(e) = sink.flush().await {
                        warn!(error = %e, "Failed to flush sink after validation failure");
                    }
                    let outcome = RunOutcome::Aborted {
                        reason: AbortReason::ValidationFailure,
                    };
                    self.metrics.record_run(outcome.as_str(), clock.elapsed());
                    let report = self.build_report(&run_id, &state, outcome, &warnings, started_at);
                    return Err(RunError::Validation {
                        source,
                        report: Box::new(report),
                    });
                }
            };

            self.metrics.record_verdict(&verdict, elapsed);
            let (integration, entered) = state.integrate(idx, &verdict);
            if let Some(status) = entered {
                info!(
                    pattern_id = %candidate.pattern_id,
                    status = %status,
                    accepted = state.progress(idx).accepted,
                    attempts = state.progress(idx).attempts,
                    "Pattern finished"
                );
                self.metrics.record_transition(status);
            }

            match integration {
                Integration::Accepted => {
                    let metadata = &state.progress(idx).pattern.metadata;
                    let metadata =
                        (*metadata != PatternMetadata::default()).then(|| metadata.clone());
                    let record =
                        DatasetRecord::from_candidate(&candidate, verdict.advisories.clone(), metadata);

                    if let Err(source) = sink.write(&record).await {
                        error!(pattern_id = %candidate.pattern_id, error = %source, "Dataset sink failed");
                        drop(in_flight);
                        if let Err(e) = sink.flush().await {
                            warn!(error = %e, "Failed to flush sink after write failure");
                        }
                        let outcome = RunOutcome::Aborted {
                            reason: AbortReason::SinkFailure,
                        };
                        self.metrics.record_run(outcome.as_str(), clock.elapsed());
                        let report =
                            self.build_report(&run_id, &state, outcome, &warnings, started_at);
                        return Err(RunError::Sink {
                            source,
                            report: Box::new(report),
                        });
                    }

                    self.metrics.record_accepted(&candidate.pattern_id);
                    debug!(
                        pattern_id = %candidate.pattern_id,
                        bindings = %candidate.assignment,
                        accepted = state.accepted_total(),
                        target = state.target(),
                        "Sample accepted"
                    );
                }
                Integration::Rejected(stage) => {
                    self.report_rejection(&candidate, &verdict, stage);
                }
                Integration::Duplicate => {
                    self.metrics.record_duplicate();
                    debug!(
                        pattern_id = %candidate.pattern_id,
                        fingerprint = %candidate.fingerprint,
                        "Duplicate sample skipped"
                    );
                }
            }
        };

        if let Err(source) = sink.flush().await {
            error!(error = %source, "Failed to flush dataset sink");
            let outcome = RunOutcome::Aborted {
                reason: AbortReason::SinkFailure,
            };
            self.metrics.record_run(outcome.as_str(), clock.elapsed());
            let report = self.build_report(&run_id, &state, outcome, &warnings, started_at);
            return Err(RunError::Sink {
                source,
                report: Box::new(report),
            });
        }

        self.metrics.set_in_flight(0);
        self.metrics.record_run(outcome.as_str(), clock.elapsed());
        let report = self.build_report(&run_id, &state, outcome, &warnings, started_at);

        match outcome {
            RunOutcome::Starved => warn!(
                run_id = %run_id,
                accepted = report.accepted,
                target = report.target,
                "Run starved: every pattern finished before the target was reached"
            ),
            _ => info!(
                run_id = %run_id,
                outcome = %outcome,
                accepted = report.accepted,
                rejected = report.rejected,
                duplicates = report.duplicates,
                duration_secs = report.duration_secs(),
                "Generation run finished"
            ),
        }

        Ok(report)
    }
}
