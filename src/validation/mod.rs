//! Multi-stage validation of candidate samples.
//!
//! Candidates pass through an ordered, fail-fast pipeline:
//!
//! 1. **Syntax** - the interpreter's own parser
//! 2. **Style** - a built-in lint profile
//! 3. **Deep analysis** (optional) - structural smells
//! 4. **Execution** - the candidate and its checks in the sandbox
//!
//! The first rejecting stage ends evaluation, so no later (and more
//! expensive) stage ever sees a candidate an earlier stage rejected.
//!
//! Rejections are verdicts, not errors. A [`ValidationError`] means the
//! pipeline itself could not run (missing interpreter, sandbox setup failure).

pub mod analysis;
pub mod execution;
mod names;
pub mod style;
pub mod syntax;
pub mod tree;

pub use analysis::{AnalysisThresholds, DeepAnalysisStage};
pub use execution::ExecutionStage;
pub use style::{StyleProfile, StyleStage};
pub use syntax::SyntaxStage;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ValidationError;
#[cfg(test)]
use crate::error::SandboxError;
use crate::generator::{BindingAssignment, CandidateSample};
use crate::sandbox::{Sandbox, SandboxConfig};

/// Pipeline stages, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Syntax,
    Style,
    DeepAnalysis,
    Execution,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Syntax,
        StageKind::Style,
        StageKind::DeepAnalysis,
        StageKind::Execution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Syntax => "syntax",
            StageKind::Style => "style",
            StageKind::DeepAnalysis => "deep_analysis",
            StageKind::Execution => "execution",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How deep-analysis flags affect the verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeepAnalysisPolicy {
    /// Any flag rejects the candidate.
    #[default]
    Reject,
    /// Flags are recorded on the verdict and evaluation continues.
    Advisory,
}

/// A single rule finding at a source position (1-based).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub line: usize,
    pub column: usize,
    pub code: String,
    pub message: String,
}

impl Violation {
    pub fn new(line: usize, column: usize, code: &str, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {} {}", self.line, self.column, self.code, self.message)
    }
}

/// What went wrong when a candidate was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSignal {
    /// An uncaught exception other than a failed assertion.
    RuntimeError,
    /// A check's assertion failed.
    AssertionFailed,
    /// The wall-clock limit elapsed and the process was killed.
    Timeout,
}

/// Captured details of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub signal: ExecutionSignal,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Why a stage rejected a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    SyntaxInvalid {
        line: usize,
        column: usize,
        message: String,
    },
    /// All violations found, not just the first.
    StyleViolation { violations: Vec<Violation> },
    DeepAnalysisFlag { flags: Vec<Violation> },
    ExecutionFailed(ExecutionFailure),
}

impl Rejection {
    /// The stage that produces this kind of rejection.
    pub fn stage(&self) -> StageKind {
        match self {
            Rejection::SyntaxInvalid { .. } => StageKind::Syntax,
            Rejection::StyleViolation { .. } => StageKind::Style,
            Rejection::DeepAnalysisFlag { .. } => StageKind::DeepAnalysis,
            Rejection::ExecutionFailed(_) => StageKind::Execution,
        }
    }

    /// Rule identifiers involved, for style and analysis rejections.
    pub fn codes(&self) -> Vec<&str> {
        match self {
            Rejection::StyleViolation { violations: v } | Rejection::DeepAnalysisFlag { flags: v } => {
                v.iter().map(|x| x.code.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::SyntaxInvalid {
                line,
                column,
                message,
            } => write!(f, "syntax error at {}:{}: {}", line, column, message),
            Rejection::StyleViolation { violations } => {
                let items: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                write!(f, "{} style violation(s): {}", violations.len(), items.join("; "))
            }
            Rejection::DeepAnalysisFlag { flags } => {
                let items: Vec<String> = flags.iter().map(|v| v.to_string()).collect();
                write!(f, "{} analysis flag(s): {}", flags.len(), items.join("; "))
            }
            Rejection::ExecutionFailed(failure) => {
                let tail = failure
                    .stderr
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("")
                    .trim();
                match failure.signal {
                    ExecutionSignal::Timeout => {
                        write!(f, "execution timed out after {}ms", failure.duration_ms)
                    }
                    ExecutionSignal::AssertionFailed => write!(f, "check failed: {}", tail),
                    ExecutionSignal::RuntimeError => write!(f, "runtime error: {}", tail),
                }
            }
        }
    }
}

/// Result of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Pass,
    /// Passed, with findings to attach to the verdict.
    Advisory(Vec<Violation>),
    Reject(Rejection),
}

/// One step of the validation pipeline.
#[async_trait]
pub trait ValidationStage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Evaluates a candidate.
    ///
    /// Returns `Err` only for infrastructure failures; a bad candidate is an
    /// `Ok(StageOutcome::Reject(..))`.
    async fn check(&self, candidate: &CandidateSample) -> Result<StageOutcome, ValidationError>;

    /// Verifies the stage can run at all, before any candidate is checked.
    async fn prepare(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Final, immutable result of validating one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub pattern_id: String,
    pub assignment: BindingAssignment,
    pub fingerprint: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failing_stage: Option<StageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<Violation>,
    /// Stages that evaluated the candidate, in order.
    pub stages_run: Vec<StageKind>,
}

/// Settings for building the standard pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sandbox: SandboxConfig,
    pub style: StyleProfile,
    pub deep_analysis: bool,
    pub policy: DeepAnalysisPolicy,
    pub thresholds: AnalysisThresholds,
    /// Limit for one parser invocation.
    pub parse_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            style: StyleProfile::default(),
            deep_analysis: false,
            policy: DeepAnalysisPolicy::default(),
            thresholds: AnalysisThresholds::default(),
            parse_timeout: Duration::from_secs(10),
        }
    }
}

/// Ordered, fail-fast sequence of validation stages.
#[derive(Clone)]
pub struct ValidationPipeline {
    stages: Vec<Arc<dyn ValidationStage>>,
}

impl fmt::Debug for ValidationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationPipeline")
            .field("stages", &self.stage_kinds())
            .finish()
    }
}

impl ValidationPipeline {
    /// Builds the standard pipeline: syntax, style, deep analysis when
    /// enabled, then sandboxed execution.
    pub fn new(config: &PipelineConfig) -> Self {
        let mut stages: Vec<Arc<dyn ValidationStage>> = vec![
            Arc::new(SyntaxStage::new(
                config.sandbox.interpreter.clone(),
                config.parse_timeout,
            )),
            Arc::new(StyleStage::new(config.style.clone())),
        ];
        if config.deep_analysis {
            stages.push(Arc::new(DeepAnalysisStage::new(
                config.thresholds,
                config.policy,
            )));
        }
        stages.push(Arc::new(ExecutionStage::new(Sandbox::new(
            config.sandbox.clone(),
        ))));
        Self::from_stages(stages)
    }

    /// Builds a pipeline of the syntax and style stages only.
    pub fn static_checks(config: &PipelineConfig) -> Self {
        Self::from_stages(vec![
            Arc::new(SyntaxStage::new(
                config.sandbox.interpreter.clone(),
                config.parse_timeout,
            )),
            Arc::new(StyleStage::new(config.style.clone())),
        ])
    }

    /// Builds a pipeline from arbitrary stages, ordered by [`StageKind`].
    pub fn from_stages(mut stages: Vec<Arc<dyn ValidationStage>>) -> Self {
        stages.sort_by_key(|s| s.kind());
        Self { stages }
    }

    /// Kinds of the configured stages, in evaluation order.
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// Verifies every stage can run. Called once before a run starts.
    pub async fn prepare(&self) -> Result<(), ValidationError> {
        for stage in &self.stages {
            stage.prepare().await?;
        }
        Ok(())
    }

    /// Runs the candidate through the stages until one rejects it.
    pub async fn validate(&self, candidate: &CandidateSample) -> Result<Verdict, ValidationError> {
        let mut stages_run = Vec::with_capacity(self.stages.len());
        let mut advisories = Vec::new();

        for stage in &self.stages {
            let kind = stage.kind();
            stages_run.push(kind);
            match stage.check(candidate).await? {
                StageOutcome::Pass => {}
                StageOutcome::Advisory(flags) => advisories.extend(flags),
                StageOutcome::Reject(rejection) => {
                    debug!(
                        pattern_id = %candidate.pattern_id,
                        stage = %kind,
                        reason = %rejection,
                        "Candidate rejected"
                    );
                    return Ok(Verdict {
                        pattern_id: candidate.pattern_id.clone(),
                        assignment: candidate.assignment.clone(),
                        fingerprint: candidate.fingerprint.clone(),
                        accepted: false,
                        failing_stage: Some(kind),
                        rejection: Some(rejection),
                        advisories,
                        stages_run,
                    });
                }
            }
        }

        Ok(Verdict {
            pattern_id: candidate.pattern_id.clone(),
            assignment: candidate.assignment.clone(),
            fingerprint: candidate.fingerprint.clone(),
            accepted: true,
            failing_stage: None,
            rejection: None,
            advisories,
            stages_run,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{BrokenStage, MarkerStage, UnreadyStage};
    use super::*;

    fn candidate(source: &str) -> CandidateSample {
        CandidateSample {
            pattern_id: "p".to_string(),
            category: "c".to_string(),
            complexity: 1,
            assignment: BindingAssignment::new(),
            source: source.to_string(),
            checks: Vec::new(),
            instruction: "do it".to_string(),
            fingerprint: crate::generator::source_fingerprint(source),
        }
    }

    #[tokio::test]
    async fn test_fail_fast_stops_at_first_rejection() {
        let syntax = Arc::new(MarkerStage::new(StageKind::Syntax, "BAD_SYNTAX"));
        let execution = Arc::new(MarkerStage::new(StageKind::Execution, "BAD_RUN"));
        // Deliberately out of order; the pipeline sorts by kind.
        let pipeline = ValidationPipeline::from_stages(vec![
            execution.clone() as Arc<dyn ValidationStage>,
            syntax.clone() as Arc<dyn ValidationStage>,
        ]);
        assert_eq!(
            pipeline.stage_kinds(),
            vec![StageKind::Syntax, StageKind::Execution]
        );

        let verdict = pipeline
            .validate(&candidate("BAD_SYNTAX BAD_RUN"))
            .await
            .expect("pipeline failed");
        assert!(!verdict.accepted);
        assert_eq!(verdict.failing_stage, Some(StageKind::Syntax));
        assert_eq!(verdict.stages_run, vec![StageKind::Syntax]);
        assert_eq!(execution.calls(), 0);

        let verdict = pipeline
            .validate(&candidate("BAD_RUN"))
            .await
            .expect("pipeline failed");
        assert_eq!(verdict.failing_stage, Some(StageKind::Execution));
        assert!(matches!(
            verdict.rejection,
            Some(Rejection::ExecutionFailed(ExecutionFailure {
                signal: ExecutionSignal::AssertionFailed,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_accepts_clean_candidate() {
        let pipeline = ValidationPipeline::from_stages(vec![
            Arc::new(MarkerStage::new(StageKind::Syntax, "X")),
            Arc::new(MarkerStage::new(StageKind::Style, "Y")),
        ]);
        let verdict = pipeline.validate(&candidate("ok")).await.expect("pipeline failed");
        assert!(verdict.accepted);
        assert!(verdict.rejection.is_none());
        assert_eq!(verdict.stages_run.len(), 2);
    }

    #[tokio::test]
    async fn test_infrastructure_error_propagates() {
        let pipeline = ValidationPipeline::from_stages(vec![Arc::new(BrokenStage)]);
        assert!(matches!(
            pipeline.validate(&candidate("ok")).await,
            Err(ValidationError::InterpreterUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_prepare_reports_unready_stage() {
        let ready = ValidationPipeline::from_stages(vec![Arc::new(MarkerStage::new(
            StageKind::Syntax,
            "X",
        ))]);
        assert!(ready.prepare().await.is_ok());

        let unready = ValidationPipeline::from_stages(vec![
            Arc::new(MarkerStage::new(StageKind::Syntax, "X")),
            Arc::new(UnreadyStage),
        ]);
        assert!(matches!(
            unready.prepare().await,
            Err(ValidationError::Sandbox(SandboxError::Setup(_)))
        ));
    }

    #[test]
    fn test_standard_pipeline_stages() {
        let config = PipelineConfig::default();
        assert_eq!(
            ValidationPipeline::new(&config).stage_kinds(),
            vec![StageKind::Syntax, StageKind::Style, StageKind::Execution]
        );

        let config = PipelineConfig {
            deep_analysis: true,
            ..PipelineConfig::default()
        };
        assert_eq!(
            ValidationPipeline::new(&config).stage_kinds(),
            StageKind::ALL.to_vec()
        );
        assert_eq!(
            ValidationPipeline::static_checks(&config).stage_kinds(),
            vec![StageKind::Syntax, StageKind::Style]
        );
    }

    #[test]
    fn test_rejection_display() {
        let r = Rejection::ExecutionFailed(ExecutionFailure {
            signal: ExecutionSignal::AssertionFailed,
            exit_code: Some(3),
            stdout: String::new(),
            stderr: "Traceback\nAssertionError: area\n\n".to_string(),
            duration_ms: 12,
        });
        assert_eq!(r.to_string(), "check failed: AssertionError: area");
        assert_eq!(r.stage(), StageKind::Execution);

        let r = Rejection::StyleViolation {
            violations: vec![Violation::new(2, 5, "E711", "comparison to None")],
        };
        assert_eq!(r.codes(), vec!["E711"]);
        assert!(r.to_string().contains("2:5: E711"));
    }
}
