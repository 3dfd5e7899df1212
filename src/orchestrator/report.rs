//! Run reports and rejection diagnostics.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::generator::resolver::ExhaustionReason;
use crate::generator::BindingAssignment;
use crate::orchestrator::state::{PatternProgress, PatternStatus};
use crate::validation::{Rejection, StageKind};

/// Why a run stopped before reaching a natural end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    SinkFailure,
    ValidationFailure,
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The target number of samples was accepted.
    Completed,
    /// Every pattern became terminal before the target was reached.
    Starved,
    Aborted { reason: AbortReason },
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Starved => "starved",
            RunOutcome::Aborted { .. } => "aborted",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Aborted { reason } => write!(f, "aborted ({:?})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Per-pattern summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternReport {
    pub pattern_id: String,
    pub category: String,
    pub status: PatternStatus,
    pub attempts: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    /// Distinct assignments drawn.
    pub drawn: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rejected_by_stage: BTreeMap<StageKind, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exhaustion: Option<String>,
}

impl From<&PatternProgress> for PatternReport {
    fn from(progress: &PatternProgress) -> Self {
        Self {
            pattern_id: progress.pattern.id.clone(),
            category: progress.pattern.category.clone(),
            status: progress.status,
            attempts: progress.attempts,
            accepted: progress.accepted,
            rejected: progress.rejected,
            duplicates: progress.duplicates,
            drawn: progress.drawn.len(),
            rejected_by_stage: progress.rejected_by_stage.clone(),
            exhaustion: progress.exhaustion.map(|reason| match reason {
                ExhaustionReason::SpaceExhausted => "binding space exhausted".to_string(),
                ExhaustionReason::DrawBudgetSpent { draws } => {
                    format!("no fresh assignment after {} draws", draws)
                }
            }),
        }
    }
}

/// A pattern left out of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternWarning {
    pub pattern_id: String,
    pub message: String,
}

/// Summary of a generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub target: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub rejected_by_stage: BTreeMap<StageKind, usize>,
    pub patterns: Vec<PatternReport>,
    /// Patterns that were malformed or failed to render.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<PatternWarning>,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Builds a report from per-pattern progress.
    pub fn from_progress<'a, I>(run_id: &str, target: usize, seed: u64, progress: I) -> Self
    where
        I: IntoIterator<Item = &'a PatternProgress>,
    {
        let patterns: Vec<PatternReport> = progress.into_iter().map(PatternReport::from).collect();
        let mut rejected_by_stage = BTreeMap::new();
        for p in &patterns {
            for (stage, n) in &p.rejected_by_stage {
                *rejected_by_stage.entry(*stage).or_insert(0) += n;
            }
        }
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            outcome: RunOutcome::Completed,
            target,
            accepted: patterns.iter().map(|p| p.accepted).sum(),
            rejected: patterns.iter().map(|p| p.rejected).sum(),
            duplicates: patterns.iter().map(|p| p.duplicates).sum(),
            rejected_by_stage,
            patterns,
            warnings: Vec::new(),
            seed,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Human-readable multi-line summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Run {}: {} ({}/{} accepted, {} rejected, {} duplicates, {:.1}s)\n",
            self.run_id,
            self.outcome,
            self.accepted,
            self.target,
            self.rejected,
            self.duplicates,
            self.duration_secs()
        );
        if !self.rejected_by_stage.is_empty() {
            let stages: Vec<String> = self
                .rejected_by_stage
                .iter()
                .map(|(stage, n)| format!("{}={}", stage, n))
                .collect();
            out.push_str(&format!("  rejected by stage: {}\n", stages.join(", ")));
        }
        for p in &self.patterns {
            out.push_str(&format!(
                "  {:<32} {:<13} accepted={} rejected={} duplicates={} drawn={}\n",
                p.pattern_id, p.status, p.accepted, p.rejected, p.duplicates, p.drawn
            ));
        }
        for w in &self.warnings {
            out.push_str(&format!("  warning: {}: {}\n", w.pattern_id, w.message));
        }
        out
    }
}

/// A rejected candidate, as reported on the diagnostics channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub pattern_id: String,
    pub assignment: BindingAssignment,
    pub stage: StageKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

pub type DiagnosticsSender = mpsc::UnboundedSender<RejectionRecord>;

/// Creates a diagnostics channel.
///
/// Pass the sender to the orchestrator and consume the stream elsewhere.
/// The stream ends once the orchestrator is dropped.
pub fn diagnostics_channel() -> (DiagnosticsSender, UnboundedReceiverStream<RejectionRecord>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx))
}
