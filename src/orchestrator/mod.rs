//! Generation orchestration.
//!
//! This module runs the generation loop: it picks patterns round-robin,
//! draws binding assignments, renders candidates, validates them and
//! forwards accepted samples to a [`DatasetSink`](crate::sink::DatasetSink).
//!
//! # Lifecycle
//!
//! Each pattern starts `Active` and ends `Exhausted` (no fresh assignment or
//! attempt budget spent), `QuotaReached` (contributed its share) or
//! `Malformed` (failed to render). A run ends `Completed` when the target is
//! reached, `Starved` when every pattern is terminal first, or `Aborted` on
//! cancellation or a fatal sink or pipeline error.
//!
//! # Example
//!
//! ```rust,ignore
//! use pattern_forge::orchestrator::{GenerationConfig, GenerationOrchestrator, QuotaCeiling};
//! use pattern_forge::pattern::PatternRegistry;
//! use pattern_forge::sink::JsonlSink;
//!
//! let mut registry = PatternRegistry::new();
//! registry.load_directory("patterns/")?;
//!
//! let config = GenerationConfig::new()
//!     .with_target(500)
//!     .with_quota(QuotaCeiling::Fraction(0.2));
//! let orchestrator = GenerationOrchestrator::new(config)?;
//!
//! let mut sink = JsonlSink::create("dataset.jsonl").await?;
//! let report = orchestrator.run(registry.into_patterns(), &mut sink).await?;
//! println!("{}", report.summary());
//! ```

pub mod config;
pub mod engine;
pub mod report;
pub mod state;

pub use config::{parse_quota, GenerationConfig, QuotaCeiling};
pub use engine::{CancellationHandle, GenerationOrchestrator};
pub use report::{
    diagnostics_channel, AbortReason, DiagnosticsSender, PatternReport, PatternWarning,
    RejectionRecord, RunOutcome, RunReport,
};
pub use state::{GenerationState, Integration, PatternProgress, PatternStatus};
