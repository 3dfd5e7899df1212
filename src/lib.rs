//! pattern-forge: combinatorial generator of validated Python training samples.
//!
//! Human-authored patterns (a code template plus closed pools of legal
//! substitution values) are expanded into many distinct samples. Each sample
//! is paired with an instruction built from the same bindings and must pass
//! a fail-fast validation pipeline (syntax, style, optional deep analysis,
//! sandboxed execution with embedded checks) before it reaches the dataset.

// Core modules
pub mod cli;
pub mod error;
pub mod generator;
pub mod metrics;
pub mod orchestrator;
pub mod pattern;
pub mod sandbox;
pub mod sink;
pub mod validation;

// Re-export commonly used types
pub use error::{
    ConfigError, PatternError, RenderError, RunError, SandboxError, SinkError, ValidationError,
};
pub use generator::{BindingAssignment, CandidateSample, SampleGenerator};
pub use orchestrator::{GenerationConfig, GenerationOrchestrator, RunOutcome, RunReport};
pub use pattern::{Pattern, PatternRegistry};
pub use sink::{DatasetRecord, DatasetSink, JsonlSink, MemorySink};
pub use validation::{ValidationPipeline, Verdict};
