//! Error types for pattern-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Pattern loading and structural validation
//! - Rendering of code, checks and instructions
//! - Validation infrastructure (interpreter, sandbox)
//! - Dataset persistence
//! - Run configuration and the generation run itself
//!
//! Candidate-level rejections (syntax, style, deep analysis, execution) are not
//! errors: they are carried by [`crate::validation::Verdict`].

use thiserror::Error;

use crate::orchestrator::RunReport;

/// Structural defects in a pattern definition.
///
/// Any of these makes the pattern unusable; the run skips it and reports a warning.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("Pattern '{0}' not found in registry")]
    NotFound(String),

    #[error("Failed to parse pattern file '{path}': {message}")]
    ParseError { path: String, message: String },

    #[error("Invalid pattern ID '{0}': must be non-empty and contain only alphanumeric characters, hyphens, and underscores")]
    InvalidId(String),

    #[error("Invalid version '{version}' for pattern '{pattern}': must follow semantic versioning")]
    InvalidVersion { pattern: String, version: String },

    #[error("Pattern '{pattern}': complexity must be between 1 and 5, got {value}")]
    InvalidComplexity { pattern: String, value: u8 },

    #[error("Missing required field '{field}' in pattern '{pattern}'")]
    MissingField { pattern: String, field: String },

    #[error("Pattern '{pattern}': placeholder '{placeholder}' in {location} has no binding pool")]
    UnboundPlaceholder {
        pattern: String,
        placeholder: String,
        location: String,
    },

    #[error("Pattern '{pattern}': binding pool '{placeholder}' is not referenced by the template")]
    UnusedPool { pattern: String, placeholder: String },

    #[error("Pattern '{pattern}': binding pool '{placeholder}' is empty")]
    EmptyPool { pattern: String, placeholder: String },

    #[error("Pattern '{pattern}': binding pool '{placeholder}' lists '{value}' more than once")]
    DuplicatePoolValue {
        pattern: String,
        placeholder: String,
        value: String,
    },

    #[error("Pattern '{pattern}': fields '{first}' and '{second}' are mutually exclusive")]
    ConflictingFields {
        pattern: String,
        first: String,
        second: String,
    },

    #[error("Pattern '{pattern}': invalid constraint: {message}")]
    InvalidConstraint { pattern: String, message: String },

    #[error("Pattern '{pattern}': template syntax error in {location}: {message}")]
    TemplateSyntax {
        pattern: String,
        location: String,
        message: String,
    },

    #[error("Duplicate pattern ID '{0}'")]
    DuplicateId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Errors raised while rendering a candidate from a binding assignment.
///
/// Both directions of a placeholder/value mismatch are surfaced; they indicate
/// a malformed pattern, never a bad candidate.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Pattern '{pattern}': placeholder '{placeholder}' has no value in the binding assignment")]
    MissingBinding { pattern: String, placeholder: String },

    #[error("Pattern '{pattern}': binding '{placeholder}' does not appear in the template")]
    UnexpectedBinding { pattern: String, placeholder: String },

    #[error("Pattern '{pattern}': failed to render {location}: {message}")]
    Template {
        pattern: String,
        location: String,
        message: String,
    },
}

/// Errors from the sandboxed subprocess runner.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox setup failed: {0}")]
    Setup(String),

    #[error("Failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Process wait failed: {0}")]
    Wait(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Infrastructure failures of the validation pipeline.
///
/// These are not verdicts about a candidate; they mean the pipeline itself could
/// not run and the generation run must stop.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Interpreter unavailable: {0}")]
    InterpreterUnavailable(String),

    #[error("Parser produced unexpected output: {0}")]
    ParserProtocol(String),

    #[error("Python grammar unavailable: {0}")]
    Grammar(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a dataset sink. Always fatal for the run.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Failed to write dataset record: {0}")]
    Write(String),

    #[error("Sink is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors in the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Fatal errors that end a generation run.
///
/// Variants raised after the run started carry the partial report so callers can
/// still account for what was accepted before the failure.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dataset sink failed: {source}")]
    Sink {
        #[source]
        source: SinkError,
        report: Box<RunReport>,
    },

    #[error("Validation infrastructure failed: {source}")]
    Validation {
        #[source]
        source: ValidationError,
        report: Box<RunReport>,
    },
}

impl RunError {
    /// Returns the partial run report, if the run had started.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            RunError::Config(_) => None,
            RunError::Sink { report, .. } | RunError::Validation { report, .. } => Some(report),
        }
    }
}
