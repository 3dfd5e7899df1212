//! Candidate generation from patterns.
//!
//! This module turns a pattern into concrete candidate samples:
//!
//! 1. **Binding Resolution** - Choosing one pool value per placeholder, under constraints,
//!    without repeating an assignment already drawn in the run
//! 2. **Rendering** - Substituting the assignment into the code template and checks, with
//!    auxiliary imports merged ahead of the code
//! 3. **Instruction Synthesis** - Deriving the instruction from the same assignment
//!
//! # Example
//!
//! ```ignore
//! use pattern_forge::generator::{BindingResolver, Resolution, SampleGenerator};
//!
//! let resolver = BindingResolver::default();
//! let mut rng = ChaCha8Rng::seed_from_u64(42);
//! if let Resolution::Assigned(assignment) = resolver.resolve(&pattern, &drawn, &mut rng) {
//!     let candidate = SampleGenerator::new().generate(&pattern, assignment)?;
//!     println!("{}", candidate.source);
//! }
//! ```

pub mod instruction;
pub mod render;
pub mod resolver;

pub use instruction::InstructionSynthesizer;
pub use render::{RenderedSource, TemplateRenderer};
pub use resolver::{BindingResolver, ExhaustionReason, Resolution};

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RenderError;
use crate::pattern::Pattern;

/// Result type alias for generator operations.
pub type Result<T> = std::result::Result<T, RenderError>;

/// One chosen value per placeholder, ordered by placeholder name.
///
/// Equality is value equality, so two draws of the same combination compare
/// equal regardless of how they were produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindingAssignment(BTreeMap<String, String>);

impl BindingAssignment {
    /// Creates an empty assignment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value of a placeholder.
    pub fn insert(&mut self, placeholder: impl Into<String>, value: impl Into<String>) {
        self.0.insert(placeholder.into(), value.into());
    }

    /// Returns the value bound to a placeholder.
    pub fn get(&self, placeholder: &str) -> Option<&str> {
        self.0.get(placeholder).map(String::as_str)
    }

    /// Iterates over `(placeholder, value)` pairs in placeholder order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the placeholder names.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrows the underlying map.
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Stable SHA-256 digest of the assignment.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (k, v) in &self.0 {
            hasher.update(k.as_bytes());
            hasher.update([0x1f]);
            hasher.update(v.as_bytes());
            hasher.update([0x1e]);
        }
        hasher.finalize().into()
    }
}

impl FromIterator<(String, String)> for BindingAssignment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for BindingAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}

/// Content fingerprint of rendered source.
///
/// Line endings are normalized and trailing whitespace is ignored, so sources
/// that differ only in invisible whitespace collide.
pub fn source_fingerprint(source: &str) -> String {
    let unified = source.replace("\r\n", "\n");
    let lines: Vec<&str> = unified.lines().map(str::trim_end).collect();
    let text = lines.join("\n");

    let mut hasher = Sha256::new();
    hasher.update(text.trim_end().as_bytes());
    hex::encode(hasher.finalize())
}

/// A rendered, not yet validated, sample.
///
/// Immutable once built; consumed by the validation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSample {
    pub pattern_id: String,
    pub category: String,
    pub complexity: u8,
    pub assignment: BindingAssignment,
    /// Complete Python source, imports first.
    pub source: String,
    /// Check snippets rendered with the same assignment.
    pub checks: Vec<String>,
    pub instruction: String,
    pub fingerprint: String,
}

/// Combines rendering and instruction synthesis into candidate construction.
#[derive(Debug, Clone, Default)]
pub struct SampleGenerator {
    renderer: TemplateRenderer,
    synthesizer: InstructionSynthesizer,
}

impl SampleGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a candidate sample for the given assignment.
    ///
    /// # Errors
    ///
    /// Returns a [`RenderError`] if the assignment does not match the
    /// pattern's placeholders or a template fails to render. Either means the
    /// pattern itself is malformed.
    pub fn generate(
        &self,
        pattern: &Pattern,
        assignment: BindingAssignment,
    ) -> Result<CandidateSample> {
        let rendered = self.renderer.render(pattern, &assignment)?;
        let instruction = self.synthesizer.synthesize(pattern, &assignment)?;
        let fingerprint = source_fingerprint(&rendered.source);

        Ok(CandidateSample {
            pattern_id: pattern.id.clone(),
            category: pattern.category.clone(),
            complexity: pattern.complexity,
            assignment,
            source: rendered.source,
            checks: rendered.checks,
            instruction,
            fingerprint,
        })
    }
}
