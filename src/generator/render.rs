//! Template rendering.
//!
//! Substitutes a binding assignment into the pattern's code template (or its
//! composite parts) and checks using Tera, and emits the merged auxiliary
//! imports once ahead of the code.

use std::collections::HashSet;
use std::error::Error as _;

use tera::{Context, Tera};

use crate::error::RenderError;
use crate::generator::{BindingAssignment, Result};
use crate::pattern::{normalize_import, Pattern};

/// Rendered code and checks for one assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSource {
    /// Imports followed by the code, ending in a single newline.
    pub source: String,
    pub checks: Vec<String>,
}

/// Deterministic renderer for pattern templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Renders the pattern's code and checks with the given assignment.
    ///
    /// # Errors
    ///
    /// - [`RenderError::MissingBinding`] if a code placeholder has no value
    /// - [`RenderError::UnexpectedBinding`] if a value has no code placeholder
    /// - [`RenderError::Template`] if Tera fails to render
    pub fn render(&self, pattern: &Pattern, assignment: &BindingAssignment) -> Result<RenderedSource> {
        let expected = pattern.code_placeholders();

        if let Some(missing) = expected.iter().find(|p| assignment.get(p).is_none()) {
            return Err(RenderError::MissingBinding {
                pattern: pattern.id.clone(),
                placeholder: missing.clone(),
            });
        }
        if let Some(extra) = assignment.placeholders().find(|p| !expected.contains(*p)) {
            return Err(RenderError::UnexpectedBinding {
                pattern: pattern.id.clone(),
                placeholder: extra.to_string(),
            });
        }

        let mut context = Context::new();
        for (placeholder, value) in assignment.iter() {
            context.insert(placeholder, value);
        }

        let mut sections = Vec::new();
        for (location, text) in pattern.code_templates() {
            let rendered = render_text(pattern, &location, text, &context)?;
            let trimmed = rendered.trim_matches('\n');
            if !trimmed.trim().is_empty() {
                sections.push(trimmed.trim_end().to_string());
            }
        }

        let imports = merged_imports(pattern);
        let mut source = String::new();
        if !imports.is_empty() {
            source.push_str(&imports.join("\n"));
            source.push_str("\n\n");
        }
        source.push_str(&sections.join("\n\n"));
        source.push('\n');

        let checks = pattern
            .checks
            .iter()
            .enumerate()
            .map(|(i, check)| {
                render_text(pattern, &format!("check #{}", i + 1), check, &context)
                    .map(|c| c.trim().to_string())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RenderedSource { source, checks })
    }
}

/// Imports of the pattern followed by those of each part, normalized and
/// de-duplicated in declaration order.
pub fn merged_imports(pattern: &Pattern) -> Vec<String> {
    let mut seen = HashSet::new();
    pattern
        .requires
        .iter()
        .chain(pattern.parts.iter().flat_map(|p| p.requires.iter()))
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| normalize_import(entry))
        .filter(|import| seen.insert(import.clone()))
        .collect()
}

pub(crate) fn render_text(
    pattern: &Pattern,
    location: &str,
    text: &str,
    context: &Context,
) -> Result<String> {
    Tera::one_off(text, context, false).map_err(|e| RenderError::Template {
        pattern: pattern.id.clone(),
        location: location.to_string(),
        message: error_chain(&e),
    })
}

/// Flattens a Tera error and its causes into one line.
pub(crate) fn error_chain(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
