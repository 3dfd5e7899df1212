//! Instruction synthesis.
//!
//! The instruction is derived from the instruction template(s) and the binding
//! assignment only, never from rendered code, so it always describes exactly
//! the bindings that produced the sample.

use tera::Context;

use crate::generator::render::render_text;
use crate::generator::{BindingAssignment, Result};
use crate::pattern::Pattern;

/// Pure, deterministic instruction builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstructionSynthesizer;

impl InstructionSynthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Builds the instruction for an assignment.
    ///
    /// When the pattern declares `instruction_variants`, the phrasing is chosen
    /// from the main instruction and its variants by the assignment's digest.
    /// Placeholders see a pool entry's label when one is set.
    pub fn synthesize(&self, pattern: &Pattern, assignment: &BindingAssignment) -> Result<String> {
        let templates: Vec<&str> = pattern.instruction_templates().collect();
        let index = if templates.len() > 1 {
            let digest = assignment.digest();
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&digest[..8]);
            (u64::from_be_bytes(prefix) % templates.len() as u64) as usize
        } else {
            0
        };

        let mut context = Context::new();
        for (placeholder, value) in assignment.iter() {
            let shown = pattern
                .binding_value(placeholder, value)
                .map(|b| b.display())
                .unwrap_or(value);
            context.insert(placeholder, shown);
        }

        let rendered = render_text(pattern, "instruction", templates[index], &context)?;
        Ok(normalize_whitespace(&rendered))
    }
}

/// Trims the text, strips trailing spaces and collapses runs of blank lines
/// to a single blank line.
fn normalize_whitespace(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = 0;
    for line in text.trim().lines().map(str::trim_end) {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(line);
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::BindingValue;

    fn assignment(pairs: &[(&str, &str)]) -> BindingAssignment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sorter() -> Pattern {
        Pattern::new(
            "sorter",
            "lists",
            "result = {{ op }}(items)",
            "  Sort the list using {{ op }}.  \n\n\n\nKeep it short.\n",
        )
        .with_binding(
            "op",
            [
                BindingValue::labeled("sorted", "the built-in sorted()"),
                BindingValue::new("reversed"),
            ],
        )
        .with_check("assert result is not None")
    }

    #[test]
    fn test_labels_and_whitespace() {
        let synth = InstructionSynthesizer::new();
        let text = synth
            .synthesize(&sorter(), &assignment(&[("op", "sorted")]))
            .expect("synthesis failed");
        assert_eq!(text, "Sort the list using the built-in sorted().\n\nKeep it short.");

        let text = synth
            .synthesize(&sorter(), &assignment(&[("op", "reversed")]))
            .expect("synthesis failed");
        assert!(text.starts_with("Sort the list using reversed."));
    }

    #[test]
    fn test_variant_choice_is_deterministic() {
        let pattern = sorter()
            .with_instruction_variant("Use {{ op }} to order the list.")
            .with_instruction_variant("Order items with {{ op }}.");
        let synth = InstructionSynthesizer::new();
        let a = assignment(&[("op", "reversed")]);

        let first = synth.synthesize(&pattern, &a).expect("synthesis failed");
        for _ in 0..5 {
            assert_eq!(synth.synthesize(&pattern, &a).expect("synthesis failed"), first);
        }
        assert!(first.contains("reversed"));
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  a  \n\n\n\nb\n\n"), "a\n\nb");
        assert_eq!(normalize_whitespace("single"), "single");
    }
}
