//! Pattern schema definitions.
//!
//! A pattern is a parameterized Python template with named binding pools,
//! optional constraints, auxiliary imports, embedded checks and an instruction
//! template. Patterns are authored in YAML and validated structurally before
//! any generation happens.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PatternError;
use crate::pattern::constraints::Constraint;

/// Lowest permitted complexity rating.
pub const MIN_COMPLEXITY: u8 = 1;
/// Highest permitted complexity rating.
pub const MAX_COMPLEXITY: u8 = 5;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_]*)").expect("placeholder regex is valid")
});

/// Returns the placeholder names referenced by a template text, in order of
/// first appearance.
///
/// Only the leading identifier of each `{{ ... }}` expression counts, so
/// `{{ name | upper }}` references `name`.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    for caps in PLACEHOLDER_RE.captures_iter(text) {
        let name = caps[1].to_string();
        if seen.insert(name.clone()) {
            ordered.push(name);
        }
    }
    ordered
}

/// Normalizes an entry of a `requires` list into an import statement.
///
/// `numpy as np` becomes `import numpy as np`; entries already written as
/// `import ...` or `from ... import ...` are kept verbatim.
pub fn normalize_import(entry: &str) -> String {
    let trimmed = entry.trim();
    if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
        trimmed.to_string()
    } else {
        format!("import {}", trimmed)
    }
}

/// Pedagogical annotations carried into dataset records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pedagogy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_patterns: Vec<String>,
}

/// Descriptive metadata. Never affects generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub pedagogy: Pedagogy,
}

/// One entry of a binding pool.
///
/// The code template sees `value`; the instruction template sees `label`
/// when one is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBindingValue")]
pub struct BindingValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl BindingValue {
    /// Creates an unlabeled pool entry.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: None,
        }
    }

    /// Creates a pool entry with an instruction label.
    pub fn labeled(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: Some(label.into()),
        }
    }

    /// Text shown to the instruction template.
    pub fn display(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.value)
    }
}

impl From<&str> for BindingValue {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// YAML scalars accepted in pools. Numbers and booleans are rendered as the
/// equivalent Python literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub(crate) fn into_text(self) -> String {
        match self {
            Scalar::Bool(true) => "True".to_string(),
            Scalar::Bool(false) => "False".to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => format!("{:?}", f),
            Scalar::Text(s) => s,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawBindingValue {
    Labeled {
        value: Scalar,
        #[serde(default)]
        label: Option<String>,
    },
    Plain(Scalar),
}

impl From<RawBindingValue> for BindingValue {
    fn from(raw: RawBindingValue) -> Self {
        match raw {
            RawBindingValue::Labeled { value, label } => Self {
                value: value.into_text(),
                label,
            },
            RawBindingValue::Plain(value) => Self::new(value.into_text()),
        }
    }
}

/// A named section of a composite pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternPart {
    pub name: String,
    /// Imports needed by this part only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    pub template: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_complexity() -> u8 {
    MIN_COMPLEXITY
}

/// A parameterized code template with its binding pools, checks and
/// instruction template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique identifier.
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub category: String,
    /// Complexity rating, 1 through 5.
    #[serde(default = "default_complexity")]
    pub complexity: u8,
    #[serde(default)]
    pub metadata: PatternMetadata,
    /// Instruction template; placeholders see labels rather than values.
    pub instruction: String,
    /// Alternative phrasings, selected per assignment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instruction_variants: Vec<String>,
    /// Auxiliary imports, emitted once ahead of the code.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Code template for single-part patterns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Ordered sections for composite patterns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<PatternPart>,
    /// Placeholder name to ordered pool of legal values.
    #[serde(default)]
    pub bindings: BTreeMap<String, Vec<BindingValue>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    /// Python snippets run after the candidate; a failing assert rejects it.
    #[serde(default)]
    pub checks: Vec<String>,
}

impl Pattern {
    /// Creates a single-part pattern with no pools or checks.
    pub fn new(
        id: impl Into<String>,
        category: impl Into<String>,
        template: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            category: category.into(),
            complexity: MIN_COMPLEXITY,
            metadata: PatternMetadata::default(),
            instruction: instruction.into(),
            instruction_variants: Vec::new(),
            requires: Vec::new(),
            template: Some(template.into()),
            parts: Vec::new(),
            bindings: BTreeMap::new(),
            constraints: Vec::new(),
            checks: Vec::new(),
        }
    }

    /// Sets the complexity rating.
    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity;
        self
    }

    /// Adds a binding pool.
    pub fn with_binding<I, V>(mut self, placeholder: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<BindingValue>,
    {
        self.bindings
            .insert(placeholder.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Adds an auxiliary import.
    pub fn with_require(mut self, entry: impl Into<String>) -> Self {
        self.requires.push(entry.into());
        self
    }

    /// Adds a check snippet.
    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.checks.push(check.into());
        self
    }

    /// Adds a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Adds an instruction variant.
    pub fn with_instruction_variant(mut self, variant: impl Into<String>) -> Self {
        self.instruction_variants.push(variant.into());
        self
    }

    /// Returns the code templates in emission order with a location label.
    pub fn code_templates(&self) -> Vec<(String, &str)> {
        match &self.template {
            Some(t) => vec![("template".to_string(), t.as_str())],
            None => self
                .parts
                .iter()
                .map(|p| (format!("part '{}'", p.name), p.template.as_str()))
                .collect(),
        }
    }

    /// Placeholders referenced by the code (template or parts).
    pub fn code_placeholders(&self) -> BTreeSet<String> {
        self.code_templates()
            .into_iter()
            .flat_map(|(_, text)| placeholders(text))
            .collect()
    }

    /// Instruction templates: the main one followed by its variants.
    pub fn instruction_templates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.instruction.as_str())
            .chain(self.instruction_variants.iter().map(String::as_str))
    }

    /// Looks up a pool entry by placeholder and value.
    pub fn binding_value(&self, placeholder: &str, value: &str) -> Option<&BindingValue> {
        self.bindings
            .get(placeholder)?
            .iter()
            .find(|b| b.value == value)
    }

    /// Validates the pattern structure.
    ///
    /// Checks identifiers, version, complexity, the presence of exactly one of
    /// `template`/`parts`, placeholder/pool correspondence in both directions,
    /// pool contents, constraint references and template syntax.
    pub fn validate(&self) -> Result<(), PatternError> {
        self.validate_header()?;
        self.validate_pools()?;
        self.validate_placeholders()?;
        for constraint in &self.constraints {
            constraint.validate(self)?;
        }
        self.validate_template_syntax()
    }

    fn validate_header(&self) -> Result<(), PatternError> {
        let id_ok = !self.id.is_empty()
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !id_ok {
            return Err(PatternError::InvalidId(self.id.clone()));
        }

        if semver::Version::parse(&self.version).is_err() {
            return Err(PatternError::InvalidVersion {
                pattern: self.id.clone(),
                version: self.version.clone(),
            });
        }

        if !(MIN_COMPLEXITY..=MAX_COMPLEXITY).contains(&self.complexity) {
            return Err(PatternError::InvalidComplexity {
                pattern: self.id.clone(),
                value: self.complexity,
            });
        }

        if self.category.trim().is_empty() {
            return Err(self.missing("category"));
        }
        if self.instruction.trim().is_empty() {
            return Err(self.missing("instruction"));
        }

        match (&self.template, self.parts.is_empty()) {
            (Some(t), true) if !t.trim().is_empty() => {}
            (None, false) => {
                if let Some(part) = self.parts.iter().find(|p| p.template.trim().is_empty()) {
                    return Err(self.missing(&format!("parts.{}.template", part.name)));
                }
            }
            (Some(_), false) => {
                return Err(PatternError::ConflictingFields {
                    pattern: self.id.clone(),
                    first: "template".to_string(),
                    second: "parts".to_string(),
                })
            }
            _ => return Err(self.missing("template")),
        }

        if self.checks.iter().all(|c| c.trim().is_empty()) {
            return Err(self.missing("checks"));
        }

        Ok(())
    }

    fn validate_pools(&self) -> Result<(), PatternError> {
        for (placeholder, pool) in &self.bindings {
            if pool.is_empty() {
                return Err(PatternError::EmptyPool {
                    pattern: self.id.clone(),
                    placeholder: placeholder.clone(),
                });
            }
            let mut seen = BTreeSet::new();
            for entry in pool {
                if !seen.insert(entry.value.as_str()) {
                    return Err(PatternError::DuplicatePoolValue {
                        pattern: self.id.clone(),
                        placeholder: placeholder.clone(),
                        value: entry.value.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_placeholders(&self) -> Result<(), PatternError> {
        let mut referenced: Vec<(String, String)> = Vec::new();
        for (location, text) in self.code_templates() {
            referenced.extend(placeholders(text).into_iter().map(|p| (p, location.clone())));
        }
        for (i, check) in self.checks.iter().enumerate() {
            let location = format!("check #{}", i + 1);
            referenced.extend(placeholders(check).into_iter().map(|p| (p, location.clone())));
        }
        for text in self.instruction_templates() {
            referenced.extend(
                placeholders(text)
                    .into_iter()
                    .map(|p| (p, "instruction".to_string())),
            );
        }

        if let Some((placeholder, location)) = referenced
            .into_iter()
            .find(|(p, _)| !self.bindings.contains_key(p))
        {
            return Err(PatternError::UnboundPlaceholder {
                pattern: self.id.clone(),
                placeholder,
                location,
            });
        }

        let used = self.code_placeholders();
        if let Some(unused) = self.bindings.keys().find(|k| !used.contains(*k)) {
            return Err(PatternError::UnusedPool {
                pattern: self.id.clone(),
                placeholder: unused.clone(),
            });
        }

        Ok(())
    }

    fn validate_template_syntax(&self) -> Result<(), PatternError> {
        let mut tera = tera::Tera::default();
        let mut texts: Vec<(String, &str)> = self.code_templates();
        texts.extend(
            self.checks
                .iter()
                .enumerate()
                .map(|(i, c)| (format!("check #{}", i + 1), c.as_str())),
        );
        texts.extend(
            self.instruction_templates()
                .map(|t| ("instruction".to_string(), t)),
        );

        for (location, text) in texts {
            if let Err(e) = tera.add_raw_template("__syntax_check__", text) {
                return Err(PatternError::TemplateSyntax {
                    pattern: self.id.clone(),
                    location,
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    fn missing(&self, field: &str) -> PatternError {
        PatternError::MissingField {
            pattern: self.id.clone(),
            field: field.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle_area() -> Pattern {
        Pattern::new(
            "circle_area",
            "geometry",
            "def area(r):\n    return {{ factor }} * math.pi * r ** 2\n",
            "Write a function that returns {{ factor }} times the area of a circle.",
        )
        .with_require("math")
        .with_binding("factor", ["1.0", "2.0"])
        .with_check("assert abs(area(1) - math.pi) < 1e-9")
    }

    #[test]
    fn test_placeholders_in_order() {
        let found = placeholders("{{ b }} and {{a|upper}} then {{- b }}");
        assert_eq!(found, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_normalize_import() {
        assert_eq!(normalize_import("math"), "import math");
        assert_eq!(normalize_import("numpy as np"), "import numpy as np");
        assert_eq!(
            normalize_import("from collections import Counter"),
            "from collections import Counter"
        );
        assert_eq!(normalize_import(" import os "), "import os");
    }

    #[test]
    fn test_valid_pattern() {
        assert!(circle_area().validate().is_ok());
    }

    #[test]
    fn test_placeholder_without_pool_rejected() {
        let pattern = circle_area().with_check("assert {{ missing }}");
        match pattern.validate() {
            Err(PatternError::UnboundPlaceholder { placeholder, .. }) => {
                assert_eq!(placeholder, "missing")
            }
            other => panic!("expected UnboundPlaceholder, got {:?}", other),
        }
    }

    #[test]
    fn test_pool_without_placeholder_rejected() {
        let pattern = circle_area().with_binding("unused", ["x"]);
        assert!(matches!(
            pattern.validate(),
            Err(PatternError::UnusedPool { .. })
        ));
    }

    #[test]
    fn test_pool_used_only_in_instruction_is_unused() {
        let mut pattern = circle_area().with_binding("noun", ["circle"]);
        pattern.instruction = "Compute the area of a {{ noun }}.".to_string();
        assert!(matches!(
            pattern.validate(),
            Err(PatternError::UnusedPool { .. })
        ));
    }

    #[test]
    fn test_empty_and_duplicate_pools_rejected() {
        let empty = circle_area().with_binding("factor", Vec::<&str>::new());
        assert!(matches!(
            empty.validate(),
            Err(PatternError::EmptyPool { .. })
        ));

        let dup = circle_area().with_binding("factor", ["1.0", "1.0"]);
        assert!(matches!(
            dup.validate(),
            Err(PatternError::DuplicatePoolValue { .. })
        ));
    }

    #[test]
    fn test_missing_checks_rejected() {
        let mut pattern = circle_area();
        pattern.checks.clear();
        assert!(matches!(
            pattern.validate(),
            Err(PatternError::MissingField { field, .. }) if field == "checks"
        ));
    }

    #[test]
    fn test_bad_header_fields() {
        let mut pattern = circle_area();
        pattern.id = "bad id!".to_string();
        assert!(matches!(pattern.validate(), Err(PatternError::InvalidId(_))));

        let pattern = circle_area().with_complexity(9);
        assert!(matches!(
            pattern.validate(),
            Err(PatternError::InvalidComplexity { value: 9, .. })
        ));

        let mut pattern = circle_area();
        pattern.version = "one".to_string();
        assert!(matches!(
            pattern.validate(),
            Err(PatternError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_template_syntax_error() {
        let mut pattern = circle_area();
        pattern.template = Some("x = {{ factor \n".to_string());
        assert!(matches!(
            pattern.validate(),
            Err(PatternError::TemplateSyntax { .. })
        ));
    }

    #[test]
    fn test_deserialize_scalars_and_labels() {
        let yaml = r#"
id: scalars
category: basics
instruction: "Use {{ op }}"
template: "x = {{ op }}({{ n }}, {{ f }}, {{ flag }})"
bindings:
  op:
    - value: sorted
      label: the built-in sorted()
    - reversed
  n: [1, 2]
  f: [1.0, 2.5]
  flag: [true]
checks: ["assert True"]
"#;
        let pattern: Pattern = serde_yaml::from_str(yaml).expect("failed to parse");
        assert_eq!(pattern.version, "1.0.0");
        assert_eq!(pattern.complexity, 1);
        let op = &pattern.bindings["op"];
        assert_eq!(op[0], BindingValue::labeled("sorted", "the built-in sorted()"));
        assert_eq!(op[1].display(), "reversed");
        assert_eq!(pattern.bindings["n"][0].value, "1");
        assert_eq!(pattern.bindings["f"][0].value, "1.0");
        assert_eq!(pattern.bindings["f"][1].value, "2.5");
        assert_eq!(pattern.bindings["flag"][0].value, "True");
        assert!(pattern.validate().is_ok());
    }

    #[test]
    fn test_template_and_parts_exclusive() {
        let mut pattern = circle_area();
        pattern.parts.push(PatternPart {
            name: "extra".to_string(),
            requires: vec![],
            template: "pass".to_string(),
        });
        assert!(matches!(
            pattern.validate(),
            Err(PatternError::ConflictingFields { .. })
        ));
    }
}
