//! Style stage: a built-in lint profile.
//!
//! Implements a subset of the pycodestyle (`E`/`W`) and pyflakes (`F`) rules
//! that matter for short training samples. Physical-line rules read the text;
//! everything else walks the tree-sitter syntax tree, so strings, docstrings
//! and comments never count as code. All violations are collected; the
//! rejection lists every one of them.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tree_sitter::Node;

use crate::error::ValidationError;
use crate::generator::CandidateSample;
use crate::validation::names::check_names;
use crate::validation::tree::{code_children, descendants, in_import, is_member_name, PythonSource};
use crate::validation::{Rejection, StageKind, StageOutcome, ValidationStage, Violation};

/// Codes ignored unless explicitly enabled.
pub const DEFAULT_IGNORE: [&str; 3] = ["E501", "W292", "F841"];

/// Lint rule selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleProfile {
    /// Codes that are never reported.
    pub ignore: BTreeSet<String>,
    /// Limit for `E501`.
    pub max_line_length: usize,
}

impl Default for StyleProfile {
    fn default() -> Self {
        Self {
            ignore: DEFAULT_IGNORE.iter().map(|c| c.to_string()).collect(),
            max_line_length: 79,
        }
    }
}

impl StyleProfile {
    /// Adds a code to the ignore list.
    pub fn with_ignore(mut self, code: impl Into<String>) -> Self {
        self.ignore.insert(code.into());
        self
    }

    /// Removes a code from the ignore list.
    pub fn with_enabled(mut self, code: &str) -> Self {
        self.ignore.remove(code);
        self
    }

    pub fn is_enabled(&self, code: &str) -> bool {
        !self.ignore.contains(code)
    }

    /// Lints a source text, returning violations ordered by position.
    pub fn check(&self, text: &str) -> Result<Vec<Violation>, ValidationError> {
        let source = PythonSource::parse(text)?;
        let mut found = Vec::new();

        let in_strings = source.string_continuation_lines();
        for (idx, raw) in text.lines().enumerate() {
            let number = idx + 1;
            self.physical_rules(raw, number, in_strings.contains(&number), &mut found);
        }
        file_rules(text, &mut found);

        for node in descendants(source.root()) {
            node_rules(&source, node, &mut found);
        }
        unused_imports(&source, &mut found);
        check_names(&source, &mut found);

        found.retain(|v| self.is_enabled(&v.code));
        found.sort_by(|a, b| (a.line, a.column, &a.code).cmp(&(b.line, b.column, &b.code)));
        Ok(found)
    }

    fn physical_rules(&self, raw: &str, n: usize, in_string: bool, out: &mut Vec<Violation>) {
        if !in_string {
            let leading: String = raw.chars().take_while(|c| c.is_whitespace()).collect();
            if leading.contains('\t') && !raw.trim().is_empty() {
                out.push(Violation::new(n, 1, "W191", "indentation contains tabs"));
            }
        }

        let trimmed_len = raw.trim_end().chars().count();
        let total_len = raw.chars().count();
        if trimmed_len < total_len {
            if trimmed_len == 0 {
                out.push(Violation::new(n, 1, "W293", "whitespace on blank line"));
            } else {
                out.push(Violation::new(n, trimmed_len + 1, "W291", "trailing whitespace"));
            }
        }

        if total_len > self.max_line_length {
            out.push(Violation::new(
                n,
                self.max_line_length + 1,
                "E501",
                format!("line too long ({} > {} characters)", total_len, self.max_line_length),
            ));
        }
    }
}

fn file_rules(text: &str, out: &mut Vec<Violation>) {
    if text.is_empty() {
        return;
    }
    let lines: Vec<&str> = text.lines().collect();
    if !text.ends_with('\n') {
        let last = lines.len().max(1);
        let width = lines.last().map(|l| l.chars().count()).unwrap_or(0);
        out.push(Violation::new(last, width + 1, "W292", "no newline at end of file"));
        return;
    }
    let trailing = lines.iter().rev().take_while(|l| l.trim().is_empty()).count();
    if trailing > 0 && trailing < lines.len() {
        let first_blank = lines.len() - trailing + 1;
        out.push(Violation::new(first_blank, 1, "W391", "blank line at end of file"));
    }
}

/// Rules that look at a single syntax node.
fn node_rules(source: &PythonSource<'_>, node: Node<'_>, out: &mut Vec<Violation>) {
    match node.kind() {
        ";" => {
            let (line, column) = source.position(node);
            let mut next = node.next_sibling();
            while let Some(sibling) = next.filter(|s| s.kind() == "comment") {
                next = sibling.next_sibling();
            }
            let same_line = next.is_some_and(|s| s.start_position().row == node.start_position().row);
            if same_line {
                out.push(Violation::new(
                    line,
                    column,
                    "E702",
                    "multiple statements on one line (semicolon)",
                ));
            } else {
                out.push(Violation::new(line, column, "E703", "statement ends with a semicolon"));
            }
        }
        "comparison_operator" => comparison_rules(source, node, out),
        "except_clause" => {
            let children = code_children(node);
            if children.iter().all(|c| c.kind() == "block") {
                let (line, column) = source.position(node);
                out.push(Violation::new(line, column, "E722", "do not use bare 'except'"));
            }
        }
        "assignment" => {
            let lambda_bound = node.parent().is_some_and(|p| p.kind() == "expression_statement")
                && node.child_by_field_name("left").is_some_and(|l| l.kind() == "identifier")
                && node.child_by_field_name("right").is_some_and(|r| r.kind() == "lambda");
            if lambda_bound {
                let (line, column) = source.position(node);
                out.push(Violation::new(
                    line,
                    column,
                    "E731",
                    "do not assign a lambda expression, use a def",
                ));
            }
        }
        "import_statement" => {
            let mut cursor = node.walk();
            if node.children_by_field_name("name", &mut cursor).count() > 1 {
                let (line, column) = source.position(node);
                out.push(Violation::new(line, column, "E401", "multiple imports on one line"));
            }
        }
        "import_from_statement" => {
            if code_children(node).iter().any(|c| c.kind() == "wildcard_import") {
                let module = source.field_text(node, "module_name").unwrap_or("");
                let (line, column) = source.position(node);
                out.push(Violation::new(
                    line,
                    column,
                    "F403",
                    format!("'from {} import *' used; unable to detect undefined names", module),
                ));
            }
        }
        _ => {}
    }
}

/// E711/E712: `==` or `!=` against a `None`, `True` or `False` literal.
fn comparison_rules(source: &PythonSource<'_>, node: Node<'_>, out: &mut Vec<Violation>) {
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    for (i, op) in children.iter().enumerate() {
        if !matches!(op.kind(), "==" | "!=") {
            continue;
        }
        let neighbours = [i.checked_sub(1), Some(i + 1)];
        let literal = neighbours
            .into_iter()
            .flatten()
            .filter_map(|j| children.get(j))
            .find(|n| matches!(n.kind(), "none" | "true" | "false"));
        let Some(literal) = literal else {
            continue;
        };
        let (line, column) = source.position(*op);
        let violation = match literal.kind() {
            "none" => {
                let replacement = if op.kind() == "==" { "is" } else { "is not" };
                Violation::new(
                    line,
                    column,
                    "E711",
                    format!("comparison to None should be '{} None'", replacement),
                )
            }
            _ => {
                let value = source.node_text(*literal);
                Violation::new(
                    line,
                    column,
                    "E712",
                    format!("comparison to {} should be 'if cond is {}:' or 'if cond:'", value, value),
                )
            }
        };
        out.push(violation);
    }
}

/// A name bound by an import statement.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ImportedName {
    line: usize,
    column: usize,
    /// Name the statement binds in the module namespace.
    bound: String,
    /// How the import is displayed in the message.
    display: String,
}

fn imported_names(source: &PythonSource<'_>, statement: Node<'_>) -> Vec<ImportedName> {
    let (line, column) = source.position(statement);
    let from_module = match statement.kind() {
        "import_statement" => None,
        "import_from_statement" => Some(source.field_text(statement, "module_name").unwrap_or("")),
        _ => return Vec::new(),
    };

    let mut cursor = statement.walk();
    let items: Vec<Node<'_>> = statement.children_by_field_name("name", &mut cursor).collect();
    let mut names = Vec::new();
    for item in items {
        let (name, alias) = match item.kind() {
            "aliased_import" => (
                source.field_text(item, "name").unwrap_or(""),
                source.field_text(item, "alias"),
            ),
            _ => (source.node_text(item), None),
        };
        let bound = match (alias, from_module) {
            (Some(alias), _) => alias.to_string(),
            (None, Some(_)) => name.to_string(),
            (None, None) => name.split('.').next().unwrap_or(name).to_string(),
        };
        let qualified = match from_module {
            Some(module) if module.ends_with('.') => format!("{}{}", module, name),
            Some(module) => format!("{}.{}", module, name),
            None => name.to_string(),
        };
        let display = match alias {
            Some(alias) => format!("{} as {}", qualified, alias),
            None => qualified,
        };
        names.push(ImportedName {
            line,
            column,
            bound,
            display,
        });
    }
    names
}

/// F401: imports whose bound name is never read outside import statements.
fn unused_imports(source: &PythonSource<'_>, out: &mut Vec<Violation>) {
    let nodes = descendants(source.root());
    let used: HashSet<&str> = nodes
        .iter()
        .filter(|n| n.kind() == "identifier" && !in_import(**n) && !is_member_name(**n))
        .map(|n| source.node_text(*n))
        .collect();

    for statement in nodes
        .iter()
        .filter(|n| matches!(n.kind(), "import_statement" | "import_from_statement"))
    {
        for name in imported_names(source, *statement) {
            if !used.contains(name.bound.as_str()) {
                out.push(Violation::new(
                    name.line,
                    name.column,
                    "F401",
                    format!("'{}' imported but unused", name.display),
                ));
            }
        }
    }
}

/// Rejects candidates with any enabled style violation.
#[derive(Debug, Clone, Default)]
pub struct StyleStage {
    profile: StyleProfile,
}

impl StyleStage {
    pub fn new(profile: StyleProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl ValidationStage for StyleStage {
    fn kind(&self) -> StageKind {
        StageKind::Style
    }

    async fn check(&self, candidate: &CandidateSample) -> Result<StageOutcome, ValidationError> {
        let violations = self.profile.check(&candidate.source)?;
        if violations.is_empty() {
            Ok(StageOutcome::Pass)
        } else {
            Ok(StageOutcome::Reject(Rejection::StyleViolation { violations }))
        }
    }
}
