//! Python concrete syntax trees for the lint stages.
//!
//! Sources are parsed with tree-sitter's Python grammar. Rules walk the tree
//! instead of the text, so names inside strings, docstrings and comments are
//! never mistaken for code.

use std::collections::HashSet;

use tree_sitter::{Node, Parser, Tree};

use crate::error::ValidationError;

/// A parsed Python source text.
pub struct PythonSource<'s> {
    text: &'s str,
    tree: Tree,
}

impl<'s> PythonSource<'s> {
    pub fn parse(text: &'s str) -> Result<Self, ValidationError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| ValidationError::Grammar(e.to_string()))?;
        let tree = parser
            .parse(text, None)
            .ok_or_else(|| ValidationError::Grammar("parser produced no tree".to_string()))?;
        Ok(Self { text, tree })
    }

    pub fn text(&self) -> &'s str {
        self.text
    }

    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    /// Whether the parser had to recover from errors.
    pub fn has_errors(&self) -> bool {
        self.root().has_error()
    }

    /// Source text covered by a node.
    pub fn node_text(&self, node: Node<'_>) -> &'s str {
        node.utf8_text(self.text.as_bytes()).unwrap_or("")
    }

    /// Text of a node's field child, if present.
    pub fn field_text(&self, node: Node<'_>, field: &str) -> Option<&'s str> {
        node.child_by_field_name(field).map(|n| self.node_text(n))
    }

    /// 1-based line and character column where a node starts.
    pub fn position(&self, node: Node<'_>) -> (usize, usize) {
        let point = node.start_position();
        let start = node.start_byte();
        let column = self
            .text
            .get(start - point.column..start)
            .map(|prefix| prefix.chars().count())
            .unwrap_or(point.column);
        (point.row + 1, column + 1)
    }

    /// 1-based numbers of the lines that begin inside a multi-line string.
    pub fn string_continuation_lines(&self) -> HashSet<usize> {
        let mut lines = HashSet::new();
        for node in descendants(self.root()) {
            if node.kind() != "string" {
                continue;
            }
            let first = node.start_position().row;
            let last = node.end_position().row;
            // Rows are 0-based; a row after `first` starts inside the string.
            lines.extend((first + 1..=last).map(|row| row + 1));
        }
        lines
    }
}

/// Every node under `root`, including `root`, in document order.
pub fn descendants(root: Node<'_>) -> Vec<Node<'_>> {
    let mut nodes = Vec::new();
    let mut cursor = root.walk();
    loop {
        nodes.push(cursor.node());
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return nodes;
            }
        }
    }
}

/// Named children of a node, comments excluded.
pub fn code_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|child| child.kind() != "comment")
        .collect()
}

/// Whether a node lies inside an import statement.
pub fn in_import(node: Node<'_>) -> bool {
    let mut current = node.parent();
    while let Some(parent) = current {
        if matches!(
            parent.kind(),
            "import_statement" | "import_from_statement" | "future_import_statement"
        ) {
            return true;
        }
        current = parent.parent();
    }
    false
}

/// Whether an identifier names something other than a variable: the
/// attribute of `obj.attr` or the keyword of `f(key=value)`.
pub fn is_member_name(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return false;
    };
    let field = match parent.kind() {
        "attribute" => "attribute",
        "keyword_argument" => "name",
        _ => return false,
    };
    parent.child_by_field_name(field) == Some(node)
}
