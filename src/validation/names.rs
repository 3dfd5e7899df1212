//! Name binding analysis for the style stage.
//!
//! Builds Python's scopes (module, function, class, comprehension) from the
//! syntax tree, records every binding and every read, then resolves reads the
//! way the interpreter does: innermost scope outwards, skipping enclosing
//! class bodies, then builtins. Bindings are collected for the whole scope
//! before resolving, so a function may read a global defined further down.
//!
//! - `F821` undefined name: a read that resolves nowhere.
//! - `F841` unused local: a function-local name bound by a plain assignment
//!   and never read.

use std::collections::HashSet;

use tree_sitter::Node;

use crate::validation::tree::{code_children, descendants, PythonSource};
use crate::validation::Violation;

/// Names the interpreter provides without an import.
const BUILTINS: &[&str] = &[
    "__build_class__", "__builtins__", "__debug__", "__doc__", "__file__", "__import__",
    "__loader__", "__name__", "__package__", "__spec__", "abs", "aiter", "all", "anext",
    "any", "ascii", "bin", "bool", "breakpoint", "bytearray", "bytes", "callable", "chr",
    "classmethod", "compile", "complex", "copyright", "credits", "delattr", "dict", "dir",
    "divmod", "enumerate", "eval", "exec", "exit", "filter", "float", "format", "frozenset",
    "getattr", "globals", "hasattr", "hash", "help", "hex", "id", "input", "int",
    "isinstance", "issubclass", "iter", "len", "license", "list", "locals", "map", "max",
    "memoryview", "min", "next", "object", "oct", "open", "ord", "pow", "print", "property",
    "quit", "range", "repr", "reversed", "round", "set", "setattr", "slice", "sorted",
    "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip",
    "Ellipsis", "NotImplemented",
    "ArithmeticError", "AssertionError", "AttributeError", "BaseException",
    "BaseExceptionGroup", "BlockingIOError", "BrokenPipeError", "BufferError",
    "BytesWarning", "ChildProcessError", "ConnectionAbortedError", "ConnectionError",
    "ConnectionRefusedError", "ConnectionResetError", "DeprecationWarning", "EOFError",
    "EncodingWarning", "EnvironmentError", "Exception", "ExceptionGroup", "FileExistsError",
    "FileNotFoundError", "FloatingPointError", "FutureWarning", "GeneratorExit", "IOError",
    "ImportError", "ImportWarning", "IndentationError", "IndexError", "InterruptedError",
    "IsADirectoryError", "KeyError", "KeyboardInterrupt", "LookupError", "MemoryError",
    "ModuleNotFoundError", "NameError", "NotADirectoryError", "NotImplementedError",
    "OSError", "OverflowError", "PendingDeprecationWarning", "PermissionError",
    "ProcessLookupError", "RecursionError", "ReferenceError", "ResourceWarning",
    "RuntimeError", "RuntimeWarning", "StopAsyncIteration", "StopIteration", "SyntaxError",
    "SyntaxWarning", "SystemError", "SystemExit", "TabError", "TimeoutError", "TypeError",
    "UnboundLocalError", "UnicodeDecodeError", "UnicodeEncodeError", "UnicodeError",
    "UnicodeTranslateError", "UnicodeWarning", "UserWarning", "ValueError", "Warning",
    "ZeroDivisionError",
];

/// Names every class body can read.
const CLASS_NAMES: &[&str] = &["__module__", "__qualname__"];

const MODULE_SCOPE: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Function,
    Class,
    Comprehension,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    parent: Option<usize>,
    bound: HashSet<String>,
    /// Names declared `global` or `nonlocal` here.
    declared: HashSet<String>,
}

/// A name read at some node, evaluated in some scope.
struct Read<'t> {
    node: Node<'t>,
    name: String,
    scope: usize,
}

/// A plain `name = value` assignment inside a function.
struct LocalAssignment<'t> {
    node: Node<'t>,
    name: String,
    scope: usize,
}

struct Binder<'a, 's> {
    source: &'a PythonSource<'s>,
    scopes: Vec<Scope>,
    reads: Vec<Read<'a>>,
    assignments: Vec<LocalAssignment<'a>>,
    wildcard_import: bool,
}

impl<'a, 's> Binder<'a, 's> {
    fn new(source: &'a PythonSource<'s>) -> Self {
        Self {
            source,
            scopes: vec![Scope {
                kind: ScopeKind::Module,
                parent: None,
                bound: HashSet::new(),
                declared: HashSet::new(),
            }],
            reads: Vec::new(),
            assignments: Vec::new(),
            wildcard_import: false,
        }
    }

    fn push_scope(&mut self, kind: ScopeKind, parent: usize) -> usize {
        self.scopes.push(Scope {
            kind,
            parent: Some(parent),
            bound: HashSet::new(),
            declared: HashSet::new(),
        });
        self.scopes.len() - 1
    }

    fn bind(&mut self, scope: usize, name: &str) {
        self.scopes[scope].bound.insert(name.to_string());
    }

    /// Nearest scope that is not a comprehension; walrus targets land there.
    fn enclosing_non_comprehension(&self, mut scope: usize) -> usize {
        while self.scopes[scope].kind == ScopeKind::Comprehension {
            match self.scopes[scope].parent {
                Some(parent) => scope = parent,
                None => break,
            }
        }
        scope
    }

    fn visit_children(&mut self, node: Node<'a>, scope: usize) {
        for child in code_children(node) {
            self.visit(child, scope);
        }
    }

    fn visit_field(&mut self, node: Node<'a>, field: &str, scope: usize) {
        if let Some(child) = node.child_by_field_name(field) {
            self.visit(child, scope);
        }
    }

    fn visit(&mut self, node: Node<'a>, scope: usize) {
        match node.kind() {
            "identifier" => self.reads.push(Read {
                node,
                name: self.source.node_text(node).to_string(),
                scope,
            }),
            "attribute" => self.visit_field(node, "object", scope),
            "keyword_argument" => self.visit_field(node, "value", scope),
            "function_definition" => self.visit_function(node, scope),
            "lambda" => {
                let inner = self.push_scope(ScopeKind::Function, scope);
                if let Some(params) = node.child_by_field_name("parameters") {
                    self.bind_parameters(params, inner);
                }
                self.visit_field(node, "body", inner);
            }
            "class_definition" => {
                if let Some(name) = self.source.field_text(node, "name") {
                    self.bind(scope, name);
                }
                self.visit_field(node, "superclasses", scope);
                let inner = self.push_scope(ScopeKind::Class, scope);
                self.visit_field(node, "body", inner);
            }
            "list_comprehension" | "set_comprehension" | "dictionary_comprehension"
            | "generator_expression" => {
                let inner = self.push_scope(ScopeKind::Comprehension, scope);
                let children = code_children(node);
                for clause in children.iter().filter(|c| c.kind() == "for_in_clause") {
                    if let Some(left) = clause.child_by_field_name("left") {
                        self.bind_target(left, inner);
                    }
                }
                for child in children {
                    if child.kind() == "for_in_clause" {
                        self.visit_field(child, "right", inner);
                    } else {
                        self.visit(child, inner);
                    }
                }
            }
            "import_statement" | "import_from_statement" => self.bind_import(node, scope),
            "future_import_statement" => {}
            "global_statement" | "nonlocal_statement" => {
                let is_global = node.kind() == "global_statement";
                for child in code_children(node) {
                    let name = self.source.node_text(child).to_string();
                    if is_global {
                        self.bind(MODULE_SCOPE, &name);
                    }
                    self.scopes[scope].declared.insert(name.clone());
                    self.bind(scope, &name);
                }
            }
            "assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    if left.kind() == "identifier" {
                        self.record_local_assignment(left, scope);
                    }
                    self.bind_target(left, scope);
                }
                self.visit_field(node, "type", scope);
                self.visit_field(node, "right", scope);
            }
            "augmented_assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    // `x += 1` reads `x` before rebinding it.
                    self.visit(left, scope);
                    if left.kind() == "identifier" {
                        let name = self.source.node_text(left).to_string();
                        self.bind(scope, &name);
                    }
                }
                self.visit_field(node, "right", scope);
            }
            "for_statement" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.bind_target(left, scope);
                }
                self.visit_field(node, "right", scope);
                self.visit_field(node, "body", scope);
                self.visit_field(node, "alternative", scope);
            }
            "named_expression" => {
                if let Some(name) = self.source.field_text(node, "name") {
                    let target = self.enclosing_non_comprehension(scope);
                    self.bind(target, name);
                }
                self.visit_field(node, "value", scope);
            }
            "as_pattern" => {
                for child in code_children(node) {
                    if child.kind() == "as_pattern_target" {
                        self.bind_target(child, scope);
                    } else {
                        self.visit(child, scope);
                    }
                }
            }
            "except_clause" => {
                // `except E as err`: the node after the `as` keyword is bound.
                let mut cursor = node.walk();
                let children: Vec<Node<'a>> = node.children(&mut cursor).collect();
                let mut after_as = false;
                for child in children {
                    if child.kind() == "as" {
                        after_as = true;
                        continue;
                    }
                    if !child.is_named() || child.kind() == "comment" {
                        continue;
                    }
                    if after_as {
                        self.bind_target(child, scope);
                        after_as = false;
                    } else {
                        self.visit(child, scope);
                    }
                }
            }
            "case_pattern" => {
                // Captures and class names look alike here; treat both as bound.
                for child in descendants(node) {
                    if child.kind() == "identifier" {
                        let name = self.source.node_text(child).to_string();
                        self.bind(scope, &name);
                    }
                }
            }
            "type_alias_statement" => {
                if let Some(left) = node.child_by_field_name("left") {
                    for child in descendants(left) {
                        if child.kind() == "identifier" {
                            let name = self.source.node_text(child).to_string();
                            self.bind(scope, &name);
                        }
                    }
                }
                self.visit_field(node, "right", scope);
            }
            _ => self.visit_children(node, scope),
        }
    }

    fn visit_function(&mut self, node: Node<'a>, scope: usize) {
        if let Some(name) = self.source.field_text(node, "name") {
            self.bind(scope, name);
        }
        let inner = self.push_scope(ScopeKind::Function, scope);
        if let Some(type_params) = node.child_by_field_name("type_parameters") {
            for child in descendants(type_params) {
                if child.kind() == "identifier" {
                    let name = self.source.node_text(child).to_string();
                    self.bind(inner, &name);
                }
            }
        }
        if let Some(params) = node.child_by_field_name("parameters") {
            self.bind_parameters(params, inner);
        }
        self.visit_field(node, "return_type", inner);
        self.visit_field(node, "body", inner);
    }

    /// Binds parameter names in `scope` and visits defaults and annotations.
    fn bind_parameters(&mut self, params: Node<'a>, scope: usize) {
        for param in code_children(params) {
            match param.kind() {
                "identifier" => {
                    let name = self.source.node_text(param).to_string();
                    self.bind(scope, &name);
                }
                "default_parameter" | "typed_default_parameter" => {
                    if let Some(name) = param.child_by_field_name("name") {
                        self.bind_target(name, scope);
                    }
                    self.visit_field(param, "type", scope);
                    self.visit_field(param, "value", scope);
                }
                "typed_parameter" => {
                    let annotation = param.child_by_field_name("type");
                    for child in code_children(param) {
                        if Some(child) == annotation {
                            self.visit(child, scope);
                        } else {
                            self.bind_target(child, scope);
                        }
                    }
                }
                "list_splat_pattern" | "dictionary_splat_pattern" | "tuple_pattern" => {
                    self.bind_target(param, scope)
                }
                _ => {}
            }
        }
    }

    /// Binds the names an assignment-like target introduces. Attribute and
    /// subscript targets bind nothing and read their object.
    fn bind_target(&mut self, target: Node<'a>, scope: usize) {
        match target.kind() {
            "identifier" => {
                let name = self.source.node_text(target).to_string();
                self.bind(scope, &name);
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "parenthesized_expression" | "list_splat_pattern" | "list_splat"
            | "dictionary_splat_pattern" | "as_pattern_target" => {
                for child in code_children(target) {
                    self.bind_target(child, scope);
                }
            }
            _ => self.visit(target, scope),
        }
    }

    fn bind_import(&mut self, node: Node<'a>, scope: usize) {
        let mut cursor = node.walk();
        let names: Vec<Node<'a>> = node.children_by_field_name("name", &mut cursor).collect();
        let from_import = node.kind() == "import_from_statement";
        for name in names {
            let bound = match name.kind() {
                "aliased_import" => self.source.field_text(name, "alias"),
                // `import a.b` binds `a`; `from m import b` binds `b`.
                "dotted_name" if from_import => Some(self.source.node_text(name)),
                "dotted_name" => code_children(name)
                    .first()
                    .map(|first| self.source.node_text(*first)),
                _ => None,
            };
            if let Some(bound) = bound {
                self.bind(scope, bound);
            }
        }
        if code_children(node).iter().any(|c| c.kind() == "wildcard_import") {
            self.wildcard_import = true;
        }
    }

    fn record_local_assignment(&mut self, left: Node<'a>, scope: usize) {
        if self.scopes[scope].kind != ScopeKind::Function {
            return;
        }
        let name = self.source.node_text(left).to_string();
        if self.scopes[scope].declared.contains(&name) {
            return;
        }
        self.assignments.push(LocalAssignment {
            node: left,
            name,
            scope,
        });
    }

    /// Scope that binds `name` as read from `scope`, if any.
    fn resolve(&self, name: &str, scope: usize) -> Option<usize> {
        let mut current = Some(scope);
        let mut innermost = true;
        while let Some(idx) = current {
            let s = &self.scopes[idx];
            let visible = innermost || s.kind != ScopeKind::Class;
            if visible && s.bound.contains(name) {
                return Some(idx);
            }
            innermost = false;
            current = s.parent;
        }
        None
    }
}

/// Reports `F821` and `F841` for a parsed source.
///
/// Nothing is reported for sources the parser had to recover from, and
/// `F821` is skipped when a wildcard import makes the bound names unknown.
pub fn check_names(source: &PythonSource<'_>, out: &mut Vec<Violation>) {
    if source.has_errors() {
        return;
    }
    let mut binder = Binder::new(source);
    binder.visit(source.root(), MODULE_SCOPE);

    let builtins: HashSet<&str> = BUILTINS.iter().copied().collect();
    let mut used: HashSet<(usize, String)> = HashSet::new();
    let mut reads_locals: HashSet<usize> = HashSet::new();
    let mut reported: HashSet<(usize, usize)> = HashSet::new();

    for read in &binder.reads {
        if read.name == "locals" {
            reads_locals.insert(read.scope);
        }
        if let Some(scope) = binder.resolve(&read.name, read.scope) {
            used.insert((scope, read.name.clone()));
            continue;
        }
        let in_class = binder.scopes[read.scope].kind == ScopeKind::Class;
        if binder.wildcard_import
            || builtins.contains(read.name.as_str())
            || (in_class && CLASS_NAMES.contains(&read.name.as_str()))
        {
            continue;
        }
        let (line, column) = source.position(read.node);
        if reported.insert((line, column)) {
            out.push(Violation::new(
                line,
                column,
                "F821",
                format!("undefined name '{}'", read.name),
            ));
        }
    }

    let mut flagged: HashSet<(usize, String)> = HashSet::new();
    for assignment in &binder.assignments {
        let key = (assignment.scope, assignment.name.clone());
        if used.contains(&key) || reads_locals.contains(&assignment.scope) {
            continue;
        }
        if flagged.insert(key) {
            let (line, column) = source.position(assignment.node);
            out.push(Violation::new(
                line,
                column,
                "F841",
                format!(
                    "local variable '{}' is assigned to but never used",
                    assignment.name
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn findings(source: &str) -> Vec<(String, String)> {
        let parsed = PythonSource::parse(source).expect("parse");
        let mut out = Vec::new();
        check_names(&parsed, &mut out);
        out.into_iter().map(|v| (v.code, v.message)).collect()
    }

    fn undefined(source: &str) -> Vec<String> {
        findings(source)
            .into_iter()
            .filter(|(code, _)| code == "F821")
            .map(|(_, message)| message)
            .collect()
    }

    #[test]
    fn test_undefined_name() {
        assert_eq!(
            undefined("def f():\n    return missing + 1\n"),
            vec!["undefined name 'missing'"]
        );
        assert!(undefined("def f(x):\n    return len(x)\n").is_empty());
        assert!(undefined("s = 'missing'\n# missing\n").is_empty());
    }

    #[test]
    fn test_module_names_bound_later_are_visible_in_functions() {
        assert!(undefined("def f():\n    return LIMIT\n\n\nLIMIT = 3\n").is_empty());
    }

    #[test]
    fn test_closures_and_class_bodies() {
        let closure = "def outer():\n    x = 1\n\n    def inner():\n        return x\n    return inner\n";
        assert!(undefined(closure).is_empty());

        let class_body = "class A:\n    y = 1\n    z = y\n\n    def m(self):\n        return y\n";
        assert_eq!(undefined(class_body), vec!["undefined name 'y'"]);
    }

    #[test]
    fn test_binding_forms() {
        let source = concat!(
            "import os.path\n",
            "from collections import Counter as C\n",
            "squares = [n * n for n in range(3)]\n",
            "for i, (a, b) in enumerate([(1, 2)]):\n",
            "    pass\n",
            "with open('f') as fh:\n",
            "    data = fh.read()\n",
            "try:\n",
            "    pass\n",
            "except ValueError as err:\n",
            "    print(err)\n",
            "if (m := len(squares)) > 1:\n",
            "    print(m, i, a, b, data, os.sep, C)\n",
            "handler = lambda ev, *rest: (ev, rest)\n",
            "print(dict(key=1).missing_attr)\n",
        );
        assert!(undefined(source).is_empty(), "{:?}", undefined(source));
    }

    #[test]
    fn test_global_declaration_binds_module_name() {
        let source = "def reset():\n    global counter\n    counter = 0\n\n\ndef read():\n    return counter\n";
        assert!(findings(source).is_empty());
    }

    #[test]
    fn test_wildcard_import_disables_undefined_names() {
        assert!(undefined("from math import *\nprint(pi)\n").is_empty());
    }

    #[test]
    fn test_unused_local() {
        assert_eq!(
            findings("def f():\n    unused = 1\n    return 2\n"),
            vec![(
                "F841".to_string(),
                "local variable 'unused' is assigned to but never used".to_string()
            )]
        );
        assert!(findings("def f():\n    used = 1\n    return used\n").is_empty());
        assert!(findings("def f():\n    a, b = 1, 2\n    return a\n").is_empty());
        assert!(findings("total = 1\n").is_empty());
        assert!(findings("def f():\n    n = 0\n    n += 1\n").is_empty());
    }

    #[test]
    fn test_recovered_parse_reports_nothing() {
        assert!(findings("def f(:\n    return missing\n").is_empty());
    }
}
