//! Deep-analysis stage: structural smells in otherwise valid code.
//!
//! Rule identifiers follow pylint:
//!
//! | Code    | Finding                                  |
//! |---------|------------------------------------------|
//! | `R0913` | too many arguments                       |
//! | `R0915` | too many statements in a function        |
//! | `R1702` | too many nested blocks                   |
//! | `W0102` | mutable default argument                 |
//! | `W0603` | `global` statement                       |
//! | `W0122` | use of `exec`                            |
//! | `W0123` | use of `eval`                            |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tree_sitter::Node;

use crate::error::ValidationError;
use crate::generator::CandidateSample;
use crate::validation::tree::{code_children, descendants, PythonSource};
use crate::validation::{
    DeepAnalysisPolicy, Rejection, StageKind, StageOutcome, ValidationStage, Violation,
};

/// Statements that open a nested block for `R1702`.
const BLOCK_KINDS: [&str; 5] = [
    "if_statement",
    "for_statement",
    "while_statement",
    "try_statement",
    "with_statement",
];

/// Limits for the counting rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisThresholds {
    pub max_arguments: usize,
    pub max_statements: usize,
    pub max_nesting: usize,
}

impl Default for AnalysisThresholds {
    fn default() -> Self {
        Self {
            max_arguments: 5,
            max_statements: 50,
            max_nesting: 5,
        }
    }
}

/// Runs every rule over a source text.
pub fn analyze(text: &str, thresholds: &AnalysisThresholds) -> Result<Vec<Violation>, ValidationError> {
    let source = PythonSource::parse(text)?;
    let mut flags = Vec::new();

    for node in descendants(source.root()) {
        match node.kind() {
            "global_statement" => {
                let (line, column) = source.position(node);
                flags.push(Violation::new(line, column, "W0603", "Using the global statement"));
            }
            "call" => {
                let callee = node
                    .child_by_field_name("function")
                    .filter(|f| f.kind() == "identifier")
                    .map(|f| source.node_text(f));
                let finding = match callee {
                    Some("exec") => Some(("W0122", "Use of exec")),
                    Some("eval") => Some(("W0123", "Use of eval")),
                    _ => None,
                };
                if let Some((code, message)) = finding {
                    let (line, column) = source.position(node);
                    flags.push(Violation::new(line, column, code, message));
                }
            }
            "function_definition" => check_function(&source, node, thresholds, &mut flags),
            _ => {}
        }
    }

    flags.sort_by(|a, b| (a.line, a.column, &a.code).cmp(&(b.line, b.column, &b.code)));
    Ok(flags)
}

fn check_function(
    source: &PythonSource<'_>,
    def: Node<'_>,
    thresholds: &AnalysisThresholds,
    flags: &mut Vec<Violation>,
) {
    let name = source.field_text(def, "name").unwrap_or("");
    let (line, column) = source.position(def);

    if let Some(params) = def.child_by_field_name("parameters") {
        check_parameters(source, params, name, (line, column), thresholds, flags);
    }

    let Some(body) = def.child_by_field_name("body") else {
        return;
    };

    let statements = descendants(body)
        .into_iter()
        .skip(1)
        .filter(|n| is_statement(n.kind()))
        .count();
    if statements > thresholds.max_statements {
        flags.push(Violation::new(
            line,
            column,
            "R0915",
            format!(
                "Too many statements in '{}' ({}/{})",
                name, statements, thresholds.max_statements
            ),
        ));
    }

    let depth = max_nesting(body);
    if depth > thresholds.max_nesting {
        flags.push(Violation::new(
            line,
            column,
            "R1702",
            format!(
                "Too many nested blocks in '{}' ({}/{})",
                name, depth, thresholds.max_nesting
            ),
        ));
    }
}

fn is_statement(kind: &str) -> bool {
    kind.ends_with("_statement")
        || matches!(kind, "function_definition" | "class_definition" | "decorated_definition")
}

fn check_parameters(
    source: &PythonSource<'_>,
    params: Node<'_>,
    name: &str,
    (line, column): (usize, usize),
    thresholds: &AnalysisThresholds,
    flags: &mut Vec<Violation>,
) {
    let mut count = 0;
    for param in code_children(params) {
        let ident = match param.kind() {
            "identifier" => Some(param),
            "typed_parameter" => code_children(param).first().copied(),
            "default_parameter" | "typed_default_parameter" => param.child_by_field_name("name"),
            // Splats and the `*` / `/` separators do not count.
            _ => None,
        };
        let Some(ident) = ident.filter(|i| i.kind() == "identifier") else {
            continue;
        };
        if !matches!(source.node_text(ident), "self" | "cls") {
            count += 1;
        }

        if let Some(default) = param.child_by_field_name("value") {
            if is_mutable_literal(source, default) {
                flags.push(Violation::new(
                    line,
                    column,
                    "W0102",
                    format!("Dangerous default value {} as argument", source.node_text(default)),
                ));
            }
        }
    }

    if count > thresholds.max_arguments {
        flags.push(Violation::new(
            line,
            column,
            "R0913",
            format!("Too many arguments in '{}' ({}/{})", name, count, thresholds.max_arguments),
        ));
    }
}

fn is_mutable_literal(source: &PythonSource<'_>, value: Node<'_>) -> bool {
    match value.kind() {
        "list" | "dictionary" | "set" | "list_comprehension" | "dictionary_comprehension"
        | "set_comprehension" => true,
        "call" => value
            .child_by_field_name("function")
            .filter(|f| f.kind() == "identifier")
            .is_some_and(|f| matches!(source.node_text(f), "list" | "dict" | "set")),
        _ => false,
    }
}

/// Deepest chain of block statements under `node`. Nested functions,
/// classes and lambdas are measured on their own.
fn max_nesting(node: Node<'_>) -> usize {
    code_children(node)
        .into_iter()
        .filter(|child| {
            !matches!(
                child.kind(),
                "function_definition" | "class_definition" | "decorated_definition" | "lambda"
            )
        })
        .map(|child| {
            let inner = max_nesting(child);
            if BLOCK_KINDS.contains(&child.kind()) {
                inner + 1
            } else {
                inner
            }
        })
        .max()
        .unwrap_or(0)
}

/// Flags structural smells; rejects or records them depending on the policy.
#[derive(Debug, Clone, Default)]
pub struct DeepAnalysisStage {
    thresholds: AnalysisThresholds,
    policy: DeepAnalysisPolicy,
}

impl DeepAnalysisStage {
    pub fn new(thresholds: AnalysisThresholds, policy: DeepAnalysisPolicy) -> Self {
        Self { thresholds, policy }
    }
}

#[async_trait]
impl ValidationStage for DeepAnalysisStage {
    fn kind(&self) -> StageKind {
        StageKind::DeepAnalysis
    }

    async fn check(&self, candidate: &CandidateSample) -> Result<StageOutcome, ValidationError> {
        let flags = analyze(&candidate.source, &self.thresholds)?;
        if flags.is_empty() {
            return Ok(StageOutcome::Pass);
        }
        Ok(match self.policy {
            DeepAnalysisPolicy::Reject => StageOutcome::Reject(Rejection::DeepAnalysisFlag { flags }),
            DeepAnalysisPolicy::Advisory => StageOutcome::Advisory(flags),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{source_fingerprint, BindingAssignment};

    fn codes(source: &str) -> Vec<String> {
        analyze(source, &AnalysisThresholds::default())
            .expect("analyze")
            .into_iter()
            .map(|v| v.code)
            .collect()
    }

    #[test]
    fn test_clean_function() {
        assert!(codes("def area(r):\n    return 3.14 * r * r\n").is_empty());
    }

    #[test]
    fn test_too_many_arguments() {
        assert_eq!(codes("def f(a, b, c, d, e, g):\n    pass\n"), vec!["R0913"]);
        assert!(codes("def f(self, a, b, c, d, e, *args, **kw):\n    pass\n").is_empty());
        assert_eq!(
            codes("def f(\n    a,\n    b,\n    c,\n    d,\n    e,\n    g: int = 1,\n):\n    pass\n"),
            vec!["R0913"]
        );
    }

    #[test]
    fn test_mutable_default() {
        assert_eq!(codes("def f(items=[]):\n    return items\n"), vec!["W0102"]);
        assert_eq!(codes("def f(m: dict = {}):\n    return m\n"), vec!["W0102"]);
        assert_eq!(codes("def f(s=set()):\n    return s\n"), vec!["W0102"]);
        assert!(codes("def f(items=None):\n    return items\n").is_empty());
        assert!(codes("def f(t=(1, 2)):\n    return t\n").is_empty());
    }

    #[test]
    fn test_too_many_statements() {
        let body: String = (0..51).map(|i| format!("    x{} = {}\n", i, i)).collect();
        let source = format!("def f():\n{}", body);
        assert_eq!(codes(&source), vec!["R0915"]);
    }

    #[test]
    fn test_nesting_depth() {
        let mut source = String::from("def f(x):\n");
        for depth in 0..6 {
            source.push_str(&"    ".repeat(depth + 1));
            source.push_str("if x:\n");
        }
        source.push_str(&"    ".repeat(7));
        source.push_str("pass\n");
        assert_eq!(codes(&source), vec!["R1702"]);

        let flat = "def f(x):\n    if x:\n        pass\n    elif x:\n        pass\n    else:\n        pass\n";
        assert!(codes(flat).is_empty());
    }

    #[test]
    fn test_global_exec_eval() {
        let source = "counter = 0\n\n\ndef bump():\n    global counter\n    counter += 1\n    exec('x = 1')\n    return eval('1')\n";
        assert_eq!(codes(source), vec!["W0603", "W0122", "W0123"]);
        assert!(codes("x = obj.eval(1)\ny = 'exec(2)'\n").is_empty());
    }

    #[test]
    fn test_text_in_strings_and_comments_is_ignored() {
        let source = "def f():\n    \"\"\"Call eval(x) or exec(y)? Never.\n    global state\n    \"\"\"\n    # eval(z)\n    return 1\n";
        assert!(codes(source).is_empty());
    }

    #[test]
    fn test_nested_functions_are_measured_separately() {
        let mut source = String::from("def outer(x):\n    if x:\n        def inner(y):\n");
        for depth in 0..4 {
            source.push_str(&"    ".repeat(depth + 3));
            source.push_str("if y:\n");
        }
        source.push_str(&"    ".repeat(7));
        source.push_str("pass\n");
        source.push_str("        return inner\n");
        assert!(codes(&source).is_empty());
    }

    #[test]
    fn test_flag_positions() {
        let flags = analyze("x = 1\nif x:\n    eval('1')\n", &AnalysisThresholds::default())
            .expect("analyze");
        assert_eq!(flags.len(), 1);
        assert_eq!((flags[0].line, flags[0].column), (3, 5));
    }

    fn candidate(source: &str) -> CandidateSample {
        CandidateSample {
            pattern_id: "p".to_string(),
            category: "c".to_string(),
            complexity: 1,
            assignment: BindingAssignment::new(),
            source: source.to_string(),
            checks: Vec::new(),
            instruction: "i".to_string(),
            fingerprint: source_fingerprint(source),
        }
    }

    #[tokio::test]
    async fn test_policy_decides_outcome() {
        let c = candidate("def f(items=[]):\n    return items\n");

        let reject = DeepAnalysisStage::new(AnalysisThresholds::default(), DeepAnalysisPolicy::Reject);
        assert!(matches!(
            reject.check(&c).await.expect("stage failed"),
            StageOutcome::Reject(Rejection::DeepAnalysisFlag { .. })
        ));

        let advisory =
            DeepAnalysisStage::new(AnalysisThresholds::default(), DeepAnalysisPolicy::Advisory);
        match advisory.check(&c).await.expect("stage failed") {
            StageOutcome::Advisory(flags) => assert_eq!(flags[0].code, "W0102"),
            other => panic!("expected advisory, got {:?}", other),
        }
    }
}
