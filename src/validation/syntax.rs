//! Syntax stage: the interpreter's own compiler decides.
//!
//! The candidate is compiled (never executed) by a short driver script in a
//! child process. Compilation runs no user code, so this stage uses the local
//! interpreter even when execution is containerized. A source the compiler
//! cannot finish within the parse timeout is rejected as invalid.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{SandboxError, ValidationError};
use crate::generator::CandidateSample;
use crate::sandbox::run_bounded;
use crate::validation::{Rejection, StageKind, StageOutcome, ValidationStage};

/// Exit status the driver uses to report a syntax error.
const SYNTAX_ERROR_EXIT: i32 = 1;

const PARSE_SCRIPT: &str = r#"
import sys
src = sys.stdin.buffer.read().decode("utf-8", "replace")
try:
    compile(src, "<candidate>", "exec", dont_inherit=True)
except SyntaxError as e:
    sys.stdout.write("%d\t%d\t%s\n" % (e.lineno or 0, e.offset or 0, e.msg))
    sys.exit(1)
except ValueError as e:
    sys.stdout.write("0\t0\t%s\n" % (e,))
    sys.exit(1)
"#;

/// Rejects candidates the interpreter cannot compile.
#[derive(Debug, Clone)]
pub struct SyntaxStage {
    interpreter: String,
    timeout: Duration,
}

impl SyntaxStage {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }
}

/// Parses the driver's `line<TAB>column<TAB>message` report.
fn parse_report(stdout: &str) -> Option<Rejection> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut fields = line.splitn(3, '\t');
    let lineno = fields.next()?.trim().parse().ok()?;
    let column = fields.next()?.trim().parse().ok()?;
    let message = fields.next()?.trim().to_string();
    Some(Rejection::SyntaxInvalid {
        line: lineno,
        column,
        message,
    })
}

#[async_trait]
impl ValidationStage for SyntaxStage {
    fn kind(&self) -> StageKind {
        StageKind::Syntax
    }

    async fn check(&self, candidate: &CandidateSample) -> Result<StageOutcome, ValidationError> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(["-I", "-c", PARSE_SCRIPT]);

        let output = match run_bounded(cmd, Some(candidate.source.as_bytes()), self.timeout, 64 * 1024)
            .await
        {
            Ok(output) => output,
            Err(SandboxError::Spawn { command, reason }) => {
                return Err(ValidationError::InterpreterUnavailable(format!(
                    "{}: {}",
                    command, reason
                )))
            }
            Err(e) => return Err(e.into()),
        };

        if output.timed_out {
            debug!(
                pattern_id = %candidate.pattern_id,
                timeout_ms = self.timeout.as_millis() as u64,
                "Parser timed out"
            );
            return Ok(StageOutcome::Reject(Rejection::SyntaxInvalid {
                line: 0,
                column: 0,
                message: format!("parser timed out after {}ms", self.timeout.as_millis()),
            }));
        }

        match output.exit_code {
            Some(0) => Ok(StageOutcome::Pass),
            Some(SYNTAX_ERROR_EXIT) => parse_report(&output.stdout)
                .map(StageOutcome::Reject)
                .ok_or_else(|| {
                    ValidationError::ParserProtocol(format!(
                        "unreadable parser report: {:?} {:?}",
                        output.stdout, output.stderr
                    ))
                }),
            other => Err(ValidationError::ParserProtocol(format!(
                "parser exited with {:?}: {}",
                other,
                output.stderr.trim()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{source_fingerprint, BindingAssignment};

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
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

    #[test]
    fn test_parse_report() {
        assert_eq!(
            parse_report("3\t7\tinvalid syntax\n"),
            Some(Rejection::SyntaxInvalid {
                line: 3,
                column: 7,
                message: "invalid syntax".to_string()
            })
        );
        assert_eq!(parse_report(""), None);
        assert_eq!(parse_report("garbage"), None);
    }

    #[tokio::test]
    async fn test_valid_source_passes() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let stage = SyntaxStage::new("python3", Duration::from_secs(30));
        let outcome = stage
            .check(&candidate("def f(x):\n    return x + 1\n"))
            .await
            .expect("stage failed");
        assert_eq!(outcome, StageOutcome::Pass);
    }

    #[tokio::test]
    async fn test_invalid_source_rejected_with_position() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let stage = SyntaxStage::new("python3", Duration::from_secs(30));
        let outcome = stage
            .check(&candidate("x = 1\ndef f(:\n    pass\n"))
            .await
            .expect("stage failed");
        match outcome {
            StageOutcome::Reject(Rejection::SyntaxInvalid { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected SyntaxInvalid, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_parser_timeout_rejects_candidate() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let hanging = dir.path().join("hanging-python");
        std::fs::write(&hanging, "#!/bin/sh\nexec sleep 30\n").expect("write script");
        std::fs::set_permissions(&hanging, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");

        let stage = SyntaxStage::new(hanging.display().to_string(), Duration::from_millis(200));
        let outcome = stage
            .check(&candidate("x = 1\n"))
            .await
            .expect("a slow parse is a verdict, not a pipeline failure");
        match outcome {
            StageOutcome::Reject(Rejection::SyntaxInvalid { message, .. }) => {
                assert!(message.contains("timed out"), "message: {message}")
            }
            other => panic!("expected SyntaxInvalid, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_infrastructure_error() {
        let stage = SyntaxStage::new("no-such-python-forge", Duration::from_secs(5));
        assert!(matches!(
            stage.check(&candidate("x = 1\n")).await,
            Err(ValidationError::InterpreterUnavailable(_))
        ));
    }
}
