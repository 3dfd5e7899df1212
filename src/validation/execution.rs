//! Execution stage: run the candidate and its checks in the sandbox.
//!
//! A small harness executes the candidate source and then each rendered check
//! in one shared namespace, mapping the first failure to an exit status:
//! `3` for a failed assertion, `4` for any other exception. The host enforces
//! the timeout and kills the interpreter when it expires.
//!
//! Exit status 0 alone does not pass a candidate: code that ends the process
//! early (`os._exit(0)`) would skip the checks. After the last check succeeds
//! the harness prints a line carrying a per-run nonce, which it reads and
//! deletes before any candidate code runs. Only a run that prints that line
//! passes.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::{SandboxError, ValidationError};
use crate::generator::CandidateSample;
use crate::sandbox::{Sandbox, SandboxFile, SandboxOutcome};
use crate::validation::{
    ExecutionFailure, ExecutionSignal, Rejection, StageKind, StageOutcome, ValidationStage,
};

const HARNESS_FILE: &str = "_forge_harness.py";
const NONCE_FILE: &str = "_forge_nonce";
const CANDIDATE_FILE: &str = "candidate.py";
const ASSERTION_EXIT: i32 = 3;
const COMPLETION_PREFIX: &str = "forge-harness: ok ";

const HARNESS: &str = r#"import os
import sys
import traceback

ASSERTION_EXIT = 3
RUNTIME_EXIT = 4
NONCE_FILE = "_forge_nonce"


def run(paths):
    namespace = {"__name__": "__candidate__", "__builtins__": __builtins__}
    for path in paths:
        try:
            with open(path, encoding="utf-8") as handle:
                code = compile(handle.read(), path, "exec")
            exec(code, namespace)
        except SystemExit as exc:
            if exc.code in (None, 0):
                continue
            sys.stderr.write("forge-harness: exit %r in %s\n" % (exc.code, path))
            return RUNTIME_EXIT
        except AssertionError:
            traceback.print_exc()
            sys.stderr.write("forge-harness: assertion failed in %s\n" % path)
            return ASSERTION_EXIT
        except BaseException:
            traceback.print_exc()
            sys.stderr.write("forge-harness: error in %s\n" % path)
            return RUNTIME_EXIT
    return 0


def main():
    with open(NONCE_FILE, encoding="utf-8") as handle:
        nonce = handle.read().strip()
    os.remove(NONCE_FILE)
    code = run(sys.argv[1:])
    if code == 0:
        sys.stdout.write("\nforge-harness: ok %s\n" % nonce)
    sys.stdout.flush()
    sys.stderr.flush()
    sys.exit(code)


if __name__ == "__main__":
    main()
"#;

/// Scratch files, harness arguments and the nonce of one execution.
#[derive(Debug, Clone)]
struct Layout {
    files: Vec<SandboxFile>,
    args: Vec<String>,
    nonce: String,
}

/// Executes candidates with their checks under a hard timeout.
#[derive(Debug, Clone)]
pub struct ExecutionStage {
    sandbox: Sandbox,
}

impl ExecutionStage {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    /// Files written to the scratch directory and the harness arguments.
    fn layout(candidate: &CandidateSample) -> Layout {
        let nonce = Uuid::new_v4().simple().to_string();
        let mut files = vec![
            SandboxFile::new(HARNESS_FILE, HARNESS),
            SandboxFile::new(NONCE_FILE, nonce.clone()),
            SandboxFile::new(CANDIDATE_FILE, candidate.source.clone()),
        ];
        let mut args = vec![HARNESS_FILE.to_string(), CANDIDATE_FILE.to_string()];
        for (i, check) in candidate.checks.iter().enumerate() {
            let name = format!("check_{}.py", i);
            files.push(SandboxFile::new(name.clone(), format!("{}\n", check)));
            args.push(name);
        }
        Layout { files, args, nonce }
    }
}

/// Whether the harness reported that every check ran.
fn completed(stdout: &str, nonce: &str) -> bool {
    stdout
        .lines()
        .any(|line| line.strip_prefix(COMPLETION_PREFIX) == Some(nonce))
}

/// Maps a finished sandbox run to a stage outcome.
fn classify(outcome: SandboxOutcome, nonce: &str) -> StageOutcome {
    let mut stderr = outcome.stderr;
    let signal = if outcome.timed_out {
        ExecutionSignal::Timeout
    } else {
        match outcome.exit_code {
            Some(0) if completed(&outcome.stdout, nonce) => return StageOutcome::Pass,
            Some(0) => {
                debug!("Candidate exited 0 without completing its checks");
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str("forge-harness: process exited before all checks completed\n");
                ExecutionSignal::RuntimeError
            }
            Some(ASSERTION_EXIT) => ExecutionSignal::AssertionFailed,
            _ => ExecutionSignal::RuntimeError,
        }
    };
    StageOutcome::Reject(Rejection::ExecutionFailed(ExecutionFailure {
        signal,
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr,
        duration_ms: outcome.duration.as_millis() as u64,
    }))
}

fn sandbox_error(e: SandboxError) -> ValidationError {
    match e {
        SandboxError::Spawn { command, reason } => {
            ValidationError::InterpreterUnavailable(format!("{}: {}", command, reason))
        }
        e => e.into(),
    }
}

#[async_trait]
impl ValidationStage for ExecutionStage {
    fn kind(&self) -> StageKind {
        StageKind::Execution
    }

    async fn check(&self, candidate: &CandidateSample) -> Result<StageOutcome, ValidationError> {
        let layout = Self::layout(candidate);
        let outcome = self
            .sandbox
            .run(&layout.files, &layout.args)
            .await
            .map_err(sandbox_error)?;
        Ok(classify(outcome, &layout.nonce))
    }

    async fn prepare(&self) -> Result<(), ValidationError> {
        let version = self.sandbox.check_ready().await.map_err(sandbox_error)?;
        debug!(version = %version, backend = ?self.sandbox.config().backend, "Sandbox ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::generator::{source_fingerprint, BindingAssignment};
    use crate::sandbox::testing::{local_config, python_available};

    fn candidate(source: &str, checks: &[&str]) -> CandidateSample {
        CandidateSample {
            pattern_id: "p".to_string(),
            category: "c".to_string(),
            complexity: 1,
            assignment: BindingAssignment::new(),
            source: source.to_string(),
            checks: checks.iter().map(|c| c.to_string()).collect(),
            instruction: "i".to_string(),
            fingerprint: source_fingerprint(source),
        }
    }

    fn stage(timeout: Duration) -> ExecutionStage {
        ExecutionStage::new(Sandbox::new(local_config().with_timeout(timeout)))
    }

    fn signal(outcome: &StageOutcome) -> Option<ExecutionSignal> {
        match outcome {
            StageOutcome::Reject(Rejection::ExecutionFailed(f)) => Some(f.signal),
            _ => None,
        }
    }

    #[test]
    fn test_layout() {
        let layout = ExecutionStage::layout(&candidate("x = 1\n", &["assert x == 1"]));
        assert_eq!(layout.files.len(), 4);
        assert_eq!(layout.args, vec![HARNESS_FILE, CANDIDATE_FILE, "check_0.py"]);
        assert_eq!(layout.files[1].name, NONCE_FILE);
        assert_eq!(layout.files[1].contents, layout.nonce);
        assert_eq!(layout.files[3].contents, "assert x == 1\n");

        let other = ExecutionStage::layout(&candidate("x = 1\n", &["assert x == 1"]));
        assert_ne!(layout.nonce, other.nonce);
    }

    #[test]
    fn test_classify() {
        let nonce = "abc123";
        let base = SandboxOutcome {
            exit_code: Some(0),
            stdout: format!("hello\n{}{}\n", COMPLETION_PREFIX, nonce),
            stderr: String::new(),
            timed_out: false,
            truncated: false,
            duration: Duration::from_millis(5),
        };
        assert_eq!(classify(base.clone(), nonce), StageOutcome::Pass);

        let failed = SandboxOutcome {
            exit_code: Some(3),
            ..base.clone()
        };
        assert_eq!(
            signal(&classify(failed, nonce)),
            Some(ExecutionSignal::AssertionFailed)
        );

        let crashed = SandboxOutcome {
            exit_code: Some(4),
            ..base.clone()
        };
        assert_eq!(
            signal(&classify(crashed, nonce)),
            Some(ExecutionSignal::RuntimeError)
        );

        let killed = SandboxOutcome {
            exit_code: None,
            timed_out: true,
            ..base
        };
        assert_eq!(signal(&classify(killed, nonce)), Some(ExecutionSignal::Timeout));
    }

    #[test]
    fn test_exit_zero_without_completion_line_is_rejected() {
        let silent = SandboxOutcome {
            exit_code: Some(0),
            stdout: "partial output\n".to_string(),
            stderr: String::new(),
            timed_out: false,
            truncated: false,
            duration: Duration::from_millis(5),
        };
        let outcome = classify(silent.clone(), "abc123");
        assert_eq!(signal(&outcome), Some(ExecutionSignal::RuntimeError));
        if let StageOutcome::Reject(Rejection::ExecutionFailed(f)) = outcome {
            assert!(f.stderr.contains("before all checks completed"));
        }

        let forged = SandboxOutcome {
            stdout: format!("{}guess\n", COMPLETION_PREFIX),
            ..silent
        };
        assert_eq!(
            signal(&classify(forged, "abc123")),
            Some(ExecutionSignal::RuntimeError)
        );
    }

    #[tokio::test]
    async fn test_passing_and_failing_checks() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let stage = stage(Duration::from_secs(30));
        let source = "def double(x):\n    return 2 * x\n";

        let ok = stage
            .check(&candidate(source, &["assert double(2) == 4"]))
            .await
            .expect("stage failed");
        assert_eq!(ok, StageOutcome::Pass);

        let bad = stage
            .check(&candidate(source, &["assert double(2) == 4", "assert double(2) == 5"]))
            .await
            .expect("stage failed");
        assert_eq!(signal(&bad), Some(ExecutionSignal::AssertionFailed));
        if let StageOutcome::Reject(Rejection::ExecutionFailed(f)) = bad {
            assert!(f.stderr.contains("check_1.py"));
        }

        let crash = stage
            .check(&candidate("raise ValueError('boom')\n", &["assert True"]))
            .await
            .expect("stage failed");
        assert_eq!(signal(&crash), Some(ExecutionSignal::RuntimeError));
    }

    #[tokio::test]
    async fn test_timeout_kills_candidate() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let stage = stage(Duration::from_millis(500));
        let started = Instant::now();
        let outcome = stage
            .check(&candidate("while True:\n    pass\n", &["assert True"]))
            .await
            .expect("stage failed");
        assert_eq!(signal(&outcome), Some(ExecutionSignal::Timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_early_exit_skipping_checks_is_rejected() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let stage = stage(Duration::from_secs(30));

        let outcome = stage
            .check(&candidate("import os\nos._exit(0)\n", &["assert False"]))
            .await
            .expect("stage failed");
        assert_eq!(signal(&outcome), Some(ExecutionSignal::RuntimeError));

        // SystemExit(0) is caught by the harness, so the checks still run.
        let outcome = stage
            .check(&candidate("import sys\nsys.exit(0)\n", &["assert False"]))
            .await
            .expect("stage failed");
        assert_eq!(signal(&outcome), Some(ExecutionSignal::AssertionFailed));
    }

    #[tokio::test]
    async fn test_candidate_cannot_read_nonce() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let outcome = stage(Duration::from_secs(30))
            .check(&candidate(
                "import os\n",
                &["assert not os.path.exists('_forge_nonce')"],
            ))
            .await
            .expect("stage failed");
        assert_eq!(outcome, StageOutcome::Pass);
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        std::env::set_var("FORGE_SECRET_TOKEN", "leak");
        let outcome = stage(Duration::from_secs(30))
            .check(&candidate(
                "import os\n",
                &["assert 'FORGE_SECRET_TOKEN' not in os.environ"],
            ))
            .await
            .expect("stage failed");
        assert_eq!(outcome, StageOutcome::Pass);
    }
}
