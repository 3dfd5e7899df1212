//! Sandbox for executing untrusted generated code.
//!
//! Every run gets a fresh scratch directory that becomes the working
//! directory of the interpreter. Three backends are available:
//!
//! - **Isolated** (default): the interpreter runs under bubblewrap (`bwrap`)
//!   in fresh namespaces with no network, a read-only view of the host and
//!   only the scratch directory writable.
//! - **Docker**: the interpreter runs in a throwaway container with no
//!   network, memory and CPU limits, and only the scratch directory mounted.
//! - **Unconfined**: the interpreter runs as a plain local child with a
//!   cleared environment. Nothing stops it from touching the network or the
//!   filesystem, so every run logs a warning.
//!
//! In all cases the interpreter runs in isolated mode (`-I -B`) and the
//! wall-clock limit is enforced by the host, which kills the child's process
//! group (and the container) when it expires.

pub mod runner;

pub use runner::{run_bounded, ProcessOutput};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SandboxError;

/// Default wall-clock limit for one execution.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the interpreter runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxBackend {
    Isolated,
    Docker { image: String },
    Unconfined,
}

/// Bubblewrap executable used by [`SandboxBackend::Isolated`].
pub const BWRAP: &str = "bwrap";

/// Configuration for the sandbox environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter executable, e.g. `python3`.
    pub interpreter: String,
    pub backend: SandboxBackend,
    /// Timeout for one execution.
    pub timeout: Duration,
    /// Memory limit in megabytes (Docker backend).
    pub memory_limit_mb: u64,
    /// CPU limit in cores (Docker backend); zero disables the limit.
    pub cpu_limit: f64,
    /// Capture budget for stdout and stderr combined.
    pub max_output_bytes: usize,
    /// Parent directory for scratch directories; the system temp dir if unset.
    pub scratch_root: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            backend: SandboxBackend::Isolated,
            timeout: DEFAULT_TIMEOUT,
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            max_output_bytes: 256 * 1024,
            scratch_root: None,
        }
    }
}

impl SandboxConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the interpreter executable.
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Runs inside the given Docker image instead of a local process.
    pub fn with_docker(mut self, image: impl Into<String>) -> Self {
        self.backend = SandboxBackend::Docker {
            image: image.into(),
        };
        self
    }

    /// Runs the interpreter as a plain local process without confinement.
    pub fn unconfined(mut self) -> Self {
        self.backend = SandboxBackend::Unconfined;
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the memory limit in MB.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    /// Sets the CPU limit.
    pub fn with_cpu_limit(mut self, cores: f64) -> Self {
        self.cpu_limit = cores;
        self
    }

    /// Sets the output capture budget.
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Sets the parent directory for scratch directories.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }
}

/// A file placed in the scratch directory before the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    pub name: String,
    pub contents: String,
}

impl SandboxFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// Result of one sandboxed run. The child has exited when this is returned.
pub type SandboxOutcome = ProcessOutput;

/// Executes interpreter invocations in isolation.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    /// Creates a sandbox with the given configuration.
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Checks that the interpreter can be started inside the configured
    /// backend, returning its version line.
    ///
    /// For the isolated backend this also proves that bubblewrap can create
    /// its namespaces on this host.
    pub async fn check_ready(&self) -> Result<String, SandboxError> {
        let command = vec![self.config.interpreter.clone(), "--version".to_string()];
        let scratch = self.scratch_dir()?;
        let cmd = match &self.config.backend {
            SandboxBackend::Isolated => self.isolated_command(scratch.path(), &command),
            SandboxBackend::Docker { image } => {
                let mut cmd = Command::new("docker");
                cmd.args(["run", "--rm", "--network=none", image.as_str()]);
                cmd.args(&command);
                cmd
            }
            SandboxBackend::Unconfined => {
                warn!("Sandbox is unconfined: candidate code can reach the network and host files");
                self.process_command(scratch.path(), &command)
            }
        };

        let timeout = self.config.timeout.max(Duration::from_secs(30));
        let output = match run_bounded(cmd, None, timeout, 4096).await {
            Err(SandboxError::Spawn { command, reason })
                if self.config.backend == SandboxBackend::Isolated =>
            {
                return Err(SandboxError::Setup(format!(
                    "cannot start '{}' ({}); install bubblewrap, or pass --docker or --unconfined",
                    command, reason
                )));
            }
            other => other?,
        };
        if output.exit_code != Some(0) {
            let hint = match self.config.backend {
                SandboxBackend::Isolated => {
                    "; bubblewrap may lack namespace support here, use --docker or --unconfined"
                }
                _ => "",
            };
            return Err(SandboxError::Setup(format!(
                "'{} --version' failed: {}{}",
                self.config.interpreter,
                output.stderr.trim(),
                hint
            )));
        }
        // Older interpreters print the version on stderr.
        let version = if output.stdout.trim().is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        Ok(version.trim().to_string())
    }

    /// Writes `files` into a fresh scratch directory and runs the interpreter
    /// there with `args`.
    ///
    /// The scratch directory is removed when the run completes.
    pub async fn run(
        &self,
        files: &[SandboxFile],
        args: &[String],
    ) -> Result<SandboxOutcome, SandboxError> {
        let scratch = self.scratch_dir()?;
        for file in files {
            tokio::fs::write(scratch.path().join(&file.name), &file.contents)
                .await
                .map_err(|e| {
                    SandboxError::Setup(format!("failed to write '{}': {}", file.name, e))
                })?;
        }

        let id = format!("forge-sandbox-{}", Uuid::new_v4());
        let mut command = vec![
            self.config.interpreter.clone(),
            "-I".to_string(),
            "-B".to_string(),
        ];
        command.extend(args.iter().cloned());

        let cmd = match &self.config.backend {
            SandboxBackend::Isolated => self.isolated_command(scratch.path(), &command),
            SandboxBackend::Docker { .. } => {
                let mut cmd = Command::new("docker");
                cmd.args(self.docker_run_args(&id, scratch.path(), &command));
                cmd
            }
            SandboxBackend::Unconfined => {
                warn!(
                    sandbox = %id,
                    "Running candidate code unconfined: no network or filesystem isolation"
                );
                self.process_command(scratch.path(), &command)
            }
        };

        debug!(sandbox = %id, "Running sandboxed interpreter");
        let output = run_bounded(
            cmd,
            None,
            self.config.timeout,
            self.config.max_output_bytes,
        )
        .await?;

        if output.timed_out {
            if let SandboxBackend::Docker { .. } = self.config.backend {
                self.kill_container(&id).await;
            }
        }

        Ok(output)
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("forge-sandbox-");
        let dir = match &self.config.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| SandboxError::Setup(format!("failed to create scratch dir: {}", e)))
    }

    fn process_command(&self, scratch: &Path, command: &[String]) -> Command {
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        apply_clean_env(&mut cmd, scratch);
        cmd
    }

    /// Wraps `command` in bubblewrap. The environment set on the `bwrap`
    /// process is inherited by the sandboxed interpreter.
    fn isolated_command(&self, scratch: &Path, command: &[String]) -> Command {
        let mut cmd = Command::new(BWRAP);
        cmd.args(bwrap_args(scratch, command));
        apply_clean_env(&mut cmd, scratch);
        cmd
    }

    /// Builds the `docker run` arguments for a command.
    pub fn docker_run_args(&self, id: &str, scratch: &Path, command: &[String]) -> Vec<String> {
        let image = match &self.config.backend {
            SandboxBackend::Docker { image } => image.clone(),
            SandboxBackend::Isolated | SandboxBackend::Unconfined => String::new(),
        };

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            id.to_string(),
            format!("--memory={}m", self.config.memory_limit_mb),
        ];
        if self.config.cpu_limit > 0.0 {
            args.push(format!("--cpus={}", self.config.cpu_limit));
        }
        args.extend([
            "--network=none".to_string(),
            "--pids-limit=64".to_string(),
            "-e".to_string(),
            "HOME=/workspace".to_string(),
            "-v".to_string(),
            format!("{}:/workspace", scratch.display()),
            "-w".to_string(),
            "/workspace".to_string(),
            image,
        ]);
        args.extend(command.iter().cloned());
        args
    }

    async fn kill_container(&self, id: &str) {
        let result = Command::new("docker")
            .args(["kill", id])
            .kill_on_drop(true)
            .output()
            .await;
        if let Err(e) = result {
            warn!(sandbox = %id, error = %e, "Failed to kill timed-out container");
        }
    }
}

/// Runs in `scratch` with only the variables the interpreter needs.
fn apply_clean_env(cmd: &mut Command, scratch: &Path) {
    cmd.current_dir(scratch);
    cmd.env_clear();
    if let Some(path) = std::env::var_os("PATH") {
        cmd.env("PATH", path);
    }
    cmd.env("HOME", scratch);
    cmd.env("TMPDIR", scratch);
    cmd.env("LANG", "C.UTF-8");
    cmd.env("PYTHONIOENCODING", "utf-8");
}

/// Bubblewrap arguments confining `command` to `scratch`.
///
/// The host is mounted read-only, `/tmp` is a private tmpfs and the scratch
/// directory is the only writable host path. All namespaces are unshared,
/// which leaves the sandbox without network access.
pub fn bwrap_args(scratch: &Path, command: &[String]) -> Vec<String> {
    let scratch = scratch.display().to_string();
    let mut args: Vec<String> = [
        "--unshare-all",
        "--die-with-parent",
        "--ro-bind",
        "/",
        "/",
        "--dev",
        "/dev",
        "--proc",
        "/proc",
        "--tmpfs",
        "/tmp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend([
        "--bind".to_string(),
        scratch.clone(),
        scratch.clone(),
        "--chdir".to_string(),
        scratch,
        "--".to_string(),
    ]);
    args.extend(command.iter().cloned());
    args
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{SandboxConfig, BWRAP};

    pub fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Whether bubblewrap can create its namespaces on this host.
    pub fn bwrap_usable() -> bool {
        std::process::Command::new(BWRAP)
            .args(["--unshare-all", "--ro-bind", "/", "/", "--", "true"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// The confined backend where the host supports it, a local process
    /// otherwise.
    pub fn local_config() -> SandboxConfig {
        if bwrap_usable() {
            SandboxConfig::new()
        } else {
            SandboxConfig::new().unconfined()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{bwrap_usable, local_config, python_available};
    use super::*;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.interpreter, "python3");
        assert_eq!(config.backend, SandboxBackend::Isolated);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_sandbox_config_builder() {
        let config = SandboxConfig::new()
            .with_interpreter("python3.12")
            .with_docker("python:3.12-slim")
            .with_timeout(Duration::from_secs(3))
            .with_memory_mb(256)
            .with_cpu_limit(0.5)
            .with_max_output_bytes(1024);

        assert_eq!(config.interpreter, "python3.12");
        assert_eq!(
            config.backend,
            SandboxBackend::Docker {
                image: "python:3.12-slim".to_string()
            }
        );
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.memory_limit_mb, 256);
        assert_eq!(config.max_output_bytes, 1024);
    }

    #[test]
    fn test_docker_args() {
        let sandbox = Sandbox::new(SandboxConfig::new().with_docker("python:3.12-slim"));
        let args = sandbox.docker_run_args(
            "forge-sandbox-test",
            Path::new("/tmp/scratch"),
            &["python3".to_string(), "-I".to_string(), "main.py".to_string()],
        );

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--cpus=1".to_string()));
        assert!(args.contains(&"/tmp/scratch:/workspace".to_string()));
        let image_pos = args
            .iter()
            .position(|a| a == "python:3.12-slim")
            .expect("image missing");
        assert_eq!(&args[image_pos + 1..], &["python3", "-I", "main.py"]);
    }

    #[test]
    fn test_unconfined_is_explicit() {
        let config = SandboxConfig::new().unconfined();
        assert_eq!(config.backend, SandboxBackend::Unconfined);
    }

    #[test]
    fn test_bwrap_args() {
        let args = bwrap_args(
            Path::new("/tmp/scratch"),
            &["python3".to_string(), "-I".to_string(), "main.py".to_string()],
        );

        assert!(args.contains(&"--unshare-all".to_string()));
        assert!(args.contains(&"--die-with-parent".to_string()));
        let ro = args.iter().position(|a| a == "--ro-bind").expect("ro-bind missing");
        assert_eq!(&args[ro + 1..ro + 3], &["/", "/"]);
        let bind = args.iter().position(|a| a == "--bind").expect("bind missing");
        assert_eq!(&args[bind + 1..bind + 3], &["/tmp/scratch", "/tmp/scratch"]);
        assert!(bind > ro, "scratch must be mounted over the read-only root");
        let sep = args.iter().position(|a| a == "--").expect("separator missing");
        assert_eq!(&args[sep + 1..], &["python3", "-I", "main.py"]);
    }

    fn main_py(source: &str) -> (Vec<SandboxFile>, Vec<String>) {
        (
            vec![SandboxFile::new("main.py", source)],
            vec!["main.py".to_string()],
        )
    }

    #[tokio::test]
    async fn test_isolated_rejects_write_outside_scratch() {
        if !python_available() || !bwrap_usable() {
            eprintln!("python3 or usable bwrap not found; skipping");
            return;
        }

        let outside = tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).expect("outside dir");
        let target = outside.path().join("escaped.txt");
        let (files, args) = main_py(&format!(
            "open({:?}, 'w').write('x')\n",
            target.display().to_string()
        ));

        let sandbox = Sandbox::new(SandboxConfig::new());
        let outcome = sandbox.run(&files, &args).await.expect("run");

        assert_ne!(outcome.exit_code, Some(0));
        assert!(outcome.stderr.contains("Error"), "stderr: {}", outcome.stderr);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_isolated_allows_scratch_writes() {
        if !python_available() || !bwrap_usable() {
            eprintln!("python3 or usable bwrap not found; skipping");
            return;
        }

        let (files, args) = main_py(
            "with open('out.txt', 'w') as f:\n    f.write('x')\nprint(open('out.txt').read())\n",
        );
        let sandbox = Sandbox::new(SandboxConfig::new());
        let outcome = sandbox.run(&files, &args).await.expect("run");

        assert_eq!(outcome.exit_code, Some(0), "stderr: {}", outcome.stderr);
        assert_eq!(outcome.stdout.trim(), "x");
    }

    #[tokio::test]
    async fn test_isolated_has_no_network() {
        if !python_available() || !bwrap_usable() {
            eprintln!("python3 or usable bwrap not found; skipping");
            return;
        }

        let (files, args) = main_py(
            "import socket\nsocket.create_connection(('1.1.1.1', 53), timeout=2)\n",
        );
        let sandbox = Sandbox::new(SandboxConfig::new());
        let outcome = sandbox.run(&files, &args).await.expect("run");

        assert_ne!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_unconfined_runs_locally() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }

        let (files, args) = main_py("import os\nprint(os.path.exists('main.py'))\n");
        let sandbox = Sandbox::new(SandboxConfig::new().unconfined());
        let outcome = sandbox.run(&files, &args).await.expect("run");

        assert_eq!(outcome.exit_code, Some(0), "stderr: {}", outcome.stderr);
        assert_eq!(outcome.stdout.trim(), "True");
    }

    #[tokio::test]
    async fn test_check_ready_reports_version() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let version = Sandbox::new(local_config())
            .check_ready()
            .await
            .expect("sandbox ready");
        assert!(version.starts_with("Python 3"), "version: {version}");
    }

    #[tokio::test]
    async fn test_check_ready_fails_without_interpreter() {
        let sandbox = Sandbox::new(
            local_config().with_interpreter("definitely-not-a-real-python-forge"),
        );
        assert!(sandbox.check_ready().await.is_err());
    }

    #[tokio::test]
    async fn test_scratch_root_must_exist() {
        let sandbox = Sandbox::new(
            SandboxConfig::new().with_scratch_root("/nonexistent/forge/scratch/root"),
        );
        let result = sandbox.run(&[], &["-c".to_string(), "pass".to_string()]).await;
        assert!(matches!(result, Err(SandboxError::Setup(_))));
    }
}
