//! Bounded child-process execution.
//!
//! Spawns a command in its own process group, feeds optional stdin, captures
//! stdout and stderr into bounded buffers and enforces a wall-clock timeout
//! from the host side. Once the child exits or the timeout elapses the whole
//! group is killed, so background processes the child started do not outlive
//! the run. Output captured before a timeout is kept.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SandboxError;

const CHUNK_SIZE: usize = 64 * 1024;

/// How long readers may keep draining pipes after the group was killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Captured result of a finished (or killed) child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The wall-clock limit elapsed and the process was killed.
    pub timed_out: bool,
    /// Output exceeded the capture budget and was cut.
    pub truncated: bool,
    pub duration: Duration,
}

/// Bytes read from one stream so far. Shared with the reader task so a
/// timeout does not lose what was already captured.
#[derive(Debug, Default)]
struct Capture {
    buf: Vec<u8>,
    exceeded: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

fn take_capture(capture: &SharedCapture) -> (String, bool) {
    let mut guard = capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let buf = std::mem::take(&mut guard.buf);
    (String::from_utf8_lossy(&buf).into_owned(), guard.exceeded)
}

/// Reads a stream to its end, keeping at most `limit` bytes.
///
/// Excess output is drained and discarded so the child never blocks on a
/// full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut stream: R, limit: usize, capture: SharedCapture) {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut guard = capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let remaining = limit.saturating_sub(guard.buf.len());
                if n > remaining {
                    guard.buf.extend_from_slice(&chunk[..remaining]);
                    guard.exceeded = true;
                } else {
                    guard.buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

/// The child's process group. Dropping it kills every remaining member.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self { pgid: leader }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => debug!(pgid, error = %e, "Failed to kill process group"),
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Runs a command to completion under a timeout.
///
/// # Arguments
///
/// * `cmd` - The configured command; pipes and the process group are set here
/// * `stdin` - Bytes written to the child's stdin, which is then closed
/// * `timeout` - Wall-clock limit for the whole run
/// * `max_output_bytes` - Capture budget, split evenly between stdout and stderr
pub async fn run_bounded(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ProcessOutput, SandboxError> {
    let program = cmd.as_std().get_program().to_string_lossy().to_string();

    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| SandboxError::Spawn {
        command: program.clone(),
        reason: e.to_string(),
    })?;
    let mut group = ProcessGroup::new(child.id());

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Setup("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Setup("failed to capture stderr".to_string()))?;

    let per_stream_limit = (max_output_bytes / 2).max(1);
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let readers: Vec<JoinHandle<()>> = vec![
        tokio::spawn(read_bounded(stdout, per_stream_limit, stdout_capture.clone())),
        tokio::spawn(read_bounded(stderr, per_stream_limit, stderr_capture.clone())),
    ];

    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(data)) => {
            let data = data.to_vec();
            Some(tokio::spawn(async move {
                // The child may exit before reading everything.
                if let Err(e) = pipe.write_all(&data).await {
                    debug!(error = %e, "stdin write interrupted");
                }
            }))
        }
        _ => None,
    };

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    group.kill();

    let (exit_code, timed_out) = match waited {
        Ok(status) => {
            let status = status.map_err(|e| SandboxError::Wait(e.to_string()))?;
            (status.code(), false)
        }
        Err(_) => {
            if let Err(e) = child.start_kill() {
                debug!(command = %program, error = %e, "Timed-out process already gone");
            }
            child
                .wait()
                .await
                .map_err(|e| SandboxError::Wait(e.to_string()))?;
            debug!(command = %program, timeout_ms = timeout.as_millis() as u64, "Process timed out");
            (None, true)
        }
    };

    if let Some(writer) = writer {
        writer.abort();
    }
    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let (stdout, out_exceeded) = take_capture(&stdout_capture);
    let (stderr, err_exceeded) = take_capture(&stderr_capture);
    Ok(ProcessOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        truncated: out_exceeded || err_exceeded,
        duration: start.elapsed(),
    })
}
