//! Parent-side sandbox executor.
//!
//! Writes the fitness source into a fresh bounded scratch directory, spawns
//! the `opthub-sandbox` child with a cleared environment, feeds it one JSON
//! request on stdin, enforces the soft/hard deadlines, and decodes the
//! single JSON outcome from its stdout. Scratch teardown is unconditional;
//! teardown failures are logged and never mask the primary error.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use opthub_protocol::ChildOutcome;
use opthub_protocol::ChildRequest;
use opthub_protocol::JobError;
use opthub_protocol::OptimizationResult;
use opthub_protocol::SandboxJobSpec;
use opthub_protocol::SandboxLimits;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Environment variable overriding the child binary location.
pub const SANDBOX_EXE_ENV_VAR: &str = "OPTHUB_SANDBOX_EXE";

const SOURCE_FILE_NAME: &str = "fitness.py";

/// Upper bound on child output we are willing to buffer.
const MAX_CHILD_OUTPUT_BYTES: u64 = 8 * 1024 * 1024;

/// Resolved once per process and reused by every executor; the sandbox
/// equivalent of an image that is built on first use and cached.
static CHILD_EXE: OnceLock<Result<PathBuf, String>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox child executable not found: {0}")]
    ChildExeNotFound(String),
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub limits: SandboxLimits,
    /// Total wall-clock budget for one execution.
    pub hard_timeout: Duration,
    /// How long before the hard deadline the graceful termination starts.
    pub soft_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: SandboxLimits::default(),
            hard_timeout: Duration::from_secs(600),
            soft_grace: Duration::from_secs(30),
        }
    }
}

pub struct SandboxExecutor {
    config: SandboxConfig,
    child_exe: PathBuf,
}

impl SandboxExecutor {
    /// Resolve the child binary (once per process) and build an executor.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let resolved = CHILD_EXE.get_or_init(|| resolve_child_exe().map_err(|err| err.to_string()));
        match resolved {
            Ok(child_exe) => Ok(Self {
                config,
                child_exe: child_exe.clone(),
            }),
            Err(message) => Err(SandboxError::ChildExeNotFound(message.clone())),
        }
    }

    /// Execute one user-fitness optimization in an isolated child process.
    ///
    /// `cancel` propagates job-level cancellation into the child: on cancel
    /// the child receives SIGTERM, then SIGKILL after the grace period.
    pub async fn execute(
        &self,
        source: &str,
        spec: SandboxJobSpec,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, JobError> {
        let scratch = tempfile::tempdir()
            .map_err(|err| JobError::container(format!("failed to create scratch dir: {err}")))?;
        let source_path = scratch.path().join(SOURCE_FILE_NAME);
        std::fs::write(&source_path, source)
            .map_err(|err| JobError::container(format!("failed to write fitness source: {err}")))?;

        let request = ChildRequest {
            source_path,
            spec,
            limits: self.config.limits,
        };
        let outcome = self.run_child(&request, cancel).await;

        // Unconditional teardown; never mask the primary error with it.
        if let Err(err) = scratch.close() {
            warn!("failed to remove sandbox scratch dir: {err}");
        }
        outcome
    }

    async fn run_child(
        &self,
        request: &ChildRequest,
        cancel: &CancellationToken,
    ) -> Result<OptimizationResult, JobError> {
        let request_json = serde_json::to_vec(request)
            .map_err(|err| JobError::container(format!("failed to encode request: {err}")))?;

        let scratch_dir = request
            .source_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let mut command = Command::new(&self.child_exe);
        command
            .current_dir(scratch_dir)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|err| JobError::container(format!("failed to launch sandbox child: {err}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that dies before reading closes the pipe; that is
            // diagnosed from its exit status, not from this write.
            let _ = stdin.write_all(&request_json).await;
            let _ = stdin.shutdown().await;
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_capped(stdout));
        let stderr_task = tokio::spawn(read_capped(stderr));

        let soft_deadline = self
            .config
            .hard_timeout
            .saturating_sub(self.config.soft_grace);

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(soft_deadline) => None,
            _ = cancel.cancelled() => None,
        };

        let (status, timed_out) = match status {
            Some(status) => (status, false),
            None => {
                // Graceful first: SIGTERM, then SIGKILL at the hard deadline.
                terminate_gracefully(&child);
                match tokio::time::timeout(self.config.soft_grace, child.wait()).await {
                    Ok(status) => (status, true),
                    Err(_) => {
                        let _ = child.start_kill();
                        (child.wait().await, true)
                    }
                }
            }
        };

        let status = status
            .map_err(|err| JobError::container(format!("failed to reap sandbox child: {err}")))?;
        let stdout_buf = stdout_task.await.unwrap_or_default();
        let stderr_buf = stderr_task.await.unwrap_or_default();

        if timed_out {
            let message = if cancel.is_cancelled() {
                "sandbox execution cancelled".to_string()
            } else {
                format!(
                    "sandbox execution exceeded {} seconds",
                    self.config.hard_timeout.as_secs()
                )
            };
            return Err(JobError::timeout(message));
        }

        match serde_json::from_slice::<ChildOutcome>(&stdout_buf) {
            Ok(ChildOutcome::Result { result }) => Ok(result),
            Ok(ChildOutcome::Error { error }) => Err(error),
            Err(decode_err) => Err(classify_undecodable(
                status,
                &stdout_buf,
                &stderr_buf,
                &decode_err,
            )),
        }
    }
}

async fn read_capped<R>(reader: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(reader) = reader {
        let _ = reader.take(MAX_CHILD_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

/// Ask the child to wind down. On Linux this is SIGTERM so the child can
/// exit cleanly; elsewhere we go straight to the kill that follows anyway.
fn terminate_gracefully(child: &Child) {
    #[cfg(target_os = "linux")]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        return;
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = child;
    }
}

/// The child produced no decodable outcome; classify from the exit status.
fn classify_undecodable(
    status: std::process::ExitStatus,
    stdout_buf: &[u8],
    stderr_buf: &[u8],
    decode_err: &serde_json::Error,
) -> JobError {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.signal() {
            // SIGKILL or SIGXCPU: a resource ceiling, not a crash.
            Some(libc_signal) if libc_signal == 9 || libc_signal == 24 => {
                return JobError::resource(format!(
                    "sandbox child killed by signal {libc_signal} (resource limit)"
                ));
            }
            // SIGABRT: allocator failure under RLIMIT_AS.
            Some(6) => {
                return JobError::resource("sandbox child aborted (memory limit)".to_string());
            }
            Some(signal) => {
                return JobError::container(format!("sandbox child killed by signal {signal}"));
            }
            None => {}
        }
    }

    if status.success() && !stdout_buf.is_empty() {
        return JobError::parse(format!("undecodable sandbox output: {decode_err}"));
    }
    let stderr_excerpt = String::from_utf8_lossy(stderr_buf);
    JobError::container(format!(
        "sandbox child exited with {status}: {}",
        stderr_excerpt.trim()
    ))
}

fn resolve_child_exe() -> std::io::Result<PathBuf> {
    if let Some(path) = std::env::var_os(SANDBOX_EXE_ENV_VAR) {
        let path = PathBuf::from(path);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{SANDBOX_EXE_ENV_VAR} points at {}", path.display()),
            ))
        };
    }
    let current = std::env::current_exe()?;
    // Test binaries live one directory below the built executables, so look
    // next to the current executable first and one level up second.
    let mut candidates = Vec::new();
    if let Some(dir) = current.parent() {
        candidates.push(dir.join("opthub-sandbox"));
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join("opthub-sandbox"));
        }
    }
    for candidate in candidates {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!(
            "no opthub-sandbox next to {} and {SANDBOX_EXE_ENV_VAR} is unset",
            current.display()
        ),
    ))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::classify_undecodable;
    use opthub_protocol::ErrorKind;

    fn decode_error() -> serde_json::Error {
        match serde_json::from_str::<serde_json::Value>("") {
            Err(err) => err,
            Ok(value) => panic!("empty input decoded to {value:?}"),
        }
    }

    #[cfg(unix)]
    fn status_from_raw(raw: i32) -> std::process::ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(raw)
    }

    #[cfg(unix)]
    #[test]
    fn sigkill_is_classified_as_resource() {
        let status = status_from_raw(9); // killed by SIGKILL
        let err = classify_undecodable(status, b"", b"", &decode_error());
        assert_eq!(err.kind, ErrorKind::Resource);
    }

    #[cfg(unix)]
    #[test]
    fn clean_exit_with_garbage_stdout_is_a_parse_error() {
        let status = status_from_raw(0);
        let err = classify_undecodable(status, b"not json", b"", &decode_error());
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_a_container_error() {
        let status = status_from_raw(1 << 8); // exit code 1
        let err = classify_undecodable(status, b"", b"hardening failed", &decode_error());
        assert_eq!(err.kind, ErrorKind::Container);
        assert!(err.message.contains("hardening failed"));
    }
}
