//! Low-level process spawning and output capture.
//!
//! [`spawn_shell_pgroup`] starts interactive terminal shells; [`exec_command`]
//! runs one-shot tool invocations (the distro controller). Both set
//! `kill_on_drop(true)` so a process is not left behind if its owning task
//! is cancelled.

use std::fmt::Write;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

/// Max output size per stream for [`exec_command`] (1 MB).
///
/// Output beyond this limit is still drained from the pipe (to prevent
/// deadlocks) but discarded. A truncation notice is appended to the returned
/// string.
const MAX_EXEC_OUTPUT: usize = 1024 * 1024;

/// Spawn an interactive shell in its own process group with piped I/O.
///
/// `setpgid(0, 0)` in `pre_exec` makes the shell a process group leader so
/// the whole tree it starts can be killed with one `kill(-pgid, ..)`.
pub fn spawn_shell_pgroup(program: &str, args: &[&str], working_dir: &str) -> std::io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    cmd.spawn()
}

/// Run `program args...` to completion and capture its output.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at [`MAX_EXEC_OUTPUT`] bytes. The entire operation is bounded by
/// `timeout`; on expiry the child is killed via `kill_on_drop`.
pub async fn exec_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<ExecResult, ExecError> {
    let start = std::time::Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(format!("{program}: {e}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    match Box::pin(tokio::time::timeout(timeout, async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_EXEC_OUTPUT),
            read_capped(&mut stderr, MAX_EXEC_OUTPUT),
        );
        drop(stdout);
        drop(stderr);

        let status = child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;

        Ok::<_, ExecError>(ExecResult {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_data,
            stderr: stderr_data,
            duration_ms,
        })
    }))
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout),
    }
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest.
///
/// Keeps reading past the cap instead of closing the pipe early: closing a
/// pipe while the child is still writing raises SIGPIPE in the child.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

/// Successful result of [`exec_command`].
#[derive(Debug)]
pub struct ExecResult {
    /// Process exit code, or `-1` if the code was unavailable (e.g. killed by signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock duration of the command in milliseconds.
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors that can occur during [`exec_command`].
#[derive(Debug, Error)]
pub enum ExecError {
    /// The binary could not be started (e.g. not found, permission denied).
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),
    /// The child process started but `wait()` failed.
    #[error("Process error: {0}")]
    ProcessFailed(String),
    /// The command exceeded its timeout and was killed.
    #[error("Command timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_captures_both_streams() {
        let result = exec_command("sh", &["-c", "echo out; echo err >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_exec_reports_duration() {
        let result = exec_command("sh", &["-c", "sleep 0.2"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.duration_ms >= 200, "took {}ms", result.duration_ms);
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let err = exec_command("sh", &["-c", "sleep 5"], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout));
    }

    #[tokio::test]
    async fn test_exec_missing_binary() {
        let err = exec_command("/nonexistent/tool", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_read_capped_truncates() {
        let data = vec![b'a'; 100];
        let mut reader = &data[..];
        let s = read_capped(&mut reader, 10).await;
        assert!(s.starts_with("aaaaaaaaaa\n[truncated: 100 bytes total"));
    }
}
