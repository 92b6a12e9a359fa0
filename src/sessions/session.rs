//! One spawned terminal shell and its I/O tasks.
//!
//! A [`TerminalSession`] owns four background tasks:
//!
//! - **stdin writer**: drains an mpsc of byte chunks into the shell's stdin.
//! - **stdout / stderr readers**: push [`SessionEvent::Data`] into the
//!   session's bounded event channel in arrival order. The two streams are
//!   merged best-effort; no ordering between them is imposed.
//! - **exit watcher**: reaps the child, lets the readers drain for up to a
//!   second, then emits a single [`SessionEvent::Exit`]. Readers
//!   still running after the grace (a background job holding the pipes) are
//!   aborted, so no data ever follows the exit.
//!
//! The event channel is bounded: when the connection falls behind, the
//! readers stop pulling from the pipes and the shell blocks on write.
//!
//! ## Process groups
//!
//! The shell leads its own process group, so [`TerminalSession::kill`]
//! reaches everything it started (`kill(-pgid, SIGKILL)`).

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::SessionError;

/// How long the exit watcher waits for the output pipes to reach EOF after
/// the shell itself has exited. Background jobs can hold them open.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Upper bound on waiting for a killed shell to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Notifications from a session to its owning connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of merged stdout/stderr output.
    Data(String),
    /// The process exited on its own. Carries the exit code when there is one.
    Exit(Option<i32>),
    /// The process could not be waited on.
    Error(String),
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Exited,
    Killed,
}

/// A running (or finished, not yet removed) terminal shell.
pub struct TerminalSession {
    pub id: String,
    /// OS process ID of the shell (also its process group ID).
    pub pid: u32,
    status: Arc<Mutex<SessionStatus>>,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    /// stdin writer and the two output readers.
    io_tasks: Vec<AbortHandle>,
    exit_task: JoinHandle<()>,
}

impl TerminalSession {
    /// Take ownership of a freshly spawned child and start its I/O tasks.
    ///
    /// Returns the session plus the receiving end of its event channel.
    pub fn spawn(
        id: String,
        mut child: Child,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let pid = child.id().unwrap_or(0);

        let stdin = child.stdin.take().ok_or(SessionError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SessionError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SessionError::MissingPipe("stderr"))?;

        let (events_tx, events_rx) = mpsc::channel::<SessionEvent>(capacity.max(1));
        let status = Arc::new(Mutex::new(SessionStatus::Running));

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let stdout_task = tokio::spawn(pump_output(
            format!("{id} stdout"),
            stdout,
            events_tx.clone(),
        ));
        let stderr_task = tokio::spawn(pump_output(
            format!("{id} stderr"),
            stderr,
            events_tx.clone(),
        ));

        let io_tasks = vec![
            stdin_task.abort_handle(),
            stdout_task.abort_handle(),
            stderr_task.abort_handle(),
        ];

        let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];
        let sid = id.clone();
        let status_exit = Arc::clone(&status);
        let exit_task = tokio::spawn(async move {
            let waited = child.wait().await;

            // Let the readers hit EOF so every chunk written before exit is
            // queued ahead of the exit notification.
            let drain = async {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
            };
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                debug!("Session {sid}: output still open after exit, closing readers");
                for reader in &readers {
                    reader.abort();
                }
            }

            let mut status = status_exit.lock().await;
            if *status == SessionStatus::Killed {
                return;
            }
            *status = SessionStatus::Exited;
            drop(status);

            let event = match waited {
                Ok(s) => {
                    info!("Session {sid} exited with code {:?}", s.code());
                    SessionEvent::Exit(s.code())
                }
                Err(e) => {
                    error!("Session {sid} wait error: {e}");
                    SessionEvent::Error(format!("Process wait error: {e}"))
                }
            };
            let _ = events_tx.send(event).await;
        });

        Ok((
            TerminalSession {
                id,
                pid,
                status,
                stdin_tx,
                io_tasks,
                exit_task,
            },
            events_rx,
        ))
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.lock().await
    }

    /// A sender for the shell's stdin, or `None` once the process is gone.
    pub async fn stdin(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        if self.status().await == SessionStatus::Running && !self.stdin_tx.is_closed() {
            Some(self.stdin_tx.clone())
        } else {
            None
        }
    }

    /// Terminate the process group and wait (bounded) for it to be reaped.
    ///
    /// Output already queued stays queued; nothing new is read. No exit
    /// notification is emitted for a killed session. Killing a session that
    /// already exited only tears down what is left of its tasks.
    pub async fn kill(self) {
        {
            let mut status = self.status.lock().await;
            if *status == SessionStatus::Running {
                *status = SessionStatus::Killed;
            }
        }

        for task in &self.io_tasks {
            task.abort();
        }

        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!("Session {}: killpg({pgid}) failed: {e}", self.id),
            }
        }

        let abort = self.exit_task.abort_handle();
        if tokio::time::timeout(REAP_TIMEOUT, self.exit_task)
            .await
            .is_err()
        {
            warn!("Session {}: not reaped within {REAP_TIMEOUT:?}", self.id);
            abort.abort();
        }
    }
}

/// Read chunks from one output pipe and forward them as `Data` events.
async fn pump_output(
    label: String,
    mut reader: impl AsyncRead + Unpin,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut decoder = Utf8Chunker::default();
    let mut tmp = [0u8; 4096];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = decoder.push(&tmp[..n]);
                if !text.is_empty() && events.send(SessionEvent::Data(text)).await.is_err() {
                    break;
                }
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        let _ = events.send(SessionEvent::Data(rest)).await;
    }
    debug!("Session {label} closed");
}

/// Decodes a byte stream as UTF-8 without splitting multi-byte characters
/// that straddle two reads. Invalid sequences become U+FFFD.
#[derive(Default)]
pub(crate) struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let keep = incomplete_tail(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, possibly incomplete UTF-8 sequence (0..=3 bytes).
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            // continuation byte, keep looking for the lead byte
            continue;
        }
        let needed = match b {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_joins_split_characters() {
        let bytes = "héllo €".as_bytes();
        let mut decoder = Utf8Chunker::default();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&decoder.push(std::slice::from_ref(b)));
        }
        out.push_str(&decoder.finish());
        assert_eq!(out, "héllo €");
    }

    #[test]
    fn test_chunker_passes_ascii_through() {
        let mut decoder = Utf8Chunker::default();
        assert_eq!(decoder.push(b"ls -la\n"), "ls -la\n");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_chunker_replaces_invalid_bytes() {
        let mut decoder = Utf8Chunker::default();
        assert_eq!(decoder.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[test]
    fn test_incomplete_tail_lengths() {
        assert_eq!(incomplete_tail(b"abc"), 0);
        assert_eq!(incomplete_tail(&[0xe2, 0x82]), 2);
        assert_eq!(incomplete_tail(&[0xe2, 0x82, 0xac]), 0);
        assert_eq!(incomplete_tail(&[b'a', 0xf0]), 1);
    }
}
