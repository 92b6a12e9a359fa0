//! Terminal session registry.
//!
//! [`SessionRegistry`] is the single authority for creating, writing to and
//! destroying terminal shells. Each session is keyed by an id the caller
//! scopes (the WebSocket layer prefixes it with the connection id), so two
//! connections can never address each other's shells.
//!
//! A session record is not removed when its shell exits on its own; it stays
//! until the next `create` with the same id replaces it or `kill` removes it.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`. `write` and `status` take a read lock;
//! `create`, `kill` and `kill_all` take the write lock only to move records
//! in or out. Killing and reaping happen after the lock is released, so a
//! slow reap never stalls other connections. A replaced shell is still gone
//! before its successor starts.
//!
//! `write` never waits on a shell: input that does not fit the stdin queue
//! is dropped with a warning.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::shell::process::spawn_shell_pgroup;
use crate::shell::ShellSpec;
pub use session::{SessionEvent, SessionStatus, TerminalSession};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to start shell: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Shell has no {0} pipe")]
    MissingPipe(&'static str),
}

/// What the creator of a session gets back.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub pid: u32,
    /// Output, exit and error notifications, in emission order.
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Shared pool of terminal sessions.
///
/// Cloneable; all clones share the same map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, TerminalSession>>>,
    /// Capacity of each session's event channel.
    output_buffer: usize,
}

impl SessionRegistry {
    pub fn new(output_buffer: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            output_buffer,
        }
    }

    /// Start a shell under `id`, killing any session already holding that id.
    ///
    /// The old shell is taken out of the map, then signalled and reaped
    /// before the new one is spawned.
    /// Output the old shell queued before that point still reaches the old
    /// handle's receiver; nothing it produces afterwards does.
    pub async fn create(&self, id: &str, shell: &ShellSpec) -> Result<SessionHandle, SessionError> {
        let replaced = self.sessions.write().await.remove(id);
        if let Some(old) = replaced {
            info!("Replacing session {id} (pid {})", old.pid);
            old.kill().await;
        }

        let child = spawn_shell_pgroup(&shell.program, &shell.arg_refs(), &shell.working_dir)?;
        let (session, events) = TerminalSession::spawn(id.to_string(), child, self.output_buffer)?;
        let pid = session.pid;
        let stale = self.sessions.write().await.insert(id.to_string(), session);
        if let Some(stale) = stale {
            warn!("Session {id} was recreated concurrently, killing pid {}", stale.pid);
            stale.kill().await;
        }

        info!(
            "Session {id} started: {} in {} (pid {pid})",
            shell.program, shell.working_dir
        );
        Ok(SessionHandle {
            id: id.to_string(),
            pid,
            events,
        })
    }

    /// Queue raw input for the session's stdin without waiting.
    ///
    /// Returns `true` when the input was queued. A missing or finished
    /// session drops it silently; a shell that is not reading its stdin
    /// (queue full) drops it with a warning.
    pub async fn write(&self, id: &str, data: &str) -> bool {
        let stdin = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(session) => session.stdin().await,
                None => None,
            }
        };
        let Some(tx) = stdin else {
            debug!("Input for inactive session {id} dropped");
            return false;
        };
        match tx.try_send(data.as_bytes().to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(chunk)) => {
                warn!("Session {id}: stdin queue full, {} byte(s) dropped", chunk.len());
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Input for closed session {id} dropped");
                false
            }
        }
    }

    /// Accepted for protocol compatibility. Shells run on pipes, so there is
    /// no window size to change.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) {
        debug!("Resize {id} to {cols}x{rows} ignored");
    }

    /// Kill the session and drop its record. Returns `false` if there was none.
    pub async fn kill(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                info!("Killing session {id} (pid {})", session.pid);
                session.kill().await;
                true
            }
            None => false,
        }
    }

    /// Kill every session whose id starts with `prefix`.
    pub async fn kill_prefixed(&self, prefix: &str) -> usize {
        let doomed: Vec<TerminalSession> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            ids.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        let count = doomed.len();
        join_all(doomed.into_iter().map(TerminalSession::kill)).await;
        count
    }

    /// Kill all sessions. Used on shutdown.
    pub async fn kill_all(&self) -> usize {
        let doomed: Vec<TerminalSession> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = doomed.len();
        if count > 0 {
            info!("Killing {count} session(s)");
        }
        join_all(doomed.into_iter().map(TerminalSession::kill)).await;
        count
    }

    pub async fn status(&self, id: &str) -> Option<SessionStatus> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(s) => Some(s.status().await),
            None => None,
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
