//! WebSocket transport for terminals and live metrics.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /ws?token=<session token>`. The token is
//!    checked before the upgrade; a bad one gets `401` and no socket.
//! 2. All messages are JSON objects with a `"type"` field, handled one at a
//!    time in arrival order. Malformed messages are logged and dropped.
//! 3. On disconnect every terminal the connection created is killed and its
//!    metrics subscription is cancelled.
//!
//! ## Message types (client → server)
//!
//! | Type                 | Fields                     | Response                      |
//! |----------------------|----------------------------|-------------------------------|
//! | `terminal:create`    | `id?`, `cols?`, `rows?`    | `terminal:ready`              |
//! | `terminal:input`     | `id?`, `data`              | (none)                        |
//! | `terminal:resize`    | `id?`, `cols`, `rows`      | (none, resize is inert)       |
//! | `terminal:kill`      | `id?`                      | (none)                        |
//! | `system:subscribe`   | none                       | `system:data` now and every tick |
//! | `system:unsubscribe` | none                       | (none)                        |
//!
//! `id` defaults to the connection's most recently created terminal.
//!
//! ## Message types (server → client)
//!
//! | Type             | Key fields             |
//! |------------------|------------------------|
//! | `terminal:ready` | `id`                   |
//! | `terminal:data`  | `id`, `data`           |
//! | `terminal:exit`  | `id`, `code`           |
//! | `system:data`    | `data` (snapshot)      |

use std::sync::atomic::Ordering;

use axum::{
    extract::{ws::Message, ws::WebSocket, FromRequestParts, Query, Request, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, Principal, TokenClass};
use crate::error::ApiError;
use crate::metrics::MetricsSubscription;
use crate::sessions::{SessionEvent, SessionHandle};
use crate::state::AppState;

/// Client-chosen terminal ids longer than this are replaced by a generated one.
const MAX_CLIENT_ID_LEN: usize = 64;

#[derive(Deserialize)]
pub struct WsQuery {
    /// Session token, passed in the query because browsers cannot set
    /// headers on a WebSocket upgrade.
    pub token: Option<String>,
}

/// `GET /ws?token=<token>`: authenticate, then upgrade.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    req: Request,
) -> Response {
    let principal = match state
        .gate
        .authenticate(query.token.as_deref(), TokenClass::Session)
    {
        Ok(p) => p,
        Err(e) => {
            warn!("WebSocket rejected: {e}");
            let e = match e {
                AuthError::WrongTokenClass => AuthError::InvalidToken,
                other => other,
            };
            return ApiError::from(e).into_response();
        }
    };

    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws.on_upgrade(move |socket| handle_ws(socket, state, principal)),
        Err(rejection) => rejection.into_response(),
    }
}

/// Per-connection state. Terminal ids are scoped to the connection in the
/// registry as `<conn>/<id>`.
struct Connection {
    conn_id: String,
    state: AppState,
    tx: mpsc::Sender<Value>,
    /// Client ids in creation order; the last one is the default target.
    terminals: Vec<String>,
    forwarders: Vec<JoinHandle<()>>,
    metrics: MetricsSubscription,
}

impl Connection {
    fn session_key(&self, client_id: &str) -> String {
        format!("{}/{client_id}", self.conn_id)
    }

    /// Explicit `id`, else the most recent terminal.
    fn target(&self, msg: &Value) -> Option<String> {
        msg["id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.terminals.last().cloned())
    }

    async fn dispatch(&mut self, msg: &Value) {
        match msg["type"].as_str().unwrap_or("") {
            "terminal:create" => self.create_terminal(msg).await,
            "terminal:input" => {
                let Some(id) = self.target(msg) else { return };
                let data = msg["data"].as_str().unwrap_or("");
                self.state.sessions.write(&self.session_key(&id), data).await;
            }
            "terminal:resize" => {
                let Some(id) = self.target(msg) else { return };
                #[allow(clippy::cast_possible_truncation)]
                let cols = msg["cols"].as_u64().unwrap_or(80) as u16;
                #[allow(clippy::cast_possible_truncation)]
                let rows = msg["rows"].as_u64().unwrap_or(24) as u16;
                self.state
                    .sessions
                    .resize(&self.session_key(&id), cols, rows)
                    .await;
            }
            "terminal:kill" => {
                let Some(id) = self.target(msg) else { return };
                self.state.sessions.kill(&self.session_key(&id)).await;
                self.terminals.retain(|t| *t != id);
            }
            "system:subscribe" => self.metrics.subscribe(self.tx.clone()),
            "system:unsubscribe" => {
                self.metrics.unsubscribe();
            }
            other => warn!("WS {}: unknown message type {other:?} dropped", self.conn_id),
        }
    }

    async fn create_terminal(&mut self, msg: &Value) {
        let id = msg["id"]
            .as_str()
            .filter(|s| !s.is_empty() && s.len() <= MAX_CLIENT_ID_LEN && !s.contains('/'))
            .map_or_else(generate_terminal_id, str::to_string);

        match self
            .state
            .sessions
            .create(&self.session_key(&id), &self.state.shell)
            .await
        {
            Ok(handle) => {
                let _ = self
                    .tx
                    .send(json!({ "type": "terminal:ready", "id": id }))
                    .await;
                track(
                    &mut self.forwarders,
                    tokio::spawn(forward_events(id.clone(), handle, self.tx.clone())),
                );
                self.terminals.retain(|t| *t != id);
                self.terminals.push(id);
            }
            Err(e) => {
                error!("WS {}: terminal {id} failed to start: {e}", self.conn_id);
                let _ = self
                    .tx
                    .send(json!({
                        "type": "terminal:data",
                        "id": id,
                        "data": format!("\r\nError: {e}\r\n"),
                    }))
                    .await;
            }
        }
    }

    async fn close(mut self) {
        self.metrics.unsubscribe();
        let killed = self
            .state
            .sessions
            .kill_prefixed(&format!("{}/", self.conn_id))
            .await;
        for task in self.forwarders.drain(..) {
            task.abort();
        }
        info!("WS {} closed, {killed} terminal(s) killed", self.conn_id);
    }
}

/// Relay one session's events to the socket until its channel closes.
async fn forward_events(id: String, mut handle: SessionHandle, tx: mpsc::Sender<Value>) {
    while let Some(event) = handle.events.recv().await {
        let msg = match event {
            SessionEvent::Data(data) => json!({ "type": "terminal:data", "id": id, "data": data }),
            SessionEvent::Exit(code) => json!({ "type": "terminal:exit", "id": id, "code": code }),
            SessionEvent::Error(message) => json!({
                "type": "terminal:data",
                "id": id,
                "data": format!("\r\nError: {message}\r\n"),
            }),
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }
    debug!("Terminal {id} event stream ended");
}

/// Keep `task`, forgetting forwarders of terminals that already ended.
fn track(forwarders: &mut Vec<JoinHandle<()>>, task: JoinHandle<()>) {
    forwarders.retain(|h| !h.is_finished());
    forwarders.push(task);
}

/// `term_<epoch-ms>_<9 random chars>`.
fn generate_terminal_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("term_{}_{}", crate::auth::store::now_ms(), &random[..9])
}

/// Main WebSocket event loop.
///
/// Outgoing messages are funneled through an mpsc channel so session and
/// metrics tasks can send without holding the socket.
async fn handle_ws(socket: WebSocket, state: AppState, principal: Principal) {
    let conn_id = format!("c{}", state.next_conn_id.fetch_add(1, Ordering::Relaxed));
    info!(user = %principal.username, "WS {conn_id} connected");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(256);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let shutdown = state.shutdown.clone();
    let mut conn = Connection {
        conn_id,
        metrics: MetricsSubscription::new(
            state.collector.clone(),
            std::time::Duration::from_millis(state.config.metrics.interval_ms),
        ),
        state,
        tx,
        terminals: Vec::new(),
        forwarders: Vec::new(),
    };

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<Value>(&text) {
                        Ok(parsed) if parsed.is_object() => conn.dispatch(&parsed).await,
                        _ => warn!("WS {}: malformed message dropped", conn.conn_id),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            () = shutdown.cancelled() => {
                debug!("WS {}: shutting down", conn.conn_id);
                break;
            }
        }
    }

    conn.close().await;
    send_task.abort();
}
