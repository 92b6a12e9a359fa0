//! Reverse proxy for the terminal daemon mount (`/ttyd` by default).
//!
//! Plain HTTP requests and WebSocket upgrades under the prefix are forwarded
//! to one loopback backend. Both paths go through [`authorize`] first, so no
//! byte reaches the backend without a valid `proxy`-class token in
//! `?token=`. The prefix and the `token` parameter are stripped before
//! forwarding.
//!
//! A rejected upgrade gets a bare `401` with `Connection: close`. The
//! backend WebSocket is dialled before the client upgrade is accepted, so an
//! unreachable backend fails the handshake (`502`) instead of opening a
//! socket that immediately dies.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        FromRequestParts, Request, State,
    },
    http::{
        header::{CONNECTION, HOST, SEC_WEBSOCKET_PROTOCOL, UPGRADE},
        HeaderValue, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as TungsteniteMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, CredentialGate, Principal, TokenClass};
use crate::config::ProxyConfig;
use crate::error::ApiError;
use crate::state::AppState;

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The single place proxy access is decided, shared by HTTP and upgrades.
pub fn authorize(gate: &CredentialGate, query: Option<&str>) -> Result<Principal, AuthError> {
    gate.authenticate(query.and_then(|q| query_param(q, "token")), TokenClass::Proxy)
}

/// Connection details for the backend daemon, shared by both handlers.
pub struct ProxyBridge {
    prefix: String,
    backend: String,
    connect_timeout: Duration,
    client: Client<HttpConnector, Body>,
}

impl ProxyBridge {
    pub fn new(config: &ProxyConfig) -> Self {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        Self {
            prefix: config.prefix.trim_end_matches('/').to_string(),
            backend: config.backend.clone(),
            connect_timeout,
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Backend path-and-query for a client URI: prefix removed, `token`
    /// parameter dropped, other parameters kept verbatim.
    pub fn backend_path(&self, uri: &Uri) -> String {
        let rest = uri.path().strip_prefix(&self.prefix).unwrap_or(uri.path());
        let mut path = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        };
        if let Some(query) = uri.query() {
            let kept: Vec<&str> = query
                .split('&')
                .filter(|pair| !pair.is_empty() && pair.split('=').next() != Some("token"))
                .collect();
            if !kept.is_empty() {
                path.push('?');
                path.push_str(&kept.join("&"));
            }
        }
        path
    }

    /// Forward a plain HTTP request and stream the response back.
    pub async fn forward_http(&self, req: Request) -> Result<Response, ApiError> {
        let target = format!("http://{}{}", self.backend, self.backend_path(req.uri()));
        let uri: Uri = target
            .parse()
            .map_err(|e| ApiError::Internal(format!("Invalid proxy target {target}: {e}")))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        let host = HeaderValue::from_str(&self.backend)
            .map_err(|e| ApiError::Internal(format!("Invalid backend address: {e}")))?;
        parts.headers.insert(HOST, host);

        debug!("Proxying {} {target}", parts.method);
        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(res) => {
                let (parts, body) = res.into_parts();
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            Err(e) => {
                warn!("Proxy backend {} unreachable: {e}", self.backend);
                Err(ApiError::Upstream("Bad gateway".to_string()))
            }
        }
    }

    /// Open the backend WebSocket, offering the client's subprotocols.
    /// Returns the socket and the subprotocol the backend picked.
    async fn dial_ws(
        &self,
        path: &str,
        protocols: Option<&HeaderValue>,
    ) -> Result<(BackendSocket, Option<String>), String> {
        let mut request = format!("ws://{}{path}", self.backend)
            .into_client_request()
            .map_err(|e| e.to_string())?;
        if let Some(p) = protocols {
            request
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, p.clone());
        }
        let (socket, response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| format!("timed out after {:?}", self.connect_timeout))?
            .map_err(|e| e.to_string())?;
        let chosen = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok((socket, chosen))
    }
}

/// Handler for every method and path under the proxy prefix.
pub async fn proxy_handler(State(state): State<AppState>, req: Request) -> Response {
    let is_upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    let principal = match authorize(&state.gate, req.uri().query()) {
        Ok(p) => p,
        Err(e) if is_upgrade => {
            warn!("Proxy upgrade rejected: {e}");
            return (StatusCode::UNAUTHORIZED, [(CONNECTION, "close")]).into_response();
        }
        Err(e) => return ApiError::from(e).into_response(),
    };

    if is_upgrade {
        proxy_upgrade(state, principal, req).await
    } else {
        state
            .proxy
            .forward_http(req)
            .await
            .unwrap_or_else(IntoResponse::into_response)
    }
}

async fn proxy_upgrade(state: AppState, principal: Principal, req: Request) -> Response {
    let path = state.proxy.backend_path(req.uri());
    let (mut parts, _body) = req.into_parts();
    let requested = parts.headers.get(SEC_WEBSOCKET_PROTOCOL).cloned();

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let (backend, chosen) = match state.proxy.dial_ws(&path, requested.as_ref()).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Proxy backend WebSocket {path} failed: {e}");
            return (StatusCode::BAD_GATEWAY, [(CONNECTION, "close")]).into_response();
        }
    };

    info!(user = %principal.username, "Proxy WebSocket opened: {path}");
    let ws = match chosen {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| async move {
        relay(socket, backend, shutdown).await;
        debug!("Proxy WebSocket closed: {path}");
    })
}

/// Pump frames both ways until either side closes or shutdown begins.
async fn relay(client: WebSocket, backend: BackendSocket, shutdown: CancellationToken) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let client_to_backend = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forward = match msg {
                AxumMessage::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
                AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
                AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
                AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
                AxumMessage::Close(_) => TungsteniteMessage::Close(None),
            };
            if backend_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = backend_tx.close().await;
    };

    let backend_to_client = async {
        while let Some(Ok(msg)) = backend_rx.next().await {
            let forward = match msg {
                TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
                TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
                TungsteniteMessage::Ping(data) => AxumMessage::Ping(data),
                TungsteniteMessage::Pong(data) => AxumMessage::Pong(data),
                TungsteniteMessage::Close(_) => AxumMessage::Close(None),
                TungsteniteMessage::Frame(_) => continue,
            };
            if client_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        () = client_to_backend => {}
        () = backend_to_client => {}
        () = shutdown.cancelled() => debug!("Proxy WebSocket cancelled by shutdown"),
    }
}

/// Raw value of `key` in a query string. Tokens are URL-safe, so no
/// percent-decoding is applied.
pub fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        (k == key).then_some(v)
    })
}
