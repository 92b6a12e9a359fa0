//! `GET /api/terminal/url`: hand out a proxy-scoped link to the terminal daemon.

use axum::{
    extract::State,
    http::{header::HOST, HeaderMap},
    Extension, Json,
};
use serde_json::{json, Value};

use crate::auth::Principal;
use crate::state::AppState;

/// Mint a short-lived proxy token and return `{url}` pointing at the proxy
/// mount with the token embedded.
pub async fn terminal_url(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
) -> Json<Value> {
    let issued = state.gate.issue_proxy_token(&principal);
    let base = base_url(
        state.config.server.public_base_url.as_deref(),
        &headers,
        &state.config.server.listen,
    );
    Json(json!({
        "url": format!("{base}{}/?token={}", state.proxy.prefix(), issued.token),
    }))
}

/// Configured public URL, else scheme and host as the client addressed us.
fn base_url(configured: Option<&str>, headers: &HeaderMap, listen: &str) -> String {
    if let Some(url) = configured {
        return url.trim_end_matches('/').to_string();
    }
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map_or("http", str::trim);
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(listen);
    format!("{scheme}://{host}")
}
