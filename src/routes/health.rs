//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, epoch-ms timestamp, uptime, version and the number of
/// live terminal sessions. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.sessions.count().await;

    Json(json!({
        "status": "ok",
        "timestamp": crate::auth::store::now_ms(),
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
    }))
}
