//! Login and logout.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::bearer_token;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// `POST /api/auth/login`: `{username, password}` → `{token, username, message}`.
///
/// Missing fields are a `400` and never reach the credential oracle; any
/// oracle failure is a `401`.
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let required = || ApiError::Validation("Username and password required".to_string());
    let Json(req) = payload.map_err(|_| required())?;
    let username = req.username.filter(|u| !u.is_empty()).ok_or_else(required)?;
    let password = req.password.filter(|p| !p.is_empty()).ok_or_else(required)?;

    let issued = state.gate.login(&username, &password).await?;
    Ok(Json(json!({
        "token": issued.token,
        "username": issued.username,
        "message": "Login successful",
    })))
}

/// `POST /api/auth/logout`: revoke the presented token.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    if let Some(token) = bearer_token(&headers) {
        state.gate.logout(token);
    }
    Json(json!({ "message": "Logout successful" }))
}
