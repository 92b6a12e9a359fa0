//! `/api/proot/*`: authenticated pass-through to the distro controller.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::distro::DistroRecord;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateRequest {
    pub name: Option<String>,
    /// Number or numeric string; HTML forms send the latter.
    pub port: Option<Value>,
}

/// `POST /api/proot/create`: `{name, port}` → the new record.
pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<Json<DistroRecord>, ApiError> {
    let required = || ApiError::Validation("Name and port required".to_string());
    let Json(req) = payload.map_err(|_| required())?;
    let name = req.name.filter(|n| !n.is_empty()).ok_or_else(required)?;
    let port = match req.port {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| ApiError::Validation("Port must be a positive integer".to_string()))?;

    Ok(Json(state.distro.create(&name, port).await?))
}

/// `GET /api/proot/list`: all distros, oldest first.
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<DistroRecord>>, ApiError> {
    Ok(Json(state.distro.list().await?))
}

/// `DELETE /api/proot/delete/{name}`.
pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.distro.delete(&name).await?;
    Ok(Json(json!({
        "message": format!("Distro {name} deleted"),
        "name": name,
    })))
}
