//! `/api/system/*`: thin wrappers over the metrics collector.
//!
//! Collector failures surface as `500 {"error": ...}`.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::metrics::{
    BatteryInfo, DeviceInfo, MemoryUsage, ProcessInfo, SystemSnapshot, Temperature,
};
use crate::state::AppState;

/// `GET /api/system/all`: full snapshot.
pub async fn all(State(state): State<AppState>) -> Result<Json<SystemSnapshot>, ApiError> {
    Ok(Json(state.collector.snapshot().await?))
}

/// `GET /api/system/cpu`: `{"cpu": <percent>}`.
pub async fn cpu(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let cpu = state.collector.cpu().await?;
    Ok(Json(json!({ "cpu": cpu })))
}

pub async fn memory(State(state): State<AppState>) -> Result<Json<MemoryUsage>, ApiError> {
    Ok(Json(state.collector.memory().await?))
}

pub async fn processes(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProcessInfo>>, ApiError> {
    Ok(Json(state.collector.processes().await?))
}

/// `GET /api/system/ports`: always empty; there is no netlink in the sandbox.
pub async fn ports() -> Json<Value> {
    Json(json!([]))
}

pub async fn device(State(state): State<AppState>) -> Result<Json<DeviceInfo>, ApiError> {
    Ok(Json(state.collector.device().await?))
}

pub async fn battery(State(state): State<AppState>) -> Result<Json<BatteryInfo>, ApiError> {
    Ok(Json(state.collector.battery().await?))
}

pub async fn temperatures(
    State(state): State<AppState>,
) -> Result<Json<Vec<Temperature>>, ApiError> {
    Ok(Json(state.collector.temperatures().await?))
}
