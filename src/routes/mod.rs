//! HTTP route handlers and router assembly.
//!
//! Each sub-module corresponds to an API endpoint group. Everything except
//! [`health`], login, `/ws` and the proxy mount sits behind
//! [`crate::auth::require_session`]. `/ws` and the proxy mount check their own
//! `?token=` query parameter.

pub mod auth;
pub mod distro;
pub mod headers;
pub mod health;
pub mod system;
pub mod terminal;

use axum::{
    extract::{Request, State},
    http::{header, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/auth/login", post(auth::login));

    let authed_routes = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/system/all", get(system::all))
        .route("/api/system/cpu", get(system::cpu))
        .route("/api/system/memory", get(system::memory))
        .route("/api/system/processes", get(system::processes))
        .route("/api/system/ports", get(system::ports))
        .route("/api/system/device", get(system::device))
        .route("/api/system/battery", get(system::battery))
        .route("/api/system/temperatures", get(system::temperatures))
        .route("/api/terminal/url", get(terminal::terminal_url))
        .route("/api/proot/create", post(distro::create))
        .route("/api/proot/delete/{name}", delete(distro::remove))
        .route("/api/proot/list", get(distro::list))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_session,
        ));

    let ws_route = Router::new().route("/ws", get(crate::ws::ws_upgrade));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        // The proxy mount catches every method and sub-path under its prefix.
        .fallback(proxy_or_not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            headers::security_headers,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn proxy_or_not_found(State(state): State<AppState>, req: Request) -> Response {
    if is_proxy_path(state.proxy.prefix(), req.uri().path()) {
        crate::proxy::proxy_handler(State(state), req).await
    } else {
        ApiError::NotFound("Not found".to_string()).into_response()
    }
}

/// `prefix` itself or anything below it, but not `/ttydfoo`.
pub fn is_proxy_path(prefix: &str, path: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
