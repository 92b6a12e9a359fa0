#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! userland-gateway library: the building blocks of the `ulgw` server.
//!
//! - `auth`: SSH-backed login, session and proxy tokens, route guard
//! - `config`: configuration loading
//! - `sessions`: terminal shell registry
//! - `shell`: process spawning
//! - `metrics`: system snapshots and the per-connection publisher
//! - `proxy`: gated reverse proxy to the terminal daemon
//! - `distro`: distro lifecycle controller interface
//! - `routes`: REST handlers and router assembly
//! - `ws`: WebSocket protocol handling

pub mod auth;
pub mod config;
pub mod distro;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod routes;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod ws;

pub use config::Config;
pub use error::ApiError;
pub use sessions::SessionRegistry;
pub use state::AppState;
