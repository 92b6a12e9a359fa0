//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::auth::{CredentialGate, CredentialVerifier};
use crate::config::Config;
use crate::distro::DistroController;
use crate::metrics::SystemCollector;
use crate::proxy::ProxyBridge;
use crate::sessions::SessionRegistry;
use crate::shell::ShellSpec;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Login, tokens and route guards.
    pub gate: CredentialGate,
    /// Every terminal shell, across all connections.
    pub sessions: SessionRegistry,
    /// The shell `terminal:create` launches.
    pub shell: Arc<ShellSpec>,
    pub collector: Arc<dyn SystemCollector>,
    pub distro: Arc<dyn DistroController>,
    /// Backend connection for the terminal daemon mount.
    pub proxy: Arc<ProxyBridge>,
    /// Cancelled once on shutdown; long-lived socket tasks watch it.
    pub shutdown: CancellationToken,
    /// Source of WebSocket connection ids.
    pub next_conn_id: Arc<AtomicU64>,
}

impl AppState {
    /// Wire the state from config plus the three external collaborators.
    pub fn new(
        config: Config,
        verifier: Arc<dyn CredentialVerifier>,
        collector: Arc<dyn SystemCollector>,
        distro: Arc<dyn DistroController>,
    ) -> Self {
        let gate = CredentialGate::new(
            verifier,
            config.auth.session_ttl(),
            config.auth.proxy_ttl(),
        );
        Self {
            start_time: Instant::now(),
            gate,
            sessions: SessionRegistry::new(config.shell.output_buffer),
            shell: Arc::new(ShellSpec::from_config(&config.shell)),
            collector,
            distro,
            proxy: Arc::new(ProxyBridge::new(&config.proxy)),
            shutdown: CancellationToken::new(),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            config: Arc::new(config),
        }
    }
}
