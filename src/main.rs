#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ulgw
//!
//! Remote-access gateway for a sandboxed Linux userland.
//!
//! A browser logs in with the same credentials it would use over SSH, then
//! opens terminals and live metrics over one WebSocket, and reaches the
//! full terminal daemon through a token-gated reverse proxy.
//!
//! ## API surface
//!
//! | Method | Path                       | Auth    | Description                      |
//! |--------|----------------------------|---------|----------------------------------|
//! | GET    | `/api/health`              | No      | Liveness probe                   |
//! | POST   | `/api/auth/login`          | No      | SSH-checked login, session token |
//! | POST   | `/api/auth/logout`         | Session | Revoke token                     |
//! | GET    | `/api/system/*`            | Session | Metrics collector queries        |
//! | GET    | `/api/terminal/url`        | Session | Proxy URL with a proxy token     |
//! | POST   | `/api/proot/create`        | Session | Create distro                    |
//! | GET    | `/api/proot/list`          | Session | List distros                     |
//! | DELETE | `/api/proot/delete/{name}` | Session | Delete distro                    |
//! | GET    | `/ws`                      | Session*| Terminals + metrics              |
//! | ANY    | `/ttyd/...`                | Proxy*  | Reverse proxy to terminal daemon |
//!
//! *Token via `?token=` query parameter.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use userland_gateway::auth::SshVerifier;
use userland_gateway::distro::CommandDistroController;
use userland_gateway::metrics::ProcCollector;
use userland_gateway::{routes, AppState, Config};

/// Remote-access gateway for sandboxed Linux userlands.
#[derive(Parser)]
#[command(name = "ulgw", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to TOML config file (when no subcommand is given).
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => {}
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ulgw: {e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if let Err(e) = run_server(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(config: Config) -> std::io::Result<()> {
    info!("ulgw v{} starting", env!("CARGO_PKG_VERSION"));

    let verifier = Arc::new(SshVerifier::new(
        config.auth.ssh_host.clone(),
        config.auth.ssh_port,
        config.auth.handshake_timeout(),
    ));
    let disk_path = userland_gateway::shell::ShellSpec::from_config(&config.shell).working_dir;
    let collector = Arc::new(ProcCollector::new(disk_path));
    let distro = Arc::new(CommandDistroController::from_config(&config.distro));
    let state = AppState::new(config, verifier, collector, distro);

    info!(
        "SSH oracle at {}:{}, proxy {} -> {}",
        state.config.auth.ssh_host,
        state.config.auth.ssh_port,
        state.config.proxy.prefix,
        state.config.proxy.backend
    );

    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Listening on {}", state.config.server.listen);

    // Periodic sweep: drop tokens past their TTL
    let gate = state.gate.clone();
    let sweep_every = Duration::from_secs(state.config.auth.sweep_interval_secs.max(1));
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let removed = gate.sweep_expired();
            if removed > 0 {
                info!("Expired {removed} token(s)");
            }
        }
    });

    // Graceful shutdown: kill terminals, cancel socket tasks, then stop accepting
    let sessions = state.sessions.clone();
    let cancel = state.shutdown.clone();
    let shutdown = async move {
        wait_for_signal().await;
        let killed = sessions.kill_all().await;
        info!("Killed {killed} terminal session(s)");
        cancel.cancel();
    };

    let grace = Duration::from_secs(state.config.server.shutdown_grace_secs);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .into_future();
    let drained = async {
        state.shutdown.cancelled().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result?,
        () = drained => warn!("Connections still open after {grace:?}, exiting"),
    }

    info!("Shutting down...");
    sweep_task.abort();
    state.sessions.kill_all().await;
    info!("Goodbye");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}
