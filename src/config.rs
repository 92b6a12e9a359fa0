//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `PORT`, `GATEWAY_LISTEN`, `GATEWAY_SSH_PORT`,
//!    `GATEWAY_PROXY_BACKEND`, `GATEWAY_DISTRO_TOOL`
//! 2. **Config file**: path via `--config <path>`, or `gateway.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:3001"
//! shutdown_grace_secs = 5
//! # public_base_url = "https://phone.example.net"
//!
//! [auth]
//! ssh_host = "127.0.0.1"
//! ssh_port = 8022
//! handshake_timeout_ms = 5000
//! session_ttl_secs = 86400
//! proxy_ttl_secs = 300
//! sweep_interval_secs = 30
//!
//! [shell]
//! program = "bash"
//! working_dir = "~"
//! output_buffer = 256
//!
//! [metrics]
//! interval_ms = 2000
//!
//! [proxy]
//! prefix = "/ttyd"
//! backend = "127.0.0.1:7681"
//! connect_timeout_ms = 5000
//!
//! [distro]
//! tool = "proot-gateway-distro"
//! timeout_ms = 600000
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "gateway.toml";

/// Errors raised while resolving configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
    #[error("invalid proxy prefix {0:?}: must start with '/' and not end with '/'")]
    ProxyPrefix(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub distro: DistroConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:3001`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds to wait for open connections to drain after a shutdown signal.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Externally visible base URL. When unset, `/api/terminal/url` derives
    /// it from the request's `Host` header.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

/// Credential gate settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Host of the local SSH daemon used as the credential oracle.
    #[serde(default = "default_ssh_host")]
    pub ssh_host: String,
    /// Port of the local SSH daemon (Termux sshd listens on 8022).
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Upper bound on the whole SSH handshake + password attempt.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Lifetime of `session`-class tokens (default 24 h).
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Lifetime of `proxy`-class tokens (default 5 min).
    #[serde(default = "default_proxy_ttl_secs")]
    pub proxy_ttl_secs: u64,
    /// Period of the expiry sweep over the token store.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Interactive shell settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary. `bash` is started with `-i`.
    #[serde(default = "default_shell")]
    pub program: String,
    /// Working directory for new sessions; `~` expands to `$HOME`.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Capacity (in chunks) of each session's outbound queue.
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
}

/// Metrics publisher settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Push period for `system:subscribe` (default 2000 ms).
    #[serde(default = "default_metrics_interval_ms")]
    pub interval_ms: u64,
}

/// Reverse proxy to the terminal daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Reserved path prefix, stripped before forwarding.
    #[serde(default = "default_proxy_prefix")]
    pub prefix: String,
    /// Loopback `host:port` of the backend daemon.
    #[serde(default = "default_proxy_backend")]
    pub backend: String,
    /// Connect timeout towards the backend.
    #[serde(default = "default_proxy_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// External distro lifecycle tool.
#[derive(Debug, Clone, Deserialize)]
pub struct DistroConfig {
    /// Command line of the tool implementing `create <name> <port>`, `list`
    /// and `delete <name>`. Split on whitespace; leading arguments are kept.
    #[serde(default = "default_distro_tool")]
    pub tool: String,
    /// Upper bound for one tool invocation (provisioning is slow).
    #[serde(default = "default_distro_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_min_port")]
    pub min_port: u16,
    #[serde(default = "default_max_port")]
    pub max_port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}
fn default_shutdown_grace_secs() -> u64 {
    5
}
fn default_ssh_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ssh_port() -> u16 {
    8022
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_proxy_ttl_secs() -> u64 {
    5 * 60
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_shell() -> String {
    "bash".to_string()
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_output_buffer() -> usize {
    256
}
fn default_metrics_interval_ms() -> u64 {
    2000
}
fn default_proxy_prefix() -> String {
    "/ttyd".to_string()
}
fn default_proxy_backend() -> String {
    "127.0.0.1:7681".to_string()
}
fn default_proxy_connect_timeout_ms() -> u64 {
    5000
}
fn default_distro_tool() -> String {
    "proot-gateway-distro".to_string()
}
fn default_distro_timeout_ms() -> u64 {
    10 * 60 * 1000
}
fn default_min_port() -> u16 {
    1024
}
fn default_max_port() -> u16 {
    65535
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            public_base_url: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            ssh_host: default_ssh_host(),
            ssh_port: default_ssh_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            session_ttl_secs: default_session_ttl_secs(),
            proxy_ttl_secs: default_proxy_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
            working_dir: default_working_dir(),
            output_buffer: default_output_buffer(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_metrics_interval_ms(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: default_proxy_prefix(),
            backend: default_proxy_backend(),
            connect_timeout_ms: default_proxy_connect_timeout_ms(),
        }
    }
}

impl Default for DistroConfig {
    fn default() -> Self {
        Self {
            tool: default_distro_tool(),
            timeout_ms: default_distro_timeout_ms(),
            min_port: default_min_port(),
            max_port: default_max_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AuthConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn proxy_ttl(&self) -> Duration {
        Duration::from_secs(self.proxy_ttl_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `gateway.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };

        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Apply environment overrides. `lookup` is injectable for tests.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(listen) = lookup("GATEWAY_LISTEN") {
            self.server.listen = listen;
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = port.parse().map_err(|_| ConfigError::Env {
                var: "PORT",
                value: port.clone(),
            })?;
            let host = self
                .server
                .listen
                .rsplit_once(':')
                .map_or("0.0.0.0", |(host, _)| host);
            self.server.listen = format!("{host}:{port}");
        }
        if let Some(port) = lookup("GATEWAY_SSH_PORT") {
            self.auth.ssh_port = port.parse().map_err(|_| ConfigError::Env {
                var: "GATEWAY_SSH_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(backend) = lookup("GATEWAY_PROXY_BACKEND") {
            self.proxy.backend = backend;
        }
        if let Some(tool) = lookup("GATEWAY_DISTRO_TOOL") {
            self.distro.tool = tool;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.proxy.prefix;
        if !prefix.starts_with('/') || prefix.len() < 2 || prefix.ends_with('/') {
            return Err(ConfigError::ProxyPrefix(prefix.clone()));
        }
        if self.metrics.interval_ms == 0 {
            return Err(ConfigError::Zero("metrics.interval_ms"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:3001");
        assert_eq!(config.auth.ssh_port, 8022);
        assert_eq!(config.auth.session_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.auth.proxy_ttl(), Duration::from_secs(300));
        assert_eq!(config.metrics.interval_ms, 2000);
        assert_eq!(config.proxy.prefix, "/ttyd");
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = Config::from_toml("[auth]\nssh_port = 22\n", "inline").unwrap();
        assert_eq!(config.auth.ssh_port, 22);
        assert_eq!(config.auth.ssh_host, "127.0.0.1");
        assert_eq!(config.shell.program, "bash");
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let err = Config::from_toml("[auth\nssh_port = 22", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_port_env_rewrites_listen_port() {
        let mut config = Config::default();
        config
            .apply_env(|var| (var == "PORT").then(|| "4000".to_string()))
            .unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:4000");
    }

    #[test]
    fn test_gateway_listen_wins_over_port() {
        let mut config = Config::default();
        config
            .apply_env(|var| match var {
                "PORT" => Some("4000".to_string()),
                "GATEWAY_LISTEN" => Some("127.0.0.1:9000".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
    }

    #[test]
    fn test_bad_port_env_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_env(|var| (var == "GATEWAY_SSH_PORT").then(|| "ssh".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "GATEWAY_SSH_PORT", .. }));
    }

    #[test]
    fn test_proxy_prefix_validation() {
        let mut config = Config::default();
        config.proxy.prefix = "ttyd/".to_string();
        assert!(config.validate().is_err());
        config.proxy.prefix = "/term".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_metrics_interval_is_rejected() {
        let config = Config::from_toml("[metrics]\ninterval_ms = 0\n", "inline").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Zero("metrics.interval_ms")));
    }
}
