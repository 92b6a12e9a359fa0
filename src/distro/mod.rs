//! Distro lifecycle: create, list and delete sandboxed environments.
//!
//! The gateway does not provision anything itself. [`DistroController`] is
//! the narrow interface the HTTP layer talks to; [`CommandDistroController`]
//! implements it by running an external management tool:
//!
//! ```text
//! <tool> list                 -> JSON array of {name, port, status, created_at}
//! <tool> create <name> <port> -> JSON record (optional), exit 0 on success
//! <tool> delete <name>        -> exit 0 on success
//! ```
//!
//! Names and ports are validated here before the tool ever runs.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DistroConfig;
use crate::shell::process::{exec_command, ExecError};

const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum DistroError {
    #[error("Invalid distro name '{0}': use 1-32 letters, digits, '-' or '_'")]
    InvalidName(String),
    #[error("Invalid port {port}: must be between {min} and {max}")]
    InvalidPort { port: u64, min: u16, max: u16 },
    #[error("A distro named '{0}' already exists")]
    NameTaken(String),
    #[error("Port {0} is already used by another distro")]
    PortTaken(u16),
    #[error("Distro '{0}' not found")]
    NotFound(String),
    #[error("Distro tool failed: {0}")]
    Tool(String),
    #[error("Distro tool timed out")]
    Timeout,
    #[error("Distro tool returned unexpected output: {0}")]
    BadOutput(String),
}

/// One sandboxed environment as reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroRecord {
    pub name: String,
    pub port: u16,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

fn default_status() -> String {
    "unknown".to_string()
}

#[async_trait]
pub trait DistroController: Send + Sync {
    async fn create(&self, name: &str, port: u64) -> Result<DistroRecord, DistroError>;
    /// All distros, oldest first.
    async fn list(&self) -> Result<Vec<DistroRecord>, DistroError>;
    async fn delete(&self, name: &str) -> Result<(), DistroError>;
}

/// Drives an external management tool.
pub struct CommandDistroController {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
    min_port: u16,
    max_port: u16,
}

impl CommandDistroController {
    /// `config.tool` may carry leading arguments, e.g. `"bash /opt/distro.sh"`.
    pub fn from_config(config: &DistroConfig) -> Self {
        let mut parts = config.tool.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            base_args: parts.collect(),
            timeout: Duration::from_millis(config.timeout_ms),
            min_port: config.min_port,
            max_port: config.max_port,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, DistroError> {
        let mut full: Vec<&str> = self.base_args.iter().map(String::as_str).collect();
        full.extend_from_slice(args);

        let result = exec_command(&self.program, &full, self.timeout)
            .await
            .map_err(|e| match e {
                ExecError::Timeout => DistroError::Timeout,
                other => DistroError::Tool(other.to_string()),
            })?;
        debug!(
            "Distro tool '{} {}' finished in {}ms",
            self.program,
            args.join(" "),
            result.duration_ms
        );

        if !result.success() {
            let detail = if result.stderr.trim().is_empty() {
                result.stdout.trim()
            } else {
                result.stderr.trim()
            };
            warn!(
                "Distro tool '{} {}' exited {}: {detail}",
                self.program,
                args.join(" "),
                result.exit_code
            );
            return Err(DistroError::Tool(if detail.is_empty() {
                format!("exit code {}", result.exit_code)
            } else {
                detail.to_string()
            }));
        }
        Ok(result.stdout)
    }

    fn check_port(&self, port: u64) -> Result<u16, DistroError> {
        u16::try_from(port)
            .ok()
            .filter(|p| (self.min_port..=self.max_port).contains(p))
            .ok_or(DistroError::InvalidPort {
                port,
                min: self.min_port,
                max: self.max_port,
            })
    }
}

#[async_trait]
impl DistroController for CommandDistroController {
    async fn create(&self, name: &str, port: u64) -> Result<DistroRecord, DistroError> {
        validate_name(name)?;
        let port = self.check_port(port)?;

        let existing = self.list().await?;
        if existing.iter().any(|d| d.name == name) {
            return Err(DistroError::NameTaken(name.to_string()));
        }
        if existing.iter().any(|d| d.port == port) {
            return Err(DistroError::PortTaken(port));
        }

        let port_arg = port.to_string();
        let stdout = self.run(&["create", name, &port_arg]).await?;
        info!("Distro {name} created on port {port}");

        // The tool may describe the new distro; otherwise report what was asked.
        Ok(serde_json::from_str::<DistroRecord>(stdout.trim()).unwrap_or(DistroRecord {
            name: name.to_string(),
            port,
            status: "running".to_string(),
            created_at: None,
        }))
    }

    async fn list(&self) -> Result<Vec<DistroRecord>, DistroError> {
        let stdout = self.run(&["list"]).await?;
        parse_list(&stdout)
    }

    async fn delete(&self, name: &str) -> Result<(), DistroError> {
        validate_name(name)?;
        if !self.list().await?.iter().any(|d| d.name == name) {
            return Err(DistroError::NotFound(name.to_string()));
        }
        self.run(&["delete", name]).await?;
        info!("Distro {name} deleted");
        Ok(())
    }
}

pub fn validate_name(name: &str) -> Result<(), DistroError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DistroError::InvalidName(name.to_string()))
    }
}

/// Parse the tool's `list` output and order it by creation time.
fn parse_list(stdout: &str) -> Result<Vec<DistroRecord>, DistroError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut records: Vec<DistroRecord> =
        serde_json::from_str(trimmed).map_err(|e| DistroError::BadOutput(e.to_string()))?;
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(records)
}
