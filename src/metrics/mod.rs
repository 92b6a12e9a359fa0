//! System metrics: what a snapshot looks like, where it comes from, and the
//! per-connection publisher that pushes it over the WebSocket.
//!
//! The collector is a trait so the HTTP and WebSocket layers never touch
//! `/proc` directly. [`proc::ProcCollector`] is the built-in implementation.
//! Field names are camelCase on the wire because the dashboard reads them
//! that way.

pub mod proc;
pub mod publisher;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use proc::ProcCollector;
pub use publisher::MetricsSubscription;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("System data unavailable: {0}")]
    Unavailable(String),
}

/// One point-in-time bundle of resource metrics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    /// Aggregate CPU usage in percent.
    pub cpu: f64,
    pub memory: MemoryUsage,
    pub swap: SwapUsage,
    pub disk: DiskUsage,
    pub load: LoadAverage,
    pub info: HostInfo,
    pub distro: DistroInfo,
    /// Epoch milliseconds when the snapshot was taken.
    pub timestamp: u64,
}

/// Memory figures in bytes.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapUsage {
    pub total: u64,
    pub used: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub available: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadAverage {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub hostname: String,
    pub kernel: String,
    pub cpus: usize,
    /// Seconds since boot.
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistroInfo {
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub state: String,
    /// Resident set size in bytes.
    pub memory: u64,
    /// User + system CPU time in seconds.
    pub cpu_time: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub android_version: String,
    pub cpu_architecture: String,
    pub cpu_model: String,
    pub cpus: usize,
    pub kernel: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryInfo {
    pub is_available: bool,
    pub percentage: Option<f64>,
    pub status: Option<String>,
    pub plugged: Option<String>,
    pub health: Option<String>,
    /// Degrees Celsius.
    pub temperature: Option<f64>,
    /// Microamperes, negative while discharging.
    pub current: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Temperature {
    pub zone: String,
    pub kind: String,
    pub celsius: f64,
}

/// Produces system snapshots. Implementations must be cheap to share.
///
/// Only [`snapshot`](Self::snapshot) is required; the narrower queries
/// default to slices of it or to "nothing known".
#[async_trait]
pub trait SystemCollector: Send + Sync {
    async fn snapshot(&self) -> Result<SystemSnapshot, CollectorError>;

    async fn cpu(&self) -> Result<f64, CollectorError> {
        Ok(self.snapshot().await?.cpu)
    }

    async fn memory(&self) -> Result<MemoryUsage, CollectorError> {
        Ok(self.snapshot().await?.memory)
    }

    async fn processes(&self) -> Result<Vec<ProcessInfo>, CollectorError> {
        Ok(Vec::new())
    }

    async fn device(&self) -> Result<DeviceInfo, CollectorError> {
        Ok(DeviceInfo::default())
    }

    async fn battery(&self) -> Result<BatteryInfo, CollectorError> {
        Ok(BatteryInfo::default())
    }

    async fn temperatures(&self) -> Result<Vec<Temperature>, CollectorError> {
        Ok(Vec::new())
    }
}

/// `part / whole` in percent, rounded to one decimal. Zero when `whole` is.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 1000.0).round() / 10.0
}
