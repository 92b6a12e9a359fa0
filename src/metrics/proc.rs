//! Built-in collector reading `/proc`, `/sys` and a couple of host tools.
//!
//! ## Data sources
//!
//! | Field          | Source                                               |
//! |----------------|------------------------------------------------------|
//! | `cpu`          | `/proc/stat` (delta between two samples)             |
//! | `memory/swap`  | `/proc/meminfo`                                      |
//! | `load`         | `/proc/loadavg`                                      |
//! | `disk`         | `statvfs(<disk path>)` syscall                       |
//! | `info`         | `/proc/sys/kernel/{hostname,osrelease}`, `/proc/uptime` |
//! | `distro`       | `/etc/os-release` (`PRETTY_NAME`)                    |
//! | processes      | `/proc/<pid>/stat`                                   |
//! | temperatures   | `/sys/class/thermal/thermal_zone*`                   |
//! | battery        | `termux-battery-status`, else `/sys/class/power_supply` |
//! | device         | `getprop ro.*` when present, else kernel/arch        |
//!
//! Inside the sandbox several of these are restricted. Missing optional
//! sources degrade to empty values; only `/proc/stat` and `/proc/meminfo`
//! are required for a snapshot.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    percent, BatteryInfo, CollectorError, DeviceInfo, DiskUsage, DistroInfo, HostInfo,
    LoadAverage, MemoryUsage, ProcessInfo, SwapUsage, SystemCollector, SystemSnapshot,
    Temperature,
};
use crate::shell::process::exec_command;

/// Gap between the two `/proc/stat` samples when there is no earlier one.
const CPU_SAMPLE_GAP: Duration = Duration::from_millis(200);

const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Processes reported by [`ProcCollector::processes`], largest RSS first.
const MAX_PROCESSES: usize = 100;

/// Aggregate jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

pub struct ProcCollector {
    disk_path: String,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcCollector {
    /// `disk_path` selects the filesystem reported under `disk`.
    pub fn new(disk_path: impl Into<String>) -> Self {
        Self {
            disk_path: disk_path.into(),
            last_cpu: Mutex::new(None),
        }
    }

    async fn cpu_usage(&self) -> Result<f64, CollectorError> {
        let previous = *self
            .last_cpu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = match previous {
            Some(p) => p,
            None => {
                let first = read_cpu_times()?;
                tokio::time::sleep(CPU_SAMPLE_GAP).await;
                first
            }
        };
        let current = read_cpu_times()?;
        *self
            .last_cpu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(current);
        Ok(cpu_percent(previous, current))
    }
}

#[async_trait]
impl SystemCollector for ProcCollector {
    async fn snapshot(&self) -> Result<SystemSnapshot, CollectorError> {
        let cpu = self.cpu_usage().await?;
        let meminfo = read_required("/proc/meminfo")?;
        let (memory, swap) = parse_meminfo(&meminfo);

        Ok(SystemSnapshot {
            cpu,
            memory,
            swap,
            disk: disk_usage(&self.disk_path).unwrap_or_default(),
            load: parse_loadavg(&read_proc_file("/proc/loadavg")),
            info: host_info(),
            distro: DistroInfo {
                description: parse_os_release(&read_proc_file("/etc/os-release")),
            },
            timestamp: crate::auth::store::now_ms(),
        })
    }

    async fn cpu(&self) -> Result<f64, CollectorError> {
        self.cpu_usage().await
    }

    async fn memory(&self) -> Result<MemoryUsage, CollectorError> {
        let meminfo = read_required("/proc/meminfo")?;
        Ok(parse_meminfo(&meminfo).0)
    }

    async fn processes(&self) -> Result<Vec<ProcessInfo>, CollectorError> {
        tokio::task::spawn_blocking(list_processes)
            .await
            .map_err(|e| CollectorError::Unavailable(format!("process scan failed: {e}")))?
    }

    async fn device(&self) -> Result<DeviceInfo, CollectorError> {
        let host = host_info();
        let cpuinfo = read_proc_file("/proc/cpuinfo");
        let arch = match getprop("ro.product.cpu.abi").await {
            Some(abi) => abi,
            None => std::env::consts::ARCH.to_string(),
        };
        Ok(DeviceInfo {
            manufacturer: getprop("ro.product.manufacturer").await.unwrap_or_default(),
            model: getprop("ro.product.model").await.unwrap_or_default(),
            android_version: getprop("ro.build.version.release")
                .await
                .unwrap_or_default(),
            cpu_architecture: arch,
            cpu_model: parse_cpu_model(&cpuinfo),
            cpus: host.cpus,
            kernel: host.kernel,
            hostname: host.hostname,
        })
    }

    async fn battery(&self) -> Result<BatteryInfo, CollectorError> {
        if let Ok(result) = exec_command("termux-battery-status", &[], TOOL_TIMEOUT).await {
            if result.success() {
                if let Ok(v) = serde_json::from_str::<Value>(&result.stdout) {
                    return Ok(parse_termux_battery(&v));
                }
            }
        }
        Ok(sysfs_battery(Path::new("/sys/class/power_supply/battery")))
    }

    async fn temperatures(&self) -> Result<Vec<Temperature>, CollectorError> {
        Ok(read_thermal_zones(Path::new("/sys/class/thermal")))
    }
}

fn read_proc_file(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

fn read_required(path: &str) -> Result<String, CollectorError> {
    std::fs::read_to_string(path).map_err(|e| CollectorError::Unavailable(format!("{path}: {e}")))
}

fn read_cpu_times() -> Result<CpuTimes, CollectorError> {
    let stat = read_required("/proc/stat")?;
    parse_cpu_times(&stat)
        .ok_or_else(|| CollectorError::Unavailable("/proc/stat: no cpu line".to_string()))
}

/// Parse the aggregate `cpu` line: user nice system idle iowait irq softirq steal.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        total: values.iter().sum(),
        idle,
    })
}

fn cpu_percent(prev: CpuTimes, cur: CpuTimes) -> f64 {
    let total = cur.total.saturating_sub(prev.total);
    let idle = cur.idle.saturating_sub(prev.idle);
    percent(total.saturating_sub(idle), total)
}

/// Memory and swap from `/proc/meminfo`, converted to bytes.
fn parse_meminfo(meminfo: &str) -> (MemoryUsage, SwapUsage) {
    let mut total = 0u64;
    let mut free = 0u64;
    let mut available = None;
    let mut buffers = 0u64;
    let mut cached = 0u64;
    let mut swap_total = 0u64;
    let mut swap_free = 0u64;
    for line in meminfo.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kb = parse_kb_value(rest);
        match key {
            "MemTotal" => total = kb,
            "MemFree" => free = kb,
            "MemAvailable" => available = Some(kb),
            "Buffers" => buffers = kb,
            "Cached" => cached = kb,
            "SwapTotal" => swap_total = kb,
            "SwapFree" => swap_free = kb,
            _ => {}
        }
    }
    // Old kernels have no MemAvailable.
    let available = available.unwrap_or(free + buffers + cached).min(total);
    let used = total - available;
    let swap_used = swap_total.saturating_sub(swap_free);
    (
        MemoryUsage {
            total: total * 1024,
            used: used * 1024,
            free: available * 1024,
            usage_percent: percent(used, total),
        },
        SwapUsage {
            total: swap_total * 1024,
            used: swap_used * 1024,
            usage_percent: percent(swap_used, swap_total),
        },
    )
}

fn parse_kb_value(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn parse_loadavg(loadavg: &str) -> LoadAverage {
    let mut it = loadavg
        .split_whitespace()
        .take(3)
        .map(|s| s.parse::<f64>().unwrap_or(0.0));
    LoadAverage {
        load1: it.next().unwrap_or(0.0),
        load5: it.next().unwrap_or(0.0),
        load15: it.next().unwrap_or(0.0),
    }
}

/// Extract the CPU model string from `/proc/cpuinfo`.
///
/// Handles both x86 (`model name`) and ARM (`Hardware`) formats.
fn parse_cpu_model(cpuinfo: &str) -> String {
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key == "model name" || key == "Hardware" {
            return value.trim().to_string();
        }
    }
    "unknown".to_string()
}

fn parse_os_release(content: &str) -> String {
    content
        .lines()
        .find_map(|l| l.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim_matches('"').to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn host_info() -> HostInfo {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let uptime = read_proc_file("/proc/uptime")
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0) as u64;
    HostInfo {
        hostname: read_proc_file("/proc/sys/kernel/hostname").trim().to_string(),
        kernel: read_proc_file("/proc/sys/kernel/osrelease").trim().to_string(),
        cpus: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        uptime,
    }
}

/// Disk usage for a filesystem via the POSIX `statvfs` syscall.
fn disk_usage(path: &str) -> Option<DiskUsage> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: valid C string and a properly aligned out-pointer.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    // SAFETY: statvfs returned 0, so stat is fully initialized.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    let block_size = stat.f_frsize as u64;
    #[allow(clippy::unnecessary_cast)]
    let total = stat.f_blocks as u64 * block_size;
    #[allow(clippy::unnecessary_cast)]
    let available = stat.f_bavail as u64 * block_size;
    #[allow(clippy::unnecessary_cast)]
    let used = total.saturating_sub(stat.f_bfree as u64 * block_size);

    Some(DiskUsage {
        total,
        used,
        available,
        usage_percent: percent(used, used + available),
    })
}

fn list_processes() -> Result<Vec<ProcessInfo>, CollectorError> {
    let entries = std::fs::read_dir("/proc")
        .map_err(|e| CollectorError::Unavailable(format!("/proc: {e}")))?;

    // SAFETY: sysconf has no preconditions.
    let (page_size, clk_tck) = unsafe {
        (
            libc::sysconf(libc::_SC_PAGESIZE),
            libc::sysconf(libc::_SC_CLK_TCK),
        )
    };
    #[allow(clippy::cast_sign_loss)]
    let page_size = page_size.max(1) as u64;
    #[allow(clippy::cast_precision_loss)]
    let clk_tck = clk_tck.max(1) as f64;

    let mut processes: Vec<ProcessInfo> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
            // The process may be gone by now.
            let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            parse_pid_stat(pid, &stat, page_size, clk_tck)
        })
        .collect();
    processes.sort_by(|a, b| b.memory.cmp(&a.memory));
    processes.truncate(MAX_PROCESSES);
    Ok(processes)
}

/// Parse `/proc/<pid>/stat`. The command name is parenthesised and may
/// itself contain spaces or parentheses, so fields are counted from the
/// last `)`.
fn parse_pid_stat(pid: u32, stat: &str, page_size: u64, clk_tck: f64) -> Option<ProcessInfo> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = stat.get(close + 1..)?.split_whitespace().collect();
    let state = (*fields.first()?).to_string();
    let ppid = fields.get(1)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss: i64 = fields.get(21)?.parse().ok()?;
    #[allow(clippy::cast_precision_loss)]
    let cpu_time = (utime + stime) as f64 / clk_tck;
    Some(ProcessInfo {
        pid,
        ppid,
        name,
        state,
        memory: rss.max(0).unsigned_abs() * page_size,
        cpu_time,
    })
}

fn read_thermal_zones(root: &Path) -> Vec<Temperature> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut zones: Vec<Temperature> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("thermal_zone"))
        .filter_map(|e| {
            let dir = e.path();
            let raw = std::fs::read_to_string(dir.join("temp")).ok()?;
            let milli: i64 = raw.trim().parse().ok()?;
            let kind = std::fs::read_to_string(dir.join("type")).unwrap_or_default();
            #[allow(clippy::cast_precision_loss)]
            let celsius = milli as f64 / 1000.0;
            Some(Temperature {
                zone: e.file_name().to_string_lossy().into_owned(),
                kind: kind.trim().to_string(),
                celsius,
            })
        })
        .collect();
    zones.sort_by(|a, b| a.zone.cmp(&b.zone));
    zones
}

fn parse_termux_battery(v: &Value) -> BatteryInfo {
    BatteryInfo {
        is_available: true,
        percentage: v["percentage"].as_f64(),
        status: v["status"].as_str().map(str::to_string),
        plugged: v["plugged"].as_str().map(str::to_string),
        health: v["health"].as_str().map(str::to_string),
        temperature: v["temperature"].as_f64(),
        current: v["current"].as_i64(),
    }
}

fn sysfs_battery(dir: &Path) -> BatteryInfo {
    let read = |name: &str| {
        std::fs::read_to_string(dir.join(name))
            .ok()
            .map(|s| s.trim().to_string())
    };
    let Some(capacity) = read("capacity").and_then(|c| c.parse::<f64>().ok()) else {
        return BatteryInfo::default();
    };
    BatteryInfo {
        is_available: true,
        percentage: Some(capacity),
        status: read("status").map(|s| s.to_uppercase()),
        plugged: None,
        health: read("health").map(|s| s.to_uppercase()),
        // sysfs reports tenths of a degree
        temperature: read("temp")
            .and_then(|t| t.parse::<f64>().ok())
            .map(|t| t / 10.0),
        current: read("current_now").and_then(|c| c.parse().ok()),
    }
}

/// Read an Android system property. `None` off-device or when empty.
async fn getprop(key: &str) -> Option<String> {
    let result = exec_command("getprop", &[key], TOOL_TIMEOUT).await.ok()?;
    let value = result.stdout.trim();
    if !result.success() || value.is_empty() {
        debug!("getprop {key} unavailable");
        return None;
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:        8000000 kB\n\
                           MemFree:          500000 kB\n\
                           MemAvailable:    2000000 kB\n\
                           Buffers:          100000 kB\n\
                           Cached:          1000000 kB\n\
                           SwapTotal:       1000000 kB\n\
                           SwapFree:         750000 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let (mem, swap) = parse_meminfo(MEMINFO);
        assert_eq!(mem.total, 8_000_000 * 1024);
        assert_eq!(mem.used, 6_000_000 * 1024);
        assert_eq!(mem.free, 2_000_000 * 1024);
        assert!((mem.usage_percent - 75.0).abs() < f64::EPSILON);
        assert_eq!(swap.used, 250_000 * 1024);
        assert!((swap.usage_percent - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_meminfo_without_available() {
        let (mem, _) = parse_meminfo("MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 50 kB\n");
        assert_eq!(mem.free, 200 * 1024);
        assert_eq!(mem.used, 800 * 1024);
    }

    #[test]
    fn test_cpu_percent_from_deltas() {
        let a = parse_cpu_times("cpu  100 0 100 800 0 0 0 0\ncpu0 1 2 3 4\n").unwrap();
        let b = parse_cpu_times("cpu  150 0 150 900 0 0 0 0\n").unwrap();
        assert_eq!(a, CpuTimes { total: 1000, idle: 800 });
        assert!((cpu_percent(a, b) - 50.0).abs() < f64::EPSILON);
        assert!(cpu_percent(b, b).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_cpu_times_rejects_garbage() {
        assert_eq!(parse_cpu_times("intr 1 2 3\n"), None);
    }

    #[test]
    fn test_parse_loadavg() {
        let load = parse_loadavg("0.52 0.48 0.41 1/234 5678\n");
        assert!((load.load1 - 0.52).abs() < f64::EPSILON);
        assert!((load.load15 - 0.41).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_cpu_model_variants() {
        assert_eq!(
            parse_cpu_model("processor\t: 0\nmodel name\t: Intel(R) Core(TM) i7\n"),
            "Intel(R) Core(TM) i7"
        );
        assert_eq!(parse_cpu_model("Hardware\t: Qualcomm SM8250\n"), "Qualcomm SM8250");
        assert_eq!(parse_cpu_model(""), "unknown");
    }

    #[test]
    fn test_parse_pid_stat_with_spaces_in_name() {
        let stat = "1234 (tmux: server) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 50 0 0 20 0 1 0 500 10000000 300 18446744073709551615";
        let p = parse_pid_stat(1234, stat, 4096, 100.0).unwrap();
        assert_eq!(p.name, "tmux: server");
        assert_eq!(p.state, "S");
        assert_eq!(p.ppid, 1);
        assert_eq!(p.memory, 300 * 4096);
        assert!((p.cpu_time - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_os_release() {
        assert_eq!(
            parse_os_release("NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 22.04.3 LTS\"\n"),
            "Ubuntu 22.04.3 LTS"
        );
        assert_eq!(parse_os_release(""), "Unknown");
    }

    #[test]
    fn test_parse_termux_battery() {
        let v: Value = serde_json::from_str(
            r#"{"health":"GOOD","percentage":87,"plugged":"UNPLUGGED","status":"DISCHARGING","temperature":31.2,"current":-350000}"#,
        )
        .unwrap();
        let b = parse_termux_battery(&v);
        assert!(b.is_available);
        assert_eq!(b.percentage, Some(87.0));
        assert_eq!(b.status.as_deref(), Some("DISCHARGING"));
        assert_eq!(b.current, Some(-350_000));
    }

    #[test]
    fn test_missing_battery_is_unavailable() {
        let b = sysfs_battery(Path::new("/nonexistent/battery"));
        assert!(!b.is_available);
        assert!(b.percentage.is_none());
    }

    #[test]
    fn test_missing_thermal_root_is_empty() {
        assert!(read_thermal_zones(Path::new("/nonexistent/thermal")).is_empty());
    }
}
