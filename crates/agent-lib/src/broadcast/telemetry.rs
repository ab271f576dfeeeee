//! Host telemetry samples
//!
//! Reads CPU, memory, temperature and uptime from procfs/sysfs. Every field
//! is optional: hosts without a thermal zone still report the rest.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// One telemetry sample, serialised as the message sent to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareStatus {
    /// Busy CPU time since the previous sample, in percent
    #[serde(rename = "cpu")]
    pub cpu_percent: Option<f64>,
    /// Memory in use, in percent
    #[serde(rename = "ram")]
    pub ram_percent: Option<f64>,
    #[serde(rename = "temperature")]
    pub temperature_celsius: Option<f64>,
    #[serde(rename = "uptime")]
    pub uptime_secs: Option<f64>,
    pub sampled_at: DateTime<Utc>,
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn sample(&self) -> Result<HardwareStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

/// Telemetry from a procfs/sysfs tree, `/` on a real host
pub struct ProcTelemetry {
    root: PathBuf,
    previous_cpu: Mutex<Option<CpuTimes>>,
}

impl Default for ProcTelemetry {
    fn default() -> Self {
        Self::with_root("/")
    }
}

impl ProcTelemetry {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            previous_cpu: Mutex::new(None),
        }
    }

    async fn read(&self, relative: &str) -> Result<String> {
        let path = self.root.join(relative);
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn cpu_percent(&self) -> Result<f64> {
        let current = parse_cpu_times(&self.read("proc/stat").await?)?;
        let mut previous = self
            .previous_cpu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // First sample: average since boot
        let base = previous.unwrap_or(CpuTimes { total: 0, idle: 0 });
        *previous = Some(current);

        let total = current.total.saturating_sub(base.total);
        let idle = current.idle.saturating_sub(base.idle);
        if total == 0 {
            return Ok(0.0);
        }
        Ok(round2(100.0 * (total - idle.min(total)) as f64 / total as f64))
    }

    async fn ram_percent(&self) -> Result<f64> {
        parse_meminfo(&self.read("proc/meminfo").await?)
    }

    async fn temperature(&self) -> Result<f64> {
        let raw = self.read("sys/class/thermal/thermal_zone0/temp").await?;
        let millidegrees: f64 = raw.trim().parse().context("Invalid thermal reading")?;
        Ok(round2(millidegrees / 1000.0))
    }

    /// Seconds since boot
    pub async fn uptime(&self) -> Result<f64> {
        let raw = self.read("proc/uptime").await?;
        raw.split_whitespace()
            .next()
            .context("Empty uptime")?
            .parse()
            .context("Invalid uptime")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn optional(field: &str, value: Result<f64>) -> Option<f64> {
    match value {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(field = field, error = %e, "Telemetry field unavailable");
            None
        }
    }
}

#[async_trait]
impl TelemetrySource for ProcTelemetry {
    async fn sample(&self) -> Result<HardwareStatus> {
        Ok(HardwareStatus {
            cpu_percent: optional("cpu", self.cpu_percent().await),
            ram_percent: optional("ram", self.ram_percent().await),
            temperature_celsius: optional("temperature", self.temperature().await),
            uptime_secs: optional("uptime", self.uptime().await),
            sampled_at: Utc::now(),
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Aggregate `cpu` line: user nice system idle iowait irq softirq steal
fn parse_cpu_times(stat: &str) -> Result<CpuTimes> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .context("No aggregate cpu line")?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .context("Invalid cpu counters")?;
    if values.len() < 4 {
        anyhow::bail!("Too few cpu counters");
    }
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Ok(CpuTimes {
        total: values.iter().sum(),
        idle,
    })
}

fn parse_meminfo(meminfo: &str) -> Result<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };
    let total = field("MemTotal:").context("MemTotal missing")?;
    let available = field("MemAvailable:").context("MemAvailable missing")?;
    if total == 0 {
        anyhow::bail!("MemTotal is zero");
    }
    Ok(round2(
        100.0 * total.saturating_sub(available) as f64 / total as f64,
    ))
}
