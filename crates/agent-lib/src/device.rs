//! Device identity and connectivity report
//!
//! Everything is read from the same procfs/sysfs tree as telemetry, so a
//! containerised agent pointed at the host's `/` reports on the host.

use crate::broadcast::{HardwareStatus, ProcTelemetry, TelemetrySource};
use crate::models::ContainerFilter;
use crate::runtime::RuntimeGateway;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

const UNKNOWN_DEVICE: &str = "Unknown";
const MODEL_PATHS: &[&str] = &[
    "proc/device-tree/model",
    "sys/firmware/devicetree/base/model",
    "sys/class/dmi/id/product_name",
];

/// How far the device can reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    NoConnection,
    DnsOnly,
    FullConnection,
}

impl ConnectionStatus {
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionStatus::NoConnection => {
                "No internet connection: name resolution and outbound connections failed"
            }
            ConnectionStatus::DnsOnly => {
                "Limited internet connection: names resolve but outbound connections fail"
            }
            ConnectionStatus::FullConnection => "Internet connection is fully available",
        }
    }
}

#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn check(&self) -> ConnectionStatus;
}

/// Connects to well-known hosts on port 80, then falls back to plain name
/// resolution
#[derive(Debug, Clone)]
pub struct NetworkCheck {
    hosts: Vec<String>,
    timeout: Duration,
}

impl Default for NetworkCheck {
    fn default() -> Self {
        Self {
            hosts: vec![
                "google.com".to_string(),
                "example.com".to_string(),
                "cloudflare.com".to_string(),
            ],
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ConnectivityCheck for NetworkCheck {
    async fn check(&self) -> ConnectionStatus {
        for host in &self.hosts {
            match timeout(self.timeout, TcpStream::connect((host.as_str(), 80))).await {
                Ok(Ok(_)) => return ConnectionStatus::FullConnection,
                Ok(Err(e)) => debug!(host = %host, error = %e, "Connectivity check failed"),
                Err(_) => debug!(host = %host, "Connectivity check timed out"),
            }
        }
        for host in &self.hosts {
            let resolved = timeout(self.timeout, lookup_host((host.as_str(), 80))).await;
            if let Ok(Ok(mut addrs)) = resolved {
                if addrs.next().is_some() {
                    return ConnectionStatus::DnsOnly;
                }
            }
        }
        ConnectionStatus::NoConnection
    }
}

/// Always reports the same status
#[derive(Debug, Clone, Copy)]
pub struct FixedConnectivity(pub ConnectionStatus);

#[async_trait]
impl ConnectivityCheck for FixedConnectivity {
    async fn check(&self) -> ConnectionStatus {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac_address: Option<String>,
    /// `up`, `down` or `unknown` as reported by the kernel
    pub state: String,
}

/// Snapshot of the device the agent runs on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub node_name: String,
    pub device_type: String,
    pub uptime_secs: Option<u64>,
    /// Local IPv4 addresses, loopback excluded
    pub ip_addresses: Vec<String>,
    pub interfaces: Vec<NetworkInterface>,
    /// `ttyUSB*` and `ttyACM*` entries under `/dev`
    pub serial_devices: Vec<String>,
    pub internet_status: ConnectionStatus,
    pub internet_status_detail: String,
    /// Image id of the agent's own container
    pub software_version: Option<String>,
    pub agent_version: String,
    pub reported_at: DateTime<Utc>,
}

/// Builds [`DeviceInfo`] reports
pub struct DeviceInspector {
    node_name: String,
    telemetry: ProcTelemetry,
    runtime: Arc<dyn RuntimeGateway>,
    connectivity: Arc<dyn ConnectivityCheck>,
}

impl DeviceInspector {
    pub fn new(
        node_name: impl Into<String>,
        root: impl Into<PathBuf>,
        runtime: Arc<dyn RuntimeGateway>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            telemetry: ProcTelemetry::with_root(root),
            runtime,
            connectivity: Arc::new(NetworkCheck::default()),
        }
    }

    pub fn connectivity(mut self, check: Arc<dyn ConnectivityCheck>) -> Self {
        self.connectivity = check;
        self
    }

    fn root(&self) -> &Path {
        self.telemetry.root()
    }

    pub async fn info(&self) -> DeviceInfo {
        let uptime_secs = match self.telemetry.uptime().await {
            Ok(uptime) => Some(uptime as u64),
            Err(e) => {
                debug!(error = %e, "Uptime unavailable");
                None
            }
        };
        let ip_addresses = match read(self.root(), "proc/net/fib_trie").await {
            Ok(trie) => local_addresses(&trie),
            Err(e) => {
                debug!(error = %e, "Local addresses unavailable");
                Vec::new()
            }
        };
        let internet_status = self.connectivity.check().await;

        DeviceInfo {
            node_name: self.node_name.clone(),
            device_type: self.device_type().await,
            uptime_secs,
            ip_addresses,
            interfaces: self.interfaces().await,
            serial_devices: self.serial_devices().await,
            internet_status,
            internet_status_detail: internet_status.description().to_string(),
            software_version: self.software_version().await,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            reported_at: Utc::now(),
        }
    }

    /// One telemetry sample. CPU load covers the time since the previous
    /// call on this inspector.
    pub async fn hardware_status(&self) -> Result<HardwareStatus> {
        self.telemetry.sample().await
    }

    async fn device_type(&self) -> String {
        for relative in MODEL_PATHS {
            if let Ok(model) = read(self.root(), relative).await {
                let model = model.trim_matches(|c: char| c == '\0' || c.is_whitespace());
                if !model.is_empty() {
                    return model.to_string();
                }
            }
        }
        UNKNOWN_DEVICE.to_string()
    }

    async fn serial_devices(&self) -> Vec<String> {
        let mut devices = match list_dir(&self.root().join("dev")).await {
            Ok(names) => names
                .into_iter()
                .filter(|name| is_serial_device(name))
                .collect::<Vec<_>>(),
            Err(e) => {
                debug!(error = %e, "Serial devices unavailable");
                Vec::new()
            }
        };
        devices.sort();
        devices
    }

    async fn interfaces(&self) -> Vec<NetworkInterface> {
        let base = self.root().join("sys/class/net");
        let mut names = match list_dir(&base).await {
            Ok(names) => names,
            Err(e) => {
                debug!(error = %e, "Network interfaces unavailable");
                return Vec::new();
            }
        };
        names.sort();

        let mut interfaces = Vec::new();
        for name in names.into_iter().filter(|n| n != "lo") {
            let dir = base.join(&name);
            let mac_address = tokio::fs::read_to_string(dir.join("address"))
                .await
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let state = tokio::fs::read_to_string(dir.join("operstate"))
                .await
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            interfaces.push(NetworkInterface {
                name,
                mac_address,
                state,
            });
        }
        interfaces
    }

    async fn software_version(&self) -> Option<String> {
        match self.runtime.list_containers(&ContainerFilter::default()).await {
            Ok(records) => records
                .into_iter()
                .find(|r| r.is_self)
                .map(|r| r.image_id)
                .filter(|id| !id.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to look up the agent's own container");
                None
            }
        }
    }
}

async fn read(root: &Path, relative: &str) -> Result<String> {
    let path = root.join(relative);
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

async fn list_dir(path: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("Failed to list {}", path.display()))?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// `ttyUSB<n>` or `ttyACM<n>`
fn is_serial_device(name: &str) -> bool {
    let number = name
        .strip_prefix("ttyUSB")
        .or_else(|| name.strip_prefix("ttyACM"));
    matches!(number, Some(n) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Host addresses from `/proc/net/fib_trie`: each `|-- <ip>` leaf followed
/// by a `/32 host LOCAL` entry
fn local_addresses(trie: &str) -> Vec<String> {
    let mut addresses: Vec<String> = Vec::new();
    let mut leaf: Option<&str> = None;
    for line in trie.lines() {
        let line = line.trim();
        if let Some(ip) = line.strip_prefix("|-- ") {
            leaf = Some(ip.trim());
        } else if line.starts_with("/32 host LOCAL") {
            if let Some(ip) = leaf.take() {
                if !ip.starts_with("127.") && !addresses.iter().any(|a| a == ip) {
                    addresses.push(ip.to_string());
                }
            }
        }
    }
    addresses
}
