//! `ServiceSpec` to engine create parameters

use super::ServiceSpec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::warn;

pub const DEFAULT_CPU_PERIOD: i64 = 100_000;
pub const DEFAULT_DEVICE_PERMISSIONS: &str = "rwm";
const DEFAULT_LOG_DRIVER: &str = "json-file";
const DEFAULT_STOP_SIGNAL: &str = "SIGTERM";

/// Everything the runtime needs to create one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDirective {
    pub process: ProcessConfig,
    pub host: HostConfig,
    pub network: NetworkConfig,
}

impl CreateDirective {
    /// Hex SHA-256 over the canonical JSON form
    pub fn fingerprint(&self) -> String {
        // Struct fields serialise in declaration order and every map is a
        // BTreeMap, so the encoding is stable. Only string-keyed maps and
        // derived impls are involved, which serde_json cannot reject.
        let bytes = serde_json::to_vec(self).expect("CreateDirective serialises to JSON");
        hex::encode(Sha256::digest(&bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub image: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub stop_signal: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub binds: Vec<String>,
    pub volumes_from: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub network_mode: Option<String>,
    pub restart_policy: super::RestartPolicy,
    pub ipc_mode: Option<String>,
    /// Keyed by `target/protocol`
    pub port_bindings: BTreeMap<String, Vec<HostPortBinding>>,
    pub resources: Resources,
    pub sysctls: BTreeMap<String, String>,
    pub privileged: bool,
    pub log_driver: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPortBinding {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub memory: Option<i64>,
    pub oom_kill_disable: bool,
    pub devices: Vec<DeviceMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    pub cgroup_permissions: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub endpoints: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub ipv4_address: Option<String>,
    pub aliases: Vec<String>,
}

/// Compile a service description into create parameters.
///
/// Total and pure: the same spec always yields an identical directive.
pub fn compile(spec: &ServiceSpec) -> CreateDirective {
    CreateDirective {
        process: process_config(spec),
        host: host_config(spec),
        network: network_config(spec),
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

fn process_config(spec: &ServiceSpec) -> ProcessConfig {
    ProcessConfig {
        image: spec.image.clone(),
        hostname: spec.hostname.clone(),
        user: spec.user.clone(),
        tty: spec.tty,
        cmd: non_empty(&spec.command),
        entrypoint: non_empty(&spec.entrypoint),
        env: spec.environment.clone(),
        working_dir: spec.working_dir.clone(),
        stop_signal: DEFAULT_STOP_SIGNAL.to_string(),
        labels: spec.labels.clone(),
    }
}

fn host_config(spec: &ServiceSpec) -> HostConfig {
    let binds = spec
        .volumes
        .iter()
        .filter(|v| !v.source.is_empty() && !v.destination.is_empty())
        .map(|v| {
            if v.option.is_empty() {
                format!("{}:{}", v.source, v.destination)
            } else {
                format!("{}:{}:{}", v.source, v.destination, v.option)
            }
        })
        .collect();

    let mut port_bindings: BTreeMap<String, Vec<HostPortBinding>> = BTreeMap::new();
    for port in &spec.ports {
        let protocol = if port.protocol.is_empty() {
            "tcp"
        } else {
            port.protocol.as_str()
        };
        let host_ip = if port.host_ip.is_empty() {
            "0.0.0.0"
        } else {
            port.host_ip.as_str()
        };
        port_bindings
            .entry(format!("{}/{}", port.target, protocol))
            .or_default()
            .push(HostPortBinding {
                host_ip: host_ip.to_string(),
                host_port: port.host_port.clone(),
            });
    }

    let limits = &spec.resources;
    let cpu_period = match (limits.cpu_period, limits.cpu_quota) {
        (Some(period), _) => Some(period),
        (None, Some(_)) => Some(DEFAULT_CPU_PERIOD),
        (None, None) => None,
    };

    let network_mode = spec
        .network_mode
        .clone()
        .or_else(|| spec.networks.first().map(|n| n.name.clone()));

    HostConfig {
        binds,
        volumes_from: spec.volumes_from.clone(),
        extra_hosts: spec.extra_hosts.clone(),
        cap_add: spec.cap_add.clone(),
        cap_drop: spec.cap_drop.clone(),
        network_mode,
        restart_policy: spec.restart.clone(),
        ipc_mode: spec.ipc_mode.clone(),
        port_bindings,
        resources: Resources {
            cpu_period,
            cpu_quota: limits.cpu_quota,
            cpuset_cpus: limits.cpuset_cpus.clone(),
            memory: limits.memory,
            oom_kill_disable: limits.oom_kill_disable,
            devices: spec.devices.iter().map(|d| device_mapping(d)).collect(),
        },
        sysctls: spec.sysctls.clone(),
        privileged: spec.privileged,
        log_driver: DEFAULT_LOG_DRIVER.to_string(),
    }
}

/// Fill `host:container:permissions` from the right
fn device_mapping(device: &str) -> DeviceMapping {
    let parts: Vec<&str> = device.split(':').collect();
    let (host, container, permissions) = match parts.as_slice() {
        [container] => ("", *container, DEFAULT_DEVICE_PERMISSIONS),
        [host, container] => (*host, *container, DEFAULT_DEVICE_PERMISSIONS),
        [host, container, permissions] => (*host, *container, *permissions),
        [host, container, permissions, rest @ ..] => {
            warn!(device = %device, ignored = %rest.join(":"), "Device mapping has extra fields, ignoring them");
            (*host, *container, *permissions)
        }
        [] => ("", "", DEFAULT_DEVICE_PERMISSIONS),
    };

    DeviceMapping {
        path_on_host: host.to_string(),
        path_in_container: container.to_string(),
        cgroup_permissions: if permissions.is_empty() {
            DEFAULT_DEVICE_PERMISSIONS
        } else {
            permissions
        }
        .to_string(),
    }
}

fn network_config(spec: &ServiceSpec) -> NetworkConfig {
    NetworkConfig {
        endpoints: spec
            .networks
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    EndpointSettings {
                        ipv4_address: n.ipv4_address.clone(),
                        aliases: n.aliases.clone(),
                    },
                )
            })
            .collect(),
    }
}
