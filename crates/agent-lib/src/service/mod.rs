//! Declarative service descriptions and their compilation
//!
//! A `ServiceSpec` is the engine-agnostic description of a container's
//! desired state. It is produced either by parsing a compose-style
//! `RawServiceSpec` (fallible, see [`parse`]) or by recovering it from a
//! running container, and it is turned into engine-facing parameters by
//! the total [`compile`] function.

mod compiler;
mod image;
mod parse;

pub use compiler::{
    compile, CreateDirective, DeviceMapping, EndpointSettings, HostConfig, HostPortBinding,
    NetworkConfig, ProcessConfig, Resources, DEFAULT_CPU_PERIOD, DEFAULT_DEVICE_PERMISSIONS,
};
pub use image::ImageRef;
pub use parse::{
    parse_cpus, parse_device, parse_extra_host, parse_memory_limit, parse_port,
    parse_restart_policy, parse_volume, RawDependsOn, RawDeploy, RawEnvironment, RawExtraHosts,
    RawLimits, RawNetwork, RawResources, RawServiceSpec, StringOrList,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Restart policy names accepted by the container engine
pub mod restart {
    pub const NO: &str = "no";
    pub const ALWAYS: &str = "always";
    pub const ON_FAILURE: &str = "on-failure";
    pub const UNLESS_STOPPED: &str = "unless-stopped";

    pub const ALL: &[&str] = &[NO, ALWAYS, ON_FAILURE, UNLESS_STOPPED];
}

/// Desired state of one container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    /// Ordered `KEY=VALUE` entries
    pub environment: Vec<String>,
    pub working_dir: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    /// Declarative `host:container:permissions` strings
    pub devices: Vec<String>,
    pub volumes: Vec<VolumeBinding>,
    /// Containers whose volumes are mounted as well
    pub volumes_from: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub resources: ResourceLimits,
    pub sysctls: BTreeMap<String, String>,
    pub restart: RestartPolicy,
    pub network_mode: Option<String>,
    pub networks: Vec<NetworkAttachment>,
    pub ipc_mode: Option<String>,
    /// `/etc/hosts` entries as `host:ip`
    pub extra_hosts: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Names of services that must be running before this one
    pub depends_on: Vec<String>,
}

impl ServiceSpec {
    /// Copy of this spec pointing at a different image
    pub fn with_image(&self, image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..self.clone()
        }
    }

    /// Resolve `hostname` to the loopback address inside the container,
    /// unless an entry for it already exists
    pub fn with_host_entry(mut self, hostname: &str) -> Self {
        let hostname = hostname.trim();
        let present = self
            .extra_hosts
            .iter()
            .any(|entry| entry.split(':').next() == Some(hostname));
        if !hostname.is_empty() && !present {
            self.extra_hosts.push(format!("{hostname}:{LOOPBACK}"));
        }
        self
    }
}

const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub source: String,
    pub destination: String,
    pub option: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub target: String,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_period: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpuset_cpus: Option<String>,
    /// Memory limit in bytes
    pub memory: Option<i64>,
    pub oom_kill_disable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub name: String,
    pub max_retries: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            name: restart::NO.to_string(),
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub name: String,
    pub ipv4_address: Option<String>,
    pub aliases: Vec<String>,
}
