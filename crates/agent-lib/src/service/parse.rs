//! Compose-style input and the fallible conversion into `ServiceSpec`

use super::{
    restart, NetworkAttachment, PortBinding, ResourceLimits, RestartPolicy, ServiceSpec,
    VolumeBinding,
};
use crate::error::CompileError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CFS period used when converting fractional CPU counts
const CPU_PERIOD: i64 = 100_000;

/// A field that compose accepts either as a single string or a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    String(String),
    List(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::String(s) => s.split_whitespace().map(str::to_string).collect(),
            StringOrList::List(list) => list,
        }
    }
}

/// `environment` as either `["K=V"]` or `{K: V}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawEnvironment {
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl RawEnvironment {
    fn into_vec(self) -> Vec<String> {
        match self {
            RawEnvironment::List(list) => list,
            RawEnvironment::Map(map) => map.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
        }
    }
}

/// `depends_on` as either a list or the long map form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDependsOn {
    List(Vec<String>),
    Map(BTreeMap<String, serde_json::Value>),
}

impl RawDependsOn {
    fn into_vec(self) -> Vec<String> {
        match self {
            RawDependsOn::List(list) => list,
            RawDependsOn::Map(map) => map.into_keys().collect(),
        }
    }
}

/// `extra_hosts` as either `["host:ip"]` or `{host: ip}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawExtraHosts {
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl RawExtraHosts {
    fn into_vec(self) -> Vec<String> {
        match self {
            RawExtraHosts::List(list) => list,
            RawExtraHosts::Map(map) => map.into_iter().map(|(h, ip)| format!("{h}:{ip}")).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawNetwork {
    pub ipv4_address: Option<String>,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLimits {
    pub cpus: Option<String>,
    pub memory: Option<String>,
    pub cpuset: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawResources {
    pub limits: RawLimits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawDeploy {
    pub resources: RawResources,
}

/// One service entry as written in a compose-style document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawServiceSpec {
    pub image: String,
    pub container_name: Option<String>,
    pub command: Option<StringOrList>,
    pub entrypoint: Option<StringOrList>,
    pub environment: Option<RawEnvironment>,
    pub working_dir: Option<String>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub devices: Vec<String>,
    pub volumes: Vec<String>,
    pub volumes_from: Vec<String>,
    pub ports: Vec<String>,
    pub sysctls: BTreeMap<String, String>,
    pub restart: Option<String>,
    pub network_mode: Option<String>,
    pub networks: BTreeMap<String, Option<RawNetwork>>,
    pub ipc: Option<String>,
    pub extra_hosts: Option<RawExtraHosts>,
    pub labels: BTreeMap<String, String>,
    pub depends_on: Option<RawDependsOn>,
    pub oom_kill_disable: bool,
    pub deploy: RawDeploy,
}

impl ServiceSpec {
    /// Validate and normalise a compose-style entry.
    ///
    /// `name` is the service key; `container_name` overrides it when set.
    pub fn from_raw(name: &str, raw: RawServiceSpec) -> Result<Self, CompileError> {
        let name = raw.container_name.clone().unwrap_or_else(|| name.to_string());

        if raw.image.trim().is_empty() {
            return Err(CompileError::MissingImage { service: name });
        }

        let limits = &raw.deploy.resources.limits;
        let memory = limits
            .memory
            .as_deref()
            .map(|value| parse_memory_limit(value).ok_or_else(|| invalid_memory(&name, value)))
            .transpose()?;
        let (cpu_quota, cpu_period) = match limits.cpus.as_deref() {
            Some(value) => {
                let quota = parse_cpus(value).ok_or_else(|| CompileError::InvalidCpus {
                    service: name.clone(),
                    value: value.to_string(),
                })?;
                (Some(quota), Some(CPU_PERIOD))
            }
            None => (None, None),
        };

        let restart = parse_restart_policy(raw.restart.as_deref().unwrap_or_default()).ok_or_else(
            || CompileError::InvalidRestartPolicy {
                service: name.clone(),
                value: raw.restart.clone().unwrap_or_default(),
            },
        )?;

        let ports = raw
            .ports
            .iter()
            .map(|value| {
                parse_port(value).ok_or_else(|| CompileError::InvalidPort {
                    service: name.clone(),
                    value: value.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let volumes = raw
            .volumes
            .iter()
            .map(|value| {
                parse_volume(value).ok_or_else(|| CompileError::InvalidVolume {
                    service: name.clone(),
                    value: value.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for value in &raw.devices {
            if parse_device(value).is_none() {
                return Err(CompileError::InvalidDevice {
                    service: name.clone(),
                    value: value.clone(),
                });
            }
        }

        let extra_hosts = raw
            .extra_hosts
            .map(RawExtraHosts::into_vec)
            .unwrap_or_default()
            .iter()
            .map(|value| {
                parse_extra_host(value).ok_or_else(|| CompileError::InvalidExtraHost {
                    service: name.clone(),
                    value: value.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let networks = raw
            .networks
            .into_iter()
            .map(|(network, settings)| {
                let settings = settings.unwrap_or_default();
                NetworkAttachment {
                    name: network,
                    ipv4_address: settings.ipv4_address,
                    aliases: settings.aliases,
                }
            })
            .collect();

        Ok(ServiceSpec {
            image: raw.image.trim().to_string(),
            command: raw.command.map(StringOrList::into_vec).unwrap_or_default(),
            entrypoint: raw.entrypoint.map(StringOrList::into_vec).unwrap_or_default(),
            environment: raw.environment.map(RawEnvironment::into_vec).unwrap_or_default(),
            working_dir: raw.working_dir,
            hostname: raw.hostname,
            user: raw.user,
            tty: raw.tty,
            privileged: raw.privileged,
            cap_add: raw.cap_add,
            cap_drop: raw.cap_drop,
            devices: raw.devices,
            volumes,
            volumes_from: raw.volumes_from,
            ports,
            resources: ResourceLimits {
                cpu_period,
                cpu_quota,
                cpuset_cpus: raw.deploy.resources.limits.cpuset,
                memory,
                oom_kill_disable: raw.oom_kill_disable,
            },
            sysctls: raw.sysctls,
            restart,
            network_mode: raw.network_mode,
            networks,
            ipc_mode: raw.ipc,
            extra_hosts,
            labels: raw.labels,
            depends_on: raw.depends_on.map(RawDependsOn::into_vec).unwrap_or_default(),
            name,
        })
    }
}

fn invalid_memory(service: &str, value: &str) -> CompileError {
    CompileError::InvalidMemory {
        service: service.to_string(),
        value: value.to_string(),
    }
}

/// Parse a memory limit such as `512m`, `1g`, `2048k` or `1024` (bytes).
///
/// Suffixes are case-insensitive and may carry a trailing `b`.
pub fn parse_memory_limit(value: &str) -> Option<i64> {
    let lower = value.trim().to_ascii_lowercase();
    let lower = lower.strip_suffix('b').unwrap_or(&lower);
    if lower.is_empty() {
        return None;
    }

    let (digits, multiplier): (&str, i64) = match lower.as_bytes()[lower.len() - 1] {
        b'k' => (&lower[..lower.len() - 1], 1024),
        b'm' => (&lower[..lower.len() - 1], 1024 * 1024),
        b'g' => (&lower[..lower.len() - 1], 1024 * 1024 * 1024),
        b'0'..=b'9' => (lower, 1),
        _ => return None,
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok()?.checked_mul(multiplier)
}

/// Convert a fractional CPU count into a CFS quota over a 100000us period
pub fn parse_cpus(value: &str) -> Option<i64> {
    let cpus: f64 = value.trim().parse().ok()?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return None;
    }
    Some((cpus * CPU_PERIOD as f64).round() as i64)
}

/// Split `name[:maxRetries]`. An empty string yields the default policy.
pub fn parse_restart_policy(value: &str) -> Option<RestartPolicy> {
    let value = value.trim();
    if value.is_empty() {
        return Some(RestartPolicy::default());
    }

    let (name, retries) = match value.split_once(':') {
        Some((name, retries)) => (name, Some(retries)),
        None => (value, None),
    };
    if !restart::ALL.contains(&name) {
        return None;
    }
    let max_retries = match retries {
        Some(retries) => retries.trim().parse::<u32>().ok()?,
        None => 0,
    };

    Some(RestartPolicy {
        name: name.to_string(),
        max_retries,
    })
}

/// Parse `[ip:]host:target[/proto]` or a bare `target[/proto]`
pub fn parse_port(value: &str) -> Option<PortBinding> {
    let value = value.trim();
    let (addr, protocol) = match value.rsplit_once('/') {
        Some((addr, proto)) if !proto.is_empty() => (addr, proto.to_ascii_lowercase()),
        Some(_) => return None,
        None => (value, "tcp".to_string()),
    };

    let parts: Vec<&str> = addr.split(':').collect();
    let (host_ip, host_port, target) = match parts.as_slice() {
        [target] => ("0.0.0.0", "", *target),
        [host, target] => ("0.0.0.0", *host, *target),
        [ip, host, target] => (*ip, *host, *target),
        _ => return None,
    };

    target.parse::<u16>().ok()?;
    if !host_port.is_empty() {
        host_port.parse::<u16>().ok()?;
    }

    Some(PortBinding {
        target: target.to_string(),
        protocol,
        host_ip: if host_ip.is_empty() { "0.0.0.0" } else { host_ip }.to_string(),
        host_port: host_port.to_string(),
    })
}

/// Validate `[host:]container[:permissions]` and split it into its fields
pub fn parse_device(value: &str) -> Option<Vec<&str>> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    let container = match parts.as_slice() {
        [container] | [_, container] | [_, container, _] => *container,
        _ => return None,
    };
    if container.is_empty() {
        return None;
    }
    Some(parts)
}

/// Normalise `host:ip` or `host=ip` into `host:ip`. The address may be
/// IPv6 and so contain colons itself.
pub fn parse_extra_host(value: &str) -> Option<String> {
    let value = value.trim();
    let (host, ip) = value
        .split_once('=')
        .or_else(|| value.split_once(':'))?;
    let (host, ip) = (host.trim(), ip.trim());
    if host.is_empty() || ip.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }
    Some(format!("{host}:{ip}"))
}

/// Parse `source:destination[:option]`
pub fn parse_volume(value: &str) -> Option<VolumeBinding> {
    let parts: Vec<&str> = value.split(':').collect();
    match parts.as_slice() {
        [destination] => Some(VolumeBinding {
            source: String::new(),
            destination: destination.to_string(),
            option: String::new(),
        }),
        [source, destination] => Some(VolumeBinding {
            source: source.to_string(),
            destination: destination.to_string(),
            option: String::new(),
        }),
        [source, destination, option] => Some(VolumeBinding {
            source: source.to_string(),
            destination: destination.to_string(),
            option: option.to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_suffix_scaling() {
        assert_eq!(parse_memory_limit("512m"), Some(536_870_912));
        assert_eq!(parse_memory_limit("1g"), Some(1_073_741_824));
        assert_eq!(parse_memory_limit("2048k"), Some(2_097_152));
        assert_eq!(parse_memory_limit("1G"), Some(1_073_741_824));
        assert_eq!(parse_memory_limit("256mb"), Some(268_435_456));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
    }

    #[test]
    fn test_memory_rejects_garbage() {
        assert_eq!(parse_memory_limit(""), None);
        assert_eq!(parse_memory_limit("m"), None);
        assert_eq!(parse_memory_limit("1.5g"), None);
        assert_eq!(parse_memory_limit("12x"), None);
        assert_eq!(parse_memory_limit("99999999999999g"), None);
    }

    #[test]
    fn test_cpus_quota() {
        assert_eq!(parse_cpus("0.5"), Some(50_000));
        assert_eq!(parse_cpus("2"), Some(200_000));
        assert_eq!(parse_cpus("0"), None);
        assert_eq!(parse_cpus("lots"), None);
    }

    #[test]
    fn test_restart_split() {
        let policy = parse_restart_policy("on-failure:5").unwrap();
        assert_eq!(policy.name, "on-failure");
        assert_eq!(policy.max_retries, 5);

        let policy = parse_restart_policy("").unwrap();
        assert_eq!(policy.name, "no");
        assert_eq!(policy.max_retries, 0);

        assert_eq!(parse_restart_policy("always").unwrap().name, "always");
        assert!(parse_restart_policy("on-failure:many").is_none());
        assert!(parse_restart_policy("sometimes").is_none());
    }

    #[test]
    fn test_port_forms() {
        let port = parse_port("8080:80").unwrap();
        assert_eq!(port.target, "80");
        assert_eq!(port.host_port, "8080");
        assert_eq!(port.protocol, "tcp");
        assert_eq!(port.host_ip, "0.0.0.0");

        let port = parse_port("127.0.0.1:5353:53/udp").unwrap();
        assert_eq!(port.host_ip, "127.0.0.1");
        assert_eq!(port.target, "53");
        assert_eq!(port.protocol, "udp");

        let port = parse_port("9000").unwrap();
        assert_eq!(port.target, "9000");
        assert_eq!(port.host_port, "");

        assert!(parse_port("http:80").is_none());
        assert!(parse_port("1:2:3:4").is_none());
    }

    #[test]
    fn test_volume_forms() {
        let volume = parse_volume("/data:/var/lib/data:ro").unwrap();
        assert_eq!(volume.source, "/data");
        assert_eq!(volume.destination, "/var/lib/data");
        assert_eq!(volume.option, "ro");
        assert!(parse_volume("a:b:c:d").is_none());
    }

    #[test]
    fn test_device_forms() {
        assert_eq!(parse_device("/dev/ttyUSB0"), Some(vec!["/dev/ttyUSB0"]));
        assert_eq!(
            parse_device("/dev/a:/dev/b:r"),
            Some(vec!["/dev/a", "/dev/b", "r"])
        );
        assert_eq!(parse_device("/dev/a:/dev/b:rw:extra"), None);
        assert_eq!(parse_device("/dev/a:"), None);
    }

    #[test]
    fn test_extra_host_forms() {
        assert_eq!(parse_extra_host("db:10.0.0.3").as_deref(), Some("db:10.0.0.3"));
        assert_eq!(parse_extra_host("db=10.0.0.3").as_deref(), Some("db:10.0.0.3"));
        assert_eq!(parse_extra_host("v6:::1").as_deref(), Some("v6:::1"));
        assert_eq!(parse_extra_host("db"), None);
        assert_eq!(parse_extra_host(":10.0.0.3"), None);
    }

    #[test]
    fn test_from_raw_carries_host_entries_and_shared_volumes() {
        let raw: RawServiceSpec = serde_json::from_value(serde_json::json!({
            "image": "app:1",
            "extra_hosts": {"registry": "10.0.0.2", "cache": "10.0.0.3"},
            "volumes_from": ["data"]
        }))
        .unwrap();
        let spec = ServiceSpec::from_raw("app", raw).unwrap();
        assert_eq!(spec.extra_hosts, vec!["cache:10.0.0.3", "registry:10.0.0.2"]);
        assert_eq!(spec.volumes_from, vec!["data"]);

        let raw = RawServiceSpec {
            image: "app:1".into(),
            extra_hosts: Some(RawExtraHosts::List(vec!["nohost".into()])),
            ..Default::default()
        };
        assert!(matches!(
            ServiceSpec::from_raw("app", raw),
            Err(CompileError::InvalidExtraHost { .. })
        ));
    }

    #[test]
    fn test_from_raw_rejects_overlong_device() {
        let raw = RawServiceSpec {
            image: "sensor:1".into(),
            devices: vec!["/dev/ttyUSB0".into(), "/dev/a:/dev/b:rwm:x".into()],
            ..Default::default()
        };
        let err = ServiceSpec::from_raw("sensor", raw).unwrap_err();
        assert_eq!(
            err,
            CompileError::InvalidDevice {
                service: "sensor".into(),
                value: "/dev/a:/dev/b:rwm:x".into()
            }
        );
    }

    #[test]
    fn test_from_raw_full_entry() {
        let raw: RawServiceSpec = serde_json::from_value(serde_json::json!({
            "image": "registry.local:5000/web:2",
            "command": "serve --port 80",
            "environment": {"MODE": "prod", "A": "1"},
            "ports": ["8080:80"],
            "volumes": ["/srv:/data"],
            "restart": "on-failure:3",
            "networks": {"backend": {"ipv4_address": "10.0.0.5"}, "frontend": null},
            "depends_on": ["db"],
            "deploy": {"resources": {"limits": {"cpus": "1.5", "memory": "512m"}}}
        }))
        .unwrap();

        let spec = ServiceSpec::from_raw("web", raw).unwrap();
        assert_eq!(spec.name, "web");
        assert_eq!(spec.command, vec!["serve", "--port", "80"]);
        assert_eq!(spec.environment, vec!["A=1", "MODE=prod"]);
        assert_eq!(spec.restart.max_retries, 3);
        assert_eq!(spec.resources.cpu_quota, Some(150_000));
        assert_eq!(spec.resources.cpu_period, Some(100_000));
        assert_eq!(spec.resources.memory, Some(536_870_912));
        assert_eq!(spec.networks.len(), 2);
        assert_eq!(spec.networks[0].name, "backend");
        assert_eq!(spec.depends_on, vec!["db"]);
    }

    #[test]
    fn test_from_raw_reports_bad_field() {
        let raw = RawServiceSpec {
            image: "nginx".into(),
            deploy: RawDeploy {
                resources: RawResources {
                    limits: RawLimits {
                        memory: Some("lots".into()),
                        ..Default::default()
                    },
                },
            },
            ..Default::default()
        };

        let err = ServiceSpec::from_raw("web", raw).unwrap_err();
        assert_eq!(
            err,
            CompileError::InvalidMemory {
                service: "web".into(),
                value: "lots".into()
            }
        );
    }

    #[test]
    fn test_from_raw_requires_image() {
        let err = ServiceSpec::from_raw("web", RawServiceSpec::default()).unwrap_err();
        assert!(matches!(err, CompileError::MissingImage { .. }));
    }
}
