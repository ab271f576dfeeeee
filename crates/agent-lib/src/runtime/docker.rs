//! Docker Engine adapter on top of `bollard`
//!
//! Connects over the local unix socket by default, or to an explicit
//! `unix://`, `tcp://` or `http://` endpoint. Implements both the runtime
//! gateway and the registry lookup, the latter through the engine's
//! distribution endpoint.

use super::{LogStream, RegistryLookup, RuntimeGateway};
use crate::error::{RegistryError, RuntimeError};
use crate::models::{ContainerFilter, ContainerRecord, ContainerStatus};
use crate::service::{
    parse_volume, CreateDirective, ImageRef, NetworkAttachment, PortBinding, ResourceLimits,
    RestartPolicy, ServiceSpec, VolumeBinding,
};
use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, NetworkingConfig,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as EngineError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, DeviceMapping, EndpointIpamConfig,
    EndpointSettings, HostConfig, HostConfigLogConfig, ImageInspect, MountPoint,
    MountPointTypeEnum, MountTypeEnum, PortBinding as EnginePortBinding,
    RestartPolicy as EngineRestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::ConnectNetworkOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Label marking the agent's own container
pub const AGENT_LABEL: &str = "fleet.agent";
/// Comma separated dependency list
pub const DEPENDS_ON_LABEL: &str = "fleet.depends-on";
const COMPOSE_DEPENDS_ON_LABEL: &str = "com.docker.compose.depends_on";

/// Seconds the engine has to answer a request
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Runtime gateway backed by the Docker Engine API
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to `host`, or to the local socket (honouring `DOCKER_HOST`)
    /// when no host is configured
    pub fn connect(host: Option<&str>) -> anyhow::Result<Self> {
        let docker = match host {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") || host.starts_with('/') => {
                Docker::connect_with_socket(host, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => {
                Docker::connect_with_http(host, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        }
        .with_context(|| {
            format!(
                "Failed to set up Docker client for {}",
                host.unwrap_or("the local socket")
            )
        })?;

        Ok(Self { docker })
    }

    /// Engine version, used as a connectivity check at startup
    pub async fn ping(&self) -> Result<String, RuntimeError> {
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| engine_error(e, "version"))?;
        Ok(version.version.unwrap_or_default())
    }

    async fn inspect_raw(&self, id: &str) -> Result<ContainerInspectResponse, RuntimeError> {
        self.docker
            .inspect_container(id, None)
            .await
            .map_err(|e| engine_error(e, id))
    }
}

#[async_trait]
impl RuntimeGateway for DockerEngine {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| engine_error(e, "containers"))?;

        let mut records = Vec::new();
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            let name = summary
                .names
                .unwrap_or_default()
                .first()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            if !filter.matches(&name, summary.image.as_deref().unwrap_or_default()) {
                continue;
            }
            match self.inspect(&id).await {
                Ok(record) => records.push(record),
                // Removed between list and inspect
                Err(RuntimeError::NotFound(_)) => {
                    debug!(container = %name, "Container vanished during scan");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
        let inspect = self.inspect_raw(id).await?;
        let image_id = inspect.image.clone().unwrap_or_default();
        let image = match self.docker.inspect_image(&image_id).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to inspect container image");
                None
            }
        };
        Ok(record_from_inspect(inspect, image))
    }

    async fn stream_logs(
        &self,
        id: &str,
        follow: bool,
        tail: &str,
    ) -> Result<LogStream, RuntimeError> {
        // The log call itself only fails once polled
        self.inspect_raw(id).await?;

        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let subject = id.to_string();
        let logs = self.docker.logs(id, Some(options)).map(move |output| {
            output
                .map(|frame| frame.into_bytes().to_vec())
                .map_err(|e| engine_error(e, &subject))
        });
        Ok(Box::pin(logs))
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
        };
        // The engine answers only once the grace period has run out
        let docker = self
            .docker
            .clone()
            .with_timeout(grace + Duration::from_secs(REQUEST_TIMEOUT_SECS));
        match docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(engine_error(e, id)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(id, None)
            .await
            .map_err(|e| engine_error(e, id))
    }

    async fn create(
        &self,
        name: &str,
        directive: &CreateDirective,
    ) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let (config, extra_networks) = create_config(directive);
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| engine_error(e, name))?;

        for (network, endpoint_config) in extra_networks {
            let options = ConnectNetworkOptions {
                container: created.id.clone(),
                endpoint_config,
            };
            self.docker
                .connect_network(&network, options)
                .await
                .map_err(|e| engine_error(e, &network))?;
        }

        for warning in created.warnings {
            warn!(container = %name, warning = %warning, "Engine warning on create");
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(engine_error(e, id)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let reference = ImageRef::parse(image);
        let options = CreateImageOptions {
            from_image: reference.name.clone(),
            tag: reference.tag_or_default().to_string(),
            ..Default::default()
        };

        // Failures after the pull starts arrive inline in the progress stream
        let mut progress = pin!(self.docker.create_image(Some(options), None, None));
        while let Some(update) = progress.next().await {
            update.map_err(|e| engine_error(e, image))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryLookup for DockerEngine {
    async fn latest_digest(&self, image: &str) -> Result<String, RegistryError> {
        let reference = ImageRef::parse(image);
        let lookup_error = |message: String| RegistryError::Lookup {
            image: image.to_string(),
            message,
        };

        match self
            .docker
            .inspect_registry_image(&reference.tagged(), None)
            .await
        {
            Ok(info) => info
                .descriptor
                .digest
                .filter(|digest| !digest.is_empty())
                .ok_or_else(|| lookup_error("registry returned no digest".to_string())),
            Err(EngineError::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RegistryError::NotFound(image.to_string())),
            Err(e) => Err(lookup_error(e.to_string())),
        }
    }
}

/// `304 Not Modified`: already stopped or started
fn is_not_modified(error: &EngineError) -> bool {
    matches!(
        error,
        EngineError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn engine_error(error: EngineError, subject: &str) -> RuntimeError {
    match error {
        EngineError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(format!("{subject}: {message}")),
        EngineError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        EngineError::DockerStreamError { error } => RuntimeError::Api {
            status: 500,
            message: error,
        },
        decode @ (EngineError::JsonDataError { .. } | EngineError::JsonSerdeError { .. }) => {
            RuntimeError::Decode(decode.to_string())
        }
        other => RuntimeError::Transport(other.to_string()),
    }
}

fn restart_policy_name(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        _ => RestartPolicyNameEnum::NO,
    }
}

fn restart_policy_from_engine(policy: Option<EngineRestartPolicy>) -> RestartPolicy {
    let Some(policy) = policy else {
        return RestartPolicy::default();
    };
    let name = match policy.name {
        Some(RestartPolicyNameEnum::ALWAYS) => "always",
        Some(RestartPolicyNameEnum::ON_FAILURE) => "on-failure",
        Some(RestartPolicyNameEnum::UNLESS_STOPPED) => "unless-stopped",
        _ => "no",
    };
    RestartPolicy {
        name: name.to_string(),
        max_retries: policy
            .maximum_retry_count
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
    }
}

fn state_name(status: Option<ContainerStateStatusEnum>) -> &'static str {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => "created",
        Some(ContainerStateStatusEnum::RUNNING) => "running",
        Some(ContainerStateStatusEnum::PAUSED) => "paused",
        Some(ContainerStateStatusEnum::RESTARTING) => "restarting",
        Some(ContainerStateStatusEnum::REMOVING) => "removing",
        Some(ContainerStateStatusEnum::EXITED) => "exited",
        Some(ContainerStateStatusEnum::DEAD) => "dead",
        _ => "",
    }
}

/// Build the create parameters. Only one endpoint can be attached at
/// create time; the rest are returned for a follow-up connect call.
fn create_config(
    directive: &CreateDirective,
) -> (Config<String>, Vec<(String, EndpointSettings)>) {
    let process = &directive.process;
    let host = &directive.host;
    let resources = &host.resources;

    let devices = resources
        .devices
        .iter()
        .map(|d| {
            let host_path = if d.path_on_host.is_empty() {
                &d.path_in_container
            } else {
                &d.path_on_host
            };
            DeviceMapping {
                path_on_host: Some(host_path.clone()),
                path_in_container: Some(d.path_in_container.clone()),
                cgroup_permissions: Some(d.cgroup_permissions.clone()),
            }
        })
        .collect();

    let port_bindings: HashMap<String, Option<Vec<EnginePortBinding>>> = host
        .port_bindings
        .iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| EnginePortBinding {
                    host_ip: Some(b.host_ip.clone()),
                    host_port: Some(b.host_port.clone()),
                })
                .collect();
            (port.clone(), Some(bindings))
        })
        .collect();
    let exposed_ports: HashMap<String, HashMap<(), ()>> = host
        .port_bindings
        .keys()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();

    let mut endpoints: Vec<(String, EndpointSettings)> = directive
        .network
        .endpoints
        .iter()
        .map(|(name, settings)| {
            let endpoint = EndpointSettings {
                aliases: Some(settings.aliases.clone()),
                ipam_config: settings.ipv4_address.as_ref().map(|ip| EndpointIpamConfig {
                    ipv4_address: Some(ip.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            };
            (name.clone(), endpoint)
        })
        .collect();

    // The primary endpoint is the one matching the network mode.
    let primary = host
        .network_mode
        .as_ref()
        .and_then(|mode| endpoints.iter().position(|(name, _)| name == mode));
    let mut endpoints_config = HashMap::new();
    if let Some(index) = primary {
        let (name, endpoint) = endpoints.remove(index);
        endpoints_config.insert(name, endpoint);
    }

    let host_config = HostConfig {
        binds: Some(host.binds.clone()),
        volumes_from: Some(host.volumes_from.clone()),
        extra_hosts: Some(host.extra_hosts.clone()),
        cap_add: Some(host.cap_add.clone()),
        cap_drop: Some(host.cap_drop.clone()),
        network_mode: host.network_mode.clone(),
        restart_policy: Some(EngineRestartPolicy {
            name: Some(restart_policy_name(&host.restart_policy.name)),
            maximum_retry_count: Some(i64::from(host.restart_policy.max_retries)),
        }),
        ipc_mode: host.ipc_mode.clone(),
        port_bindings: Some(port_bindings),
        cpu_period: resources.cpu_period,
        cpu_quota: resources.cpu_quota,
        cpuset_cpus: resources.cpuset_cpus.clone(),
        memory: resources.memory,
        oom_kill_disable: Some(resources.oom_kill_disable),
        devices: Some(devices),
        sysctls: Some(host.sysctls.clone().into_iter().collect()),
        privileged: Some(host.privileged),
        log_config: Some(HostConfigLogConfig {
            typ: Some(host.log_driver.clone()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let config = Config {
        image: Some(process.image.clone()),
        hostname: process.hostname.clone(),
        user: process.user.clone(),
        tty: Some(process.tty),
        cmd: process.cmd.clone(),
        entrypoint: process.entrypoint.clone(),
        env: Some(process.env.clone()),
        working_dir: process.working_dir.clone(),
        stop_signal: Some(process.stop_signal.clone()),
        labels: Some(process.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        networking_config: Some(NetworkingConfig { endpoints_config }),
        ..Default::default()
    };

    (config, endpoints)
}

/// Recover the declarative spec of a running container. Values inherited
/// from the image are dropped so a recreate picks up the new image's
/// defaults.
fn record_from_inspect(
    inspect: ContainerInspectResponse,
    image: Option<ImageInspect>,
) -> ContainerRecord {
    let config = inspect.config.unwrap_or_default();
    let host = inspect.host_config.unwrap_or_default();
    let name = inspect
        .name
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string();
    let image_config = image
        .as_ref()
        .and_then(|i| i.config.clone())
        .unwrap_or_default();

    let inherited_env = image_config.env.unwrap_or_default();
    let environment = config
        .env
        .unwrap_or_default()
        .into_iter()
        .filter(|e| !inherited_env.contains(e))
        .collect();
    let command = match (config.cmd, image_config.cmd) {
        (Some(cmd), Some(inherited)) if cmd == inherited => Vec::new(),
        (cmd, _) => cmd.unwrap_or_default(),
    };
    let entrypoint = match (config.entrypoint, image_config.entrypoint) {
        (Some(ep), Some(inherited)) if ep == inherited => Vec::new(),
        (ep, _) => ep.unwrap_or_default(),
    };

    // Engine maps are unordered
    let port_bindings: BTreeMap<_, _> = host
        .port_bindings
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();
    let mut ports = Vec::new();
    for (key, bindings) in port_bindings {
        let (target, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        for binding in bindings.unwrap_or_default() {
            ports.push(PortBinding {
                target: target.to_string(),
                protocol: protocol.to_string(),
                host_ip: binding.host_ip.unwrap_or_default(),
                host_port: binding.host_port.unwrap_or_default(),
            });
        }
    }

    let networks: BTreeMap<_, _> = inspect
        .network_settings
        .and_then(|settings| settings.networks)
        .unwrap_or_default()
        .into_iter()
        .collect();
    let networks = networks
        .into_iter()
        .map(|(name, endpoint)| NetworkAttachment {
            name,
            ipv4_address: endpoint
                .ipam_config
                .and_then(|c| c.ipv4_address)
                .filter(|ip| !ip.is_empty()),
            aliases: endpoint.aliases.unwrap_or_default(),
        })
        .collect();

    // Dependencies and the agent marker may come from the image's labels
    let all_labels: BTreeMap<String, String> =
        config.labels.unwrap_or_default().into_iter().collect();
    let depends_on = dependencies_from_labels(&all_labels);
    let is_self = all_labels.get(AGENT_LABEL).is_some_and(|v| v == "true");
    let inherited_labels = image_config.labels.unwrap_or_default();
    let labels = all_labels
        .into_iter()
        .filter(|(key, value)| inherited_labels.get(key) != Some(value))
        .collect();

    let desired_image = config.image.unwrap_or_default();
    let current_digest = image
        .as_ref()
        .and_then(|i| i.repo_digests.as_deref())
        .and_then(|digests| repo_digest(digests, &desired_image));

    let spec = ServiceSpec {
        name: name.clone(),
        image: desired_image.clone(),
        command,
        entrypoint,
        environment,
        working_dir: config.working_dir.filter(|s| !s.is_empty()),
        hostname: config.hostname.filter(|s| !s.is_empty()),
        user: config.user.filter(|s| !s.is_empty()),
        tty: config.tty.unwrap_or(false),
        privileged: host.privileged.unwrap_or(false),
        cap_add: host.cap_add.clone().unwrap_or_default(),
        cap_drop: host.cap_drop.clone().unwrap_or_default(),
        devices: host
            .devices
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|d| {
                format!(
                    "{}:{}:{}",
                    d.path_on_host.unwrap_or_default(),
                    d.path_in_container.unwrap_or_default(),
                    d.cgroup_permissions.unwrap_or_default()
                )
            })
            .collect(),
        volumes: volumes_from_inspect(&host, inspect.mounts.as_deref().unwrap_or_default()),
        volumes_from: host.volumes_from.clone().unwrap_or_default(),
        ports,
        resources: ResourceLimits {
            cpu_period: host.cpu_period.filter(|v| *v > 0),
            cpu_quota: host.cpu_quota.filter(|v| *v > 0),
            cpuset_cpus: host.cpuset_cpus.clone().filter(|s| !s.is_empty()),
            memory: host.memory.filter(|v| *v > 0),
            oom_kill_disable: host.oom_kill_disable.unwrap_or(false),
        },
        sysctls: host.sysctls.clone().unwrap_or_default().into_iter().collect(),
        restart: restart_policy_from_engine(host.restart_policy.clone()),
        network_mode: host.network_mode.clone().filter(|s| !s.is_empty()),
        networks,
        ipc_mode: host.ipc_mode.clone().filter(|s| !s.is_empty()),
        extra_hosts: host.extra_hosts.clone().unwrap_or_default(),
        labels,
        depends_on,
    };

    ContainerRecord {
        id: inspect.id.unwrap_or_default(),
        name,
        image: desired_image,
        image_id: inspect.image.unwrap_or_default(),
        current_digest,
        status: ContainerStatus::from_engine_state(state_name(
            inspect.state.and_then(|s| s.status),
        )),
        spec,
        is_self,
    }
}

/// Every persistent mount of the container: `Binds` first, then typed
/// `Mounts`, then whatever the engine reports as mounted (volumes declared
/// by the image included). The first entry per destination wins.
fn volumes_from_inspect(host: &HostConfig, mounted: &[MountPoint]) -> Vec<VolumeBinding> {
    let read_only = |ro: bool| if ro { "ro" } else { "" }.to_string();

    let binds = host.binds.iter().flatten().filter_map(|b| parse_volume(b));
    let mounts = host.mounts.iter().flatten().filter_map(|m| match m.typ {
        Some(MountTypeEnum::BIND) | Some(MountTypeEnum::VOLUME) => Some(VolumeBinding {
            source: m.source.clone().unwrap_or_default(),
            destination: m.target.clone().unwrap_or_default(),
            option: read_only(m.read_only.unwrap_or(false)),
        }),
        _ => None,
    });
    let points = mounted.iter().filter_map(|m| {
        let source = match m.typ {
            Some(MountPointTypeEnum::VOLUME) => m.name.clone(),
            Some(MountPointTypeEnum::BIND) => m.source.clone(),
            _ => None,
        }?;
        Some(VolumeBinding {
            source,
            destination: m.destination.clone().unwrap_or_default(),
            option: read_only(m.rw == Some(false)),
        })
    });

    let mut volumes: Vec<VolumeBinding> = Vec::new();
    for volume in binds.chain(mounts).chain(points) {
        if volume.source.is_empty() || volume.destination.is_empty() {
            continue;
        }
        if volumes.iter().any(|v| v.destination == volume.destination) {
            continue;
        }
        volumes.push(volume);
    }
    volumes
}

/// Dependencies from the agent's own label, falling back to compose's
/// `name:condition:restart` entries
fn dependencies_from_labels(labels: &BTreeMap<String, String>) -> Vec<String> {
    let raw = labels
        .get(DEPENDS_ON_LABEL)
        .or_else(|| labels.get(COMPOSE_DEPENDS_ON_LABEL));
    raw.map(|value| {
        value
            .split(',')
            .filter_map(|entry| entry.split(':').next())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Pick the digest recorded for the container's repository
fn repo_digest(repo_digests: &[String], image: &str) -> Option<String> {
    let wanted = ImageRef::parse(image);
    repo_digests
        .iter()
        .filter_map(|entry| entry.split_once('@'))
        .find(|(repo, _)| ImageRef::parse(repo).same_repository(&wanted))
        .map(|(_, digest)| digest.to_string())
}
