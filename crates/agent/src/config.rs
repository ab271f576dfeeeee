//! Agent configuration

use anyhow::{Context, Result};
use fleet_agent_lib::{BroadcastConfig, EngineConfig, SchedulerConfig};
use serde::Deserialize;
use std::time::Duration;

/// Agent configuration, read from `FLEET_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in structured logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port of the control API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Docker Engine endpoint (`unix://` socket or `tcp://`/`http://`
    /// address); unset means the local socket or `DOCKER_HOST`
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Seconds between scheduled update cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub update_on_startup: bool,

    /// Report stale containers without updating them
    #[serde(default)]
    pub monitor_only: bool,

    #[serde(default)]
    pub rolling_restart: bool,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Containers no cycle may touch
    #[serde(default)]
    pub disabled_containers: Vec<String>,

    /// Lines of log history sent to a new subscriber
    #[serde(default = "default_log_tail")]
    pub log_tail: String,

    /// Longest log line sent as one message
    #[serde(default = "default_log_max_line_bytes")]
    pub log_max_line_bytes: usize,

    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,

    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,

    /// Root of the procfs/sysfs tree telemetry is read from
    #[serde(default = "default_proc_root")]
    pub proc_root: String,
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_poll_interval() -> u64 {
    300
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_log_tail() -> String {
    "20".to_string()
}

fn default_log_max_line_bytes() -> usize {
    16 * 1024
}

fn default_telemetry_interval() -> u64 {
    10
}

fn default_liveness_window() -> u64 {
    10
}

fn default_proc_root() -> String {
    "/".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            docker_host: None,
            poll_interval_secs: default_poll_interval(),
            update_on_startup: false,
            monitor_only: false,
            rolling_restart: false,
            stop_timeout_secs: default_stop_timeout(),
            disabled_containers: Vec::new(),
            log_tail: default_log_tail(),
            log_max_line_bytes: default_log_max_line_bytes(),
            telemetry_interval_secs: default_telemetry_interval(),
            liveness_window_secs: default_liveness_window(),
            proc_root: default_proc_root(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("FLEET"))
    }

    fn from_source(env: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                env.try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("disabled_containers"),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid FLEET_* configuration")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            monitor_only: self.monitor_only,
            rolling_restart: self.rolling_restart,
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            disabled_containers: self.disabled_containers.clone(),
            ..EngineConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            update_on_startup: self.update_on_startup,
        }
    }

    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            log_tail: self.log_tail.clone(),
            max_line_bytes: self.log_max_line_bytes,
            telemetry_interval: Duration::from_secs(self.telemetry_interval_secs.max(1)),
            liveness_window: Duration::from_secs(self.liveness_window_secs.max(1)),
            ..BroadcastConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AgentConfig::from_source(
            config::Environment::with_prefix("FLEET").source(Some(source)),
        )
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = load(&[]).unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.poll_interval_secs, 300);
        assert_eq!(config.log_tail, "20");
        assert!(!config.monitor_only);
        assert!(config.disabled_containers.is_empty());
        assert_eq!(config.docker_host, None);
        assert_eq!(config.broadcast_config().max_line_bytes, 16 * 1024);
    }

    #[test]
    fn test_environment_overrides() {
        let config = load(&[
            ("FLEET_API_PORT", "9000"),
            ("FLEET_MONITOR_ONLY", "true"),
            ("FLEET_POLL_INTERVAL_SECS", "60"),
            ("FLEET_DISABLED_CONTAINERS", "db,proxy"),
            ("FLEET_DOCKER_HOST", "tcp://10.0.0.5:2375"),
            ("FLEET_LOG_MAX_LINE_BYTES", "4096"),
        ])
        .unwrap();

        assert_eq!(config.api_port, 9000);
        assert!(config.monitor_only);
        assert_eq!(config.disabled_containers, vec!["db", "proxy"]);
        assert_eq!(config.docker_host.as_deref(), Some("tcp://10.0.0.5:2375"));
        assert_eq!(config.broadcast_config().max_line_bytes, 4096);
        assert_eq!(config.scheduler_config().interval, Duration::from_secs(60));
        assert_eq!(config.engine_config().disabled_containers.len(), 2);
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        assert!(load(&[("FLEET_API_PORT", "not-a-port")]).is_err());
    }
}
