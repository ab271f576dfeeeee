//! Core data models for the fleet agent

use crate::service::{compile, CreateDirective, ImageRef, ServiceSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    Restarting,
    Unknown,
}

impl ContainerStatus {
    /// Map an engine state string such as `running` or `exited`
    pub fn from_engine_state(state: &str) -> Self {
        match state {
            "running" => ContainerStatus::Running,
            "restarting" => ContainerStatus::Restarting,
            "exited" | "created" | "dead" | "paused" | "removing" => ContainerStatus::Stopped,
            _ => ContainerStatus::Unknown,
        }
    }

    /// Whether the container is a candidate for replacement
    pub fn is_active(&self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Restarting)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A container as observed at scan time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    /// Desired image reference, e.g. `nginx:1.25`
    pub image: String,
    /// Local image id the container was created from
    pub image_id: String,
    /// Registry digest of the local image, absent for locally built images
    pub current_digest: Option<String>,
    pub status: ContainerStatus,
    /// Spec recovered from the running container
    pub spec: ServiceSpec,
    /// True for the agent's own container
    pub is_self: bool,
}

/// Selects which containers a cycle considers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerFilter {
    /// Container names to include; empty means all
    pub names: Vec<String>,
    /// Image names to include, compared without tag; empty means all
    pub images: Vec<String>,
    /// Container names never touched
    pub exclude: Vec<String>,
}

impl ContainerFilter {
    pub fn matches(&self, name: &str, image: &str) -> bool {
        if self.exclude.iter().any(|n| n == name) {
            return false;
        }
        if !self.names.is_empty() && !self.names.iter().any(|n| n == name) {
            return false;
        }
        if !self.images.is_empty() {
            let image = ImageRef::parse(image);
            return self
                .images
                .iter()
                .any(|wanted| ImageRef::parse(wanted).same_repository(&image));
        }
        true
    }

    /// Merge a request filter with the configured exclusions
    pub fn with_exclusions(mut self, exclude: &[String]) -> Self {
        for name in exclude {
            if !self.exclude.contains(name) {
                self.exclude.push(name.clone());
            }
        }
        self
    }
}

/// Read model served by the containers endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerView {
    pub name: String,
    pub id: String,
    pub image: String,
    pub status: ContainerStatus,
    pub digest: Option<String>,
    pub is_self: bool,
    pub directive: CreateDirective,
    pub fingerprint: String,
}

impl ContainerView {
    pub fn from_record(record: &ContainerRecord) -> Self {
        let directive = compile(&record.spec);
        let fingerprint = directive.fingerprint();
        Self {
            name: record.name.clone(),
            id: record.id.clone(),
            image: record.image.clone(),
            status: record.status,
            digest: record.current_digest.clone(),
            is_self: record.is_self,
            directive,
            fingerprint,
        }
    }
}

/// What a cycle does with stale containers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    /// Pull and recreate
    Update,
    /// Pull only
    Download,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Update => f.write_str("update"),
            CycleKind::Download => f.write_str("download"),
        }
    }
}

/// One step the engine plans or executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Skip,
    Pull,
    Stop,
    Recreate,
    Start,
    Rollback,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Skip => "skip",
            Action::Pull => "pull",
            Action::Stop => "stop",
            Action::Recreate => "recreate",
            Action::Start => "start",
            Action::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerError {
    pub container: String,
    pub message: String,
}

/// An executed step and whether it succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub container: String,
    pub action: Action,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of one reconciliation cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub kind: CycleKind,
    pub scanned: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<ContainerError>,
    pub stale: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the cycle aborted as a whole
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl CycleResult {
    pub fn empty(kind: CycleKind, started_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            scanned: 0,
            updated: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            stale: Vec::new(),
            steps: Vec::new(),
            started_at,
            finished_at: started_at,
            fault: None,
        }
    }

    /// An aborted cycle: nothing scanned, one aggregate error
    pub fn aborted(kind: CycleKind, started_at: DateTime<Utc>, fault: impl Into<String>) -> Self {
        let fault = fault.into();
        Self {
            errors: vec![ContainerError {
                container: String::new(),
                message: fault.clone(),
            }],
            fault: Some(fault),
            finished_at: Utc::now(),
            ..Self::empty(kind, started_at)
        }
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }

    /// Actions executed for one container, in order
    pub fn actions_for(&self, container: &str) -> Vec<Action> {
        self.steps
            .iter()
            .filter(|s| s.container == container)
            .map(|s| s.action)
            .collect()
    }
}
