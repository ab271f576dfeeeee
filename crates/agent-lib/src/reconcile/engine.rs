//! Reconciliation cycles: scan, plan, execute, report

use super::plan::{build_plan, Assessment, PlanOptions, PlanStep, UpdatePlan};
use super::token::ExecutionToken;
use crate::error::{ControlError, LockBusyError, RuntimeError};
use crate::models::{
    Action, ContainerError, ContainerFilter, ContainerRecord, CycleKind, CycleResult, StepRecord,
};
use crate::runtime::{RegistryLookup, RuntimeGateway};
use crate::service::compile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Receives every finished cycle
pub trait CycleObserver: Send + Sync {
    fn on_cycle_complete(&self, result: &CycleResult);
}

/// Where the engine currently is in a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePhase {
    Idle,
    Scanning,
    Planning,
    Executing,
    Reporting,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Report staleness without touching containers
    pub monitor_only: bool,
    /// Restart one container at a time instead of in stop/start groups
    pub rolling_restart: bool,
    /// Grace period given to a container before it is killed
    pub stop_timeout: Duration,
    /// Attempts for the container listing
    pub read_attempts: u32,
    pub read_retry_delay: Duration,
    /// Containers never considered by any cycle
    pub disabled_containers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_only: false,
            rolling_restart: false,
            stop_timeout: Duration::from_secs(10),
            read_attempts: 3,
            read_retry_delay: Duration::from_millis(500),
            disabled_containers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRequest {
    pub kind: CycleKind,
    #[serde(default)]
    pub filter: ContainerFilter,
}

impl CycleRequest {
    pub fn update() -> Self {
        Self {
            kind: CycleKind::Update,
            filter: ContainerFilter::default(),
        }
    }

    pub fn download() -> Self {
        Self {
            kind: CycleKind::Download,
            filter: ContainerFilter::default(),
        }
    }

    pub fn with_filter(mut self, filter: ContainerFilter) -> Self {
        self.filter = filter;
        self
    }
}

struct EngineInner {
    runtime: Arc<dyn RuntimeGateway>,
    registry: Arc<dyn RegistryLookup>,
    config: EngineConfig,
    observers: Vec<Arc<dyn CycleObserver>>,
    phase: watch::Sender<CyclePhase>,
}

/// Runs reconciliation cycles, at most one at a time
#[derive(Clone)]
pub struct ReconciliationEngine {
    inner: Arc<EngineInner>,
    token: ExecutionToken,
}

/// Builder for [`ReconciliationEngine`]
pub struct ReconciliationEngineBuilder {
    runtime: Arc<dyn RuntimeGateway>,
    registry: Arc<dyn RegistryLookup>,
    token: Option<ExecutionToken>,
    config: EngineConfig,
    observers: Vec<Arc<dyn CycleObserver>>,
}

impl ReconciliationEngineBuilder {
    pub fn new(runtime: Arc<dyn RuntimeGateway>, registry: Arc<dyn RegistryLookup>) -> Self {
        Self {
            runtime,
            registry,
            token: None,
            config: EngineConfig::default(),
            observers: Vec::new(),
        }
    }

    /// Share an existing token, e.g. with the scheduler and shutdown path
    pub fn token(mut self, token: ExecutionToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> ReconciliationEngine {
        let (phase, _) = watch::channel(CyclePhase::Idle);
        ReconciliationEngine {
            inner: Arc::new(EngineInner {
                runtime: self.runtime,
                registry: self.registry,
                config: self.config,
                observers: self.observers,
                phase,
            }),
            token: self.token.unwrap_or_default(),
        }
    }
}

impl ReconciliationEngine {
    pub fn builder(
        runtime: Arc<dyn RuntimeGateway>,
        registry: Arc<dyn RegistryLookup>,
    ) -> ReconciliationEngineBuilder {
        ReconciliationEngineBuilder::new(runtime, registry)
    }

    pub fn token(&self) -> &ExecutionToken {
        &self.token
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> CyclePhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<CyclePhase> {
        self.inner.phase.subscribe()
    }

    /// Current containers, without planning anything
    pub async fn list_containers(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerRecord>, RuntimeError> {
        self.inner.runtime.list_containers(filter).await
    }

    /// Start one container by name or id. Holds the execution token so it
    /// never races a cycle.
    pub async fn start_container(&self, name: &str) -> Result<ContainerRecord, ControlError> {
        let _guard = self.token.try_acquire()?;
        let record = self.inner.runtime.inspect(name).await?;
        info!(container = %record.name, "Starting container on request");
        self.inner.runtime.start(&record.id).await?;
        Ok(self.inner.runtime.inspect(&record.id).await?)
    }

    /// Stop one container by name or id with the configured grace period.
    /// The agent's own container is refused.
    pub async fn stop_container(&self, name: &str) -> Result<ContainerRecord, ControlError> {
        let _guard = self.token.try_acquire()?;
        let record = self.inner.runtime.inspect(name).await?;
        if record.is_self {
            return Err(ControlError::SelfContainer(record.name));
        }
        info!(container = %record.name, "Stopping container on request");
        self.inner
            .runtime
            .stop(&record.id, self.inner.config.stop_timeout)
            .await?;
        Ok(self.inner.runtime.inspect(&record.id).await?)
    }

    /// Run one cycle if no other cycle is running.
    ///
    /// The cycle runs on its own task which owns the execution guard, so
    /// the token is released once when the cycle ends even if this future
    /// is dropped or a step panics.
    pub async fn run_cycle(&self, request: CycleRequest) -> Result<CycleResult, LockBusyError> {
        let guard = self.token.try_acquire()?;
        let kind = request.kind;
        let started_at = Utc::now();
        let inner = self.inner.clone();

        let cycle = tokio::spawn(async move {
            let worker = {
                let inner = inner.clone();
                tokio::spawn(async move { inner.execute(request, started_at).await })
            };
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => {
                    error!(kind = %kind, error = %e, "Update cycle task failed");
                    CycleResult::aborted(kind, started_at, format!("cycle task failed: {e}"))
                }
            };

            inner.set_phase(CyclePhase::Reporting);
            for observer in &inner.observers {
                observer.on_cycle_complete(&result);
            }
            inner.set_phase(CyclePhase::Idle);
            drop(guard);
            result
        });

        match cycle.await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(kind = %kind, error = %e, "Update cycle reporting failed");
                self.inner.set_phase(CyclePhase::Idle);
                Ok(CycleResult::aborted(
                    kind,
                    started_at,
                    format!("cycle task failed: {e}"),
                ))
            }
        }
    }
}

impl EngineInner {
    fn set_phase(&self, phase: CyclePhase) {
        self.phase.send_replace(phase);
    }

    async fn list_with_retry(
        &self,
        filter: &ContainerFilter,
    ) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let attempts = self.config.read_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.runtime.list_containers(filter).await {
                Ok(records) => return Ok(records),
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Failed to list containers, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.read_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn assess(&self, record: &ContainerRecord) -> Assessment {
        let Some(current) = record.current_digest.as_deref() else {
            debug!(container = %record.name, "No registry digest, skipping staleness check");
            return Assessment::NoDigest;
        };
        let latest = self
            .registry
            .latest_digest(&record.image)
            .await
            .map_err(|e| e.to_string());
        Assessment::classify(Some(current), latest)
    }

    async fn execute(&self, request: CycleRequest, started_at: DateTime<Utc>) -> CycleResult {
        let kind = request.kind;
        self.set_phase(CyclePhase::Scanning);
        info!(kind = %kind, "Starting update cycle");

        let filter = request
            .filter
            .with_exclusions(&self.config.disabled_containers);
        let records = match self.list_with_retry(&filter).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Aborting cycle, container listing failed");
                return CycleResult::aborted(
                    kind,
                    started_at,
                    format!("failed to list containers: {e}"),
                );
            }
        };

        let mut result = CycleResult::empty(kind, started_at);
        let mut assessments = Vec::with_capacity(records.len());
        for record in &records {
            let assessment = self.assess(record).await;
            match &assessment {
                Assessment::LookupFailed(message) => {
                    warn!(container = %record.name, error = %message, "Could not determine staleness");
                    result.errors.push(ContainerError {
                        container: record.name.clone(),
                        message: message.clone(),
                    });
                }
                Assessment::Stale { .. } => result.stale.push(record.name.clone()),
                _ => {}
            }
            assessments.push(assessment);
        }

        self.set_phase(CyclePhase::Planning);
        let options = PlanOptions {
            monitor_only: self.config.monitor_only,
            rolling_restart: self.config.rolling_restart,
        };
        let plan = match build_plan(&records, &assessments, kind, options) {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "Aborting cycle, cannot order containers");
                return CycleResult::aborted(kind, started_at, e.to_string());
            }
        };
        debug!(steps = plan.steps.len(), "Update plan ready");

        self.set_phase(CyclePhase::Executing);
        result.scanned = records.len();
        result.skipped = plan.skipped();

        let mut execution = Execution::new(self, &records, kind, result);
        execution.run(&plan).await;

        let mut result = execution.result;
        result.finished_at = Utc::now();
        result
    }
}

/// Mutable state of one plan execution
struct Execution<'a> {
    inner: &'a EngineInner,
    records: HashMap<&'a str, &'a ContainerRecord>,
    kind: CycleKind,
    result: CycleResult,
    stopped: HashSet<String>,
    recreated: HashMap<String, String>,
    failed: HashSet<String>,
}

impl<'a> Execution<'a> {
    fn new(
        inner: &'a EngineInner,
        records: &'a [ContainerRecord],
        kind: CycleKind,
        result: CycleResult,
    ) -> Self {
        Self {
            inner,
            records: records.iter().map(|r| (r.name.as_str(), r)).collect(),
            kind,
            result,
            stopped: HashSet::new(),
            recreated: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    async fn run(&mut self, plan: &UpdatePlan) {
        for step in &plan.steps {
            let Some(record) = self.records.get(step.container.as_str()).copied() else {
                continue;
            };
            if step.action != Action::Skip && self.failed.contains(&record.name) {
                debug!(container = %record.name, action = %step.action, "Step blocked by earlier failure");
                continue;
            }
            match step.action {
                Action::Skip => self.skip(record, step),
                Action::Pull => self.pull(record).await,
                Action::Stop => self.stop(record, step).await,
                Action::Recreate => self.recreate(record).await,
                Action::Start => self.start(record).await,
                Action::Rollback => {}
            }
        }
    }

    fn record_step(&mut self, record: &ContainerRecord, action: Action, outcome: Result<(), String>) {
        self.result.steps.push(StepRecord {
            container: record.name.clone(),
            action,
            ok: outcome.is_ok(),
            detail: outcome.err(),
        });
    }

    fn fail(&mut self, record: &ContainerRecord, message: String) {
        warn!(container = %record.name, error = %message, "Container update failed");
        if self.failed.insert(record.name.clone()) {
            self.result.failed += 1;
        }
        self.result.errors.push(ContainerError {
            container: record.name.clone(),
            message,
        });
    }

    fn skip(&mut self, record: &ContainerRecord, step: &PlanStep) {
        if record.is_self {
            info!(container = %record.name, "Skipping the agent's own container");
        } else {
            debug!(container = %record.name, reason = %step.reason, "Skipping container");
        }
        self.result.steps.push(StepRecord {
            container: record.name.clone(),
            action: Action::Skip,
            ok: true,
            detail: Some(step.reason.clone()),
        });
    }

    async fn pull(&mut self, record: &ContainerRecord) {
        info!(container = %record.name, image = %record.image, "Pulling image");
        match self.inner.runtime.pull_image(&record.image).await {
            Ok(()) => {
                self.record_step(record, Action::Pull, Ok(()));
                if self.kind == CycleKind::Download {
                    self.result.updated += 1;
                }
            }
            Err(e) => {
                self.record_step(record, Action::Pull, Err(e.to_string()));
                self.fail(record, format!("pull failed: {e}"));
            }
        }
    }

    /// A restart is pointless once every container it waits on failed
    /// before stopping
    fn restart_needed(&self, step: &PlanStep) -> bool {
        step.after.is_empty()
            || step
                .after
                .iter()
                .any(|name| self.stopped.contains(name) || !self.failed.contains(name))
    }

    async fn stop(&mut self, record: &ContainerRecord, step: &PlanStep) {
        if !self.restart_needed(step) {
            debug!(container = %record.name, after = ?step.after, "Dependencies were not replaced, leaving container running");
            return;
        }
        info!(container = %record.name, timeout_secs = self.inner.config.stop_timeout.as_secs(), "Stopping container");
        match self
            .inner
            .runtime
            .stop(&record.id, self.inner.config.stop_timeout)
            .await
        {
            Ok(()) => {
                self.record_step(record, Action::Stop, Ok(()));
                self.stopped.insert(record.name.clone());
            }
            Err(e) => {
                self.record_step(record, Action::Stop, Err(e.to_string()));
                self.fail(record, format!("stop failed: {e}"));
            }
        }
    }

    async fn recreate(&mut self, record: &ContainerRecord) {
        if !self.stopped.contains(&record.name) {
            return;
        }
        let runtime = self.inner.runtime.clone();

        if let Err(e) = runtime.remove(&record.id).await {
            self.record_step(record, Action::Recreate, Err(e.to_string()));
            self.fail(record, format!("remove failed: {e}"));
            // The old container still exists
            let outcome = runtime.start(&record.id).await.map_err(|e| e.to_string());
            self.rolled_back(record, outcome);
            return;
        }

        let directive = compile(&record.spec.with_image(record.image.clone()));
        match runtime.create(&record.name, &directive).await {
            Ok(id) => {
                debug!(container = %record.name, id = %id, fingerprint = %directive.fingerprint(), "Container recreated");
                self.record_step(record, Action::Recreate, Ok(()));
                self.recreated.insert(record.name.clone(), id);
            }
            Err(e) => {
                self.record_step(record, Action::Recreate, Err(e.to_string()));
                self.fail(record, format!("create failed: {e}"));
                let outcome = self.restore_previous(record).await;
                self.rolled_back(record, outcome);
            }
        }
    }

    async fn start(&mut self, record: &ContainerRecord) {
        let runtime = self.inner.runtime.clone();

        if let Some(id) = self.recreated.get(&record.name).cloned() {
            match runtime.start(&id).await {
                Ok(()) => {
                    info!(container = %record.name, image = %record.image, "Container updated");
                    self.record_step(record, Action::Start, Ok(()));
                    self.result.updated += 1;
                }
                Err(e) => {
                    self.record_step(record, Action::Start, Err(e.to_string()));
                    self.fail(record, format!("start failed: {e}"));
                    let outcome = match runtime.remove(&id).await {
                        Ok(()) => self.restore_previous(record).await,
                        Err(e) => Err(format!("cannot remove new container: {e}")),
                    };
                    self.rolled_back(record, outcome);
                }
            }
            return;
        }

        if self.stopped.contains(&record.name) {
            match runtime.start(&record.id).await {
                Ok(()) => self.record_step(record, Action::Start, Ok(())),
                Err(e) => {
                    self.record_step(record, Action::Start, Err(e.to_string()));
                    self.fail(record, format!("restart failed: {e}"));
                }
            }
        }
    }

    /// Recreate the container from the image it was running before
    async fn restore_previous(&self, record: &ContainerRecord) -> Result<(), String> {
        let runtime = &self.inner.runtime;
        let directive = compile(&record.spec.with_image(record.image_id.clone()));
        let id = runtime
            .create(&record.name, &directive)
            .await
            .map_err(|e| format!("cannot recreate previous container: {e}"))?;
        runtime
            .start(&id)
            .await
            .map_err(|e| format!("cannot start previous container: {e}"))
    }

    fn rolled_back(&mut self, record: &ContainerRecord, outcome: Result<(), String>) {
        match &outcome {
            Ok(()) => warn!(container = %record.name, "Rolled back to previous container"),
            Err(e) => {
                error!(container = %record.name, error = %e, "Rollback failed");
                self.result.errors.push(ContainerError {
                    container: record.name.clone(),
                    message: format!("rollback failed: {e}"),
                });
            }
        }
        self.record_step(record, Action::Rollback, outcome);
    }
}
