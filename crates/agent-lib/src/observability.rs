//! Observability infrastructure for the fleet agent
//!
//! Provides:
//! - Prometheus metrics (cycle outcomes, cycle duration, busy rejections, subscriptions)
//! - Structured JSON logging with tracing

use crate::models::{Action, CycleKind, CycleResult};
use crate::reconcile::CycleObserver;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for cycle durations (in seconds)
const CYCLE_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<FleetMetricsInner> = OnceLock::new();

struct FleetMetricsInner {
    cycles_total: IntCounterVec,
    cycle_duration_seconds: Histogram,
    last_scanned: IntGauge,
    last_updated: IntGauge,
    last_failed: IntGauge,
    stale_containers: IntGauge,
    busy_rejections: IntCounter,
    active_subscriptions: IntGauge,
}

impl FleetMetricsInner {
    fn new() -> Self {
        Self {
            cycles_total: register_int_counter_vec!(
                "fleet_agent_cycles_total",
                "Reconciliation cycles by kind and outcome",
                &["kind", "outcome"]
            )
            .expect("Failed to register cycles_total"),

            cycle_duration_seconds: register_histogram!(
                "fleet_agent_cycle_duration_seconds",
                "Wall time of a reconciliation cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            last_scanned: register_int_gauge!(
                "fleet_agent_last_cycle_scanned",
                "Containers scanned by the last cycle"
            )
            .expect("Failed to register last_cycle_scanned"),

            last_updated: register_int_gauge!(
                "fleet_agent_last_cycle_updated",
                "Containers updated by the last cycle"
            )
            .expect("Failed to register last_cycle_updated"),

            last_failed: register_int_gauge!(
                "fleet_agent_last_cycle_failed",
                "Containers that failed in the last cycle"
            )
            .expect("Failed to register last_cycle_failed"),

            stale_containers: register_int_gauge!(
                "fleet_agent_stale_containers",
                "Containers found stale by the last cycle"
            )
            .expect("Failed to register stale_containers"),

            busy_rejections: register_int_counter!(
                "fleet_agent_busy_rejections_total",
                "Cycle requests rejected because another cycle was running"
            )
            .expect("Failed to register busy_rejections_total"),

            active_subscriptions: register_int_gauge!(
                "fleet_agent_active_subscriptions",
                "Open log and telemetry subscriptions"
            )
            .expect("Failed to register active_subscriptions"),
        }
    }
}

/// Outcome label for the cycle counter
pub fn cycle_outcome(result: &CycleResult) -> &'static str {
    if result.is_fault() {
        "aborted"
    } else if result.failed > 0 {
        "partial"
    } else {
        "ok"
    }
}

/// Fleet metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance. Clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct FleetMetrics {
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FleetMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record the outcome of a finished cycle
    pub fn observe_cycle(&self, result: &CycleResult) {
        let inner = self.inner();
        inner
            .cycles_total
            .with_label_values(&[&result.kind.to_string(), cycle_outcome(result)])
            .inc();
        inner.cycle_duration_seconds.observe(result.duration_secs());
        inner.last_scanned.set(result.scanned as i64);
        inner.last_updated.set(result.updated as i64);
        inner.last_failed.set(result.failed as i64);
        inner.stale_containers.set(result.stale.len() as i64);
    }

    pub fn inc_busy_rejections(&self) {
        self.inner().busy_rejections.inc();
    }

    pub fn set_active_subscriptions(&self, count: i64) {
        self.inner().active_subscriptions.set(count);
    }

    pub fn busy_rejections(&self) -> u64 {
        self.inner().busy_rejections.get()
    }
}

impl CycleObserver for FleetMetrics {
    fn on_cycle_complete(&self, result: &CycleResult) {
        self.observe_cycle(result);
    }
}

/// Structured logger for agent events
///
/// Emits one record per significant event with a stable `event` field so
/// the JSON output can be filtered downstream.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, docker_host: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            docker_host = %docker_host,
            "Fleet agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Fleet agent shutting down"
        );
    }

    /// Summary record for every finished cycle
    pub fn log_session(&self, result: &CycleResult) {
        if result.is_fault() {
            warn!(
                event = "session_done",
                node = %self.node_name,
                kind = %result.kind,
                fault = ?result.fault,
                duration_secs = result.duration_secs(),
                "Session aborted"
            );
            return;
        }
        info!(
            event = "session_done",
            node = %self.node_name,
            kind = %result.kind,
            scanned = result.scanned,
            updated = result.updated,
            failed = result.failed,
            skipped = result.skipped,
            stale = result.stale.len(),
            duration_secs = result.duration_secs(),
            "Session done"
        );
    }

    pub fn log_container_updated(&self, container: &str, kind: CycleKind) {
        info!(
            event = "container_updated",
            node = %self.node_name,
            container = %container,
            kind = %kind,
            "Container updated"
        );
    }

    pub fn log_rollback(&self, container: &str, detail: Option<&str>) {
        warn!(
            event = "container_rolled_back",
            node = %self.node_name,
            container = %container,
            detail = ?detail,
            "Container rolled back to its previous image"
        );
    }

    pub fn log_subscription_opened(&self, id: u64, target: &str) {
        info!(
            event = "subscription_opened",
            node = %self.node_name,
            subscription = id,
            target = %target,
            "Subscription opened"
        );
    }

    pub fn log_subscription_closed(&self, id: u64, target: &str, reason: &str) {
        info!(
            event = "subscription_closed",
            node = %self.node_name,
            subscription = id,
            target = %target,
            reason = %reason,
            "Subscription closed"
        );
    }
}

impl CycleObserver for StructuredLogger {
    fn on_cycle_complete(&self, result: &CycleResult) {
        // The step that completes an update: start for update cycles, pull for downloads
        let completing = match result.kind {
            CycleKind::Update => Action::Start,
            CycleKind::Download => Action::Pull,
        };
        for step in result.steps.iter().filter(|s| s.ok) {
            if step.action == Action::Rollback {
                self.log_rollback(&step.container, step.detail.as_deref());
            } else if step.action == completing && result.stale.contains(&step.container) {
                self.log_container_updated(&step.container, result.kind);
            }
        }
        self.log_session(result);
    }
}
