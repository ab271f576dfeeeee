//! Periodic update cycles

use super::engine::{CycleRequest, ReconciliationEngine};
use crate::observability::FleetMetrics;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between scheduled cycles (default: 5 minutes)
    pub interval: Duration,
    /// Run a cycle immediately instead of waiting one interval
    pub update_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            update_on_startup: false,
        }
    }
}

/// Ticks the engine on a fixed interval.
///
/// Each tick starts a cycle on its own task so the loop keeps observing
/// shutdown. A tick that finds a cycle already running is dropped.
pub struct UpdateScheduler {
    engine: ReconciliationEngine,
    config: SchedulerConfig,
    metrics: Option<FleetMetrics>,
}

impl UpdateScheduler {
    pub fn new(engine: ReconciliationEngine, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            metrics: None,
        }
    }

    /// Count dropped ticks in the busy-rejection metric
    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            update_on_startup = self.config.update_on_startup,
            "Starting update scheduler"
        );

        let first = if self.config.update_on_startup {
            Instant::now()
        } else {
            Instant::now() + self.config.interval
        };
        let mut ticker = interval_at(first, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = shutdown.recv() => {
                    info!("Shutting down update scheduler");
                    break;
                }
            }
        }
    }

    fn tick(&self) {
        if self.engine.token().is_busy() {
            debug!("Update cycle already running, dropping tick");
            if let Some(metrics) = &self.metrics {
                metrics.inc_busy_rejections();
            }
            return;
        }

        let engine = self.engine.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            match engine.run_cycle(CycleRequest::update()).await {
                Ok(result) if result.is_fault() => {
                    warn!(fault = ?result.fault, "Scheduled update cycle aborted");
                }
                Ok(_) => {}
                Err(busy) => {
                    debug!(reason = %busy, "Dropping scheduled tick");
                    if let Some(metrics) = metrics {
                        metrics.inc_busy_rejections();
                    }
                }
            }
        });
    }
}
