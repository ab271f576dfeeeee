//! Fleet Agent - keeps containers on their latest images
//!
//! This binary runs next to the container engine on each host, polling
//! registries on a schedule, recreating stale containers and streaming
//! logs and telemetry to connected clients.

use anyhow::{Context, Result};
use fleet_agent::{api, config};
use fleet_agent_lib::{
    broadcast::ProcTelemetry,
    device::DeviceInspector,
    health::{components, HealthObserver, HealthRegistry},
    observability::{FleetMetrics, StructuredLogger},
    reconcile::{ExecutionToken, ReconciliationEngine, UpdateScheduler},
    runtime::{DockerEngine, RegistryLookup, RuntimeGateway},
    StreamBroadcaster,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleet-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        docker_host = config.docker_host.as_deref().unwrap_or("local socket"),
        poll_interval_secs = config.poll_interval_secs,
        monitor_only = config.monitor_only,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register(components::RUNTIME).await;
    health_registry.register(components::SCHEDULER).await;
    health_registry.register(components::BROADCASTER).await;

    let metrics = FleetMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(
        AGENT_VERSION,
        config.docker_host.as_deref().unwrap_or("local socket"),
    );

    let docker = Arc::new(DockerEngine::connect(config.docker_host.as_deref())?);
    match docker.ping().await {
        Ok(version) => info!(engine_version = %version, "Connected to container engine"),
        Err(e) => {
            warn!(error = %e, "Container engine not reachable yet");
            health_registry
                .set_degraded(components::RUNTIME, format!("engine not reachable: {e}"))
                .await;
        }
    }
    let runtime: Arc<dyn RuntimeGateway> = docker.clone();
    let registry: Arc<dyn RegistryLookup> = docker;

    // The token outlives the engine so shutdown can wait on it
    let token = ExecutionToken::new();
    let engine = ReconciliationEngine::builder(runtime.clone(), registry)
        .token(token.clone())
        .config(config.engine_config())
        .observer(Arc::new(metrics.clone()))
        .observer(Arc::new(logger.clone()))
        .observer(Arc::new(HealthObserver::new(health_registry.clone())))
        .build();

    let broadcaster = StreamBroadcaster::builder(
        runtime.clone(),
        Arc::new(ProcTelemetry::with_root(&config.proc_root)),
    )
    .config(config.broadcast_config())
    .metrics(metrics.clone())
    .logger(logger.clone())
    .build();

    let app_state = Arc::new(
        api::AppState::new(
            health_registry.clone(),
            engine.clone(),
            broadcaster.clone(),
            runtime.clone(),
        )
        .with_metrics(metrics.clone())
        .with_device(DeviceInspector::new(
            &config.node_name,
            &config.proc_root,
            runtime,
        ))
        .with_host_entry(&config.node_name),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let scheduler = UpdateScheduler::new(engine, config.scheduler_config()).with_metrics(metrics);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    if !broadcaster.shutdown().await {
        warn!("Some subscriptions were still open at shutdown");
    }
    if token.is_busy() {
        info!("Waiting for the running update cycle to finish");
    }
    token.wait_idle().await;

    if let Err(e) = scheduler_handle.await {
        warn!(error = %e, "Scheduler task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    Ok(())
}
