//! HTTP API: health, metrics, cycle triggers, container views and
//! controls, device reports and WebSocket subscriptions

use crate::ws;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleet_agent_lib::{
    device::DeviceInspector,
    health::{ComponentStatus, HealthRegistry},
    models::{ContainerFilter, ContainerRecord, ContainerView, CycleResult},
    observability::FleetMetrics,
    reconcile::{CycleRequest, ReconciliationEngine},
    runtime::RuntimeGateway,
    service::{compile, RawServiceSpec, ServiceSpec},
    ControlError, StreamBroadcaster, SubscriptionTarget,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub engine: ReconciliationEngine,
    pub broadcaster: StreamBroadcaster,
    pub runtime: Arc<dyn RuntimeGateway>,
    pub device: Arc<DeviceInspector>,
    pub metrics: Option<FleetMetrics>,
    /// Host name compiled services resolve to the loopback address
    pub host_entry: Option<String>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        engine: ReconciliationEngine,
        broadcaster: StreamBroadcaster,
        runtime: Arc<dyn RuntimeGateway>,
    ) -> Self {
        let device = Arc::new(DeviceInspector::new("unknown", "/", runtime.clone()));
        Self {
            health_registry,
            engine,
            broadcaster,
            runtime,
            device,
            metrics: None,
            host_entry: None,
        }
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_device(mut self, device: DeviceInspector) -> Self {
        self.device = Arc::new(device);
        self
    }

    pub fn with_host_entry(mut self, hostname: impl Into<String>) -> Self {
        self.host_entry = Some(hostname.into());
        self
    }

    fn record_busy(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.inc_busy_rejections();
        }
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Comma separated selectors for a cycle
#[derive(Debug, Default, Deserialize)]
pub struct CycleQuery {
    pub images: Option<String>,
    pub names: Option<String>,
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl CycleQuery {
    pub fn filter(&self) -> ContainerFilter {
        ContainerFilter {
            names: split_list(self.names.as_deref()),
            images: split_list(self.images.as_deref()),
            exclude: Vec::new(),
        }
    }
}

async fn run_cycle(state: &AppState, request: CycleRequest) -> Response {
    match state.engine.run_cycle(request).await {
        Ok(result) => cycle_response(result),
        Err(busy) => {
            state.record_busy();
            error_body(StatusCode::CONFLICT, busy.to_string())
        }
    }
}

fn cycle_response(result: CycleResult) -> Response {
    let status = if result.is_fault() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(result)).into_response()
}

async fn update(State(state): State<Arc<AppState>>, Query(query): Query<CycleQuery>) -> Response {
    info!(images = ?query.images, names = ?query.names, "Update requested");
    run_cycle(&state, CycleRequest::update().with_filter(query.filter())).await
}

async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CycleQuery>,
) -> Response {
    info!(images = ?query.images, "Download requested");
    run_cycle(&state, CycleRequest::download().with_filter(query.filter())).await
}

async fn containers(State(state): State<Arc<AppState>>) -> Response {
    let filter = ContainerFilter::default();
    match state.engine.list_containers(&filter).await {
        Ok(records) => {
            let views: Vec<ContainerView> = records.iter().map(ContainerView::from_record).collect();
            Json(views).into_response()
        }
        Err(e) => error_body(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn container(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.runtime.inspect(&name).await {
        Ok(record) => Json(ContainerView::from_record(&record)).into_response(),
        Err(e) if e.is_not_found() => {
            error_body(StatusCode::NOT_FOUND, format!("container not found: {name}"))
        }
        Err(e) => error_body(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

fn control_response(state: &AppState, result: Result<ContainerRecord, ControlError>) -> Response {
    match result {
        Ok(record) => Json(ContainerView::from_record(&record)).into_response(),
        Err(ControlError::Busy(busy)) => {
            state.record_busy();
            error_body(StatusCode::CONFLICT, busy.to_string())
        }
        Err(ControlError::Runtime(e)) if e.is_not_found() => {
            error_body(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e @ ControlError::SelfContainer(_)) => error_body(StatusCode::FORBIDDEN, e.to_string()),
        Err(e) => error_body(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn start_container(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    info!(container = %name, "Start requested");
    let result = state.engine.start_container(&name).await;
    control_response(&state, result)
}

async fn stop_container(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    info!(container = %name, "Stop requested");
    let result = state.engine.stop_container(&name).await;
    control_response(&state, result)
}

async fn device_info(State(state): State<Arc<AppState>>) -> Response {
    Json(state.device.info().await).into_response()
}

async fn hardware_status(State(state): State<Arc<AppState>>) -> Response {
    match state.device.hardware_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// A compose-style service entry to compile
#[derive(Debug, Deserialize)]
pub struct CompileRequest {
    pub name: String,
    pub service: RawServiceSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompileResponse {
    pub spec: ServiceSpec,
    pub directive: fleet_agent_lib::CreateDirective,
    pub fingerprint: String,
}

async fn compile_service(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompileRequest>,
) -> Response {
    match ServiceSpec::from_raw(&request.name, request.service) {
        Ok(spec) => {
            let spec = match &state.host_entry {
                Some(hostname) => spec.with_host_entry(hostname),
                None => spec,
            };
            let directive = compile(&spec);
            let fingerprint = directive.fingerprint();
            Json(CompileResponse {
                spec,
                directive,
                fingerprint,
            })
            .into_response()
        }
        Err(e) => error_body(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
    }
}

fn subscribe_on_upgrade(
    state: Arc<AppState>,
    target: SubscriptionTarget,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let (sink, source) = ws::split(socket);
        match state
            .broadcaster
            .subscribe(target.clone(), Box::new(sink), Box::new(source))
            .await
        {
            Ok(handle) => {
                let reason = handle.join().await;
                info!(target = %target, reason = %reason, "WebSocket subscription finished");
            }
            Err(e) => warn!(target = %target, error = %e, "Failed to open subscription"),
        }
    })
}

/// Unknown containers get a 404 before the upgrade is attempted
async fn container_logs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match state.runtime.inspect(&name).await {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            return error_body(StatusCode::NOT_FOUND, format!("container not found: {name}"))
        }
        Err(e) => return error_body(StatusCode::BAD_GATEWAY, e.to_string()),
    }
    match upgrade {
        Ok(upgrade) => {
            subscribe_on_upgrade(state, SubscriptionTarget::ContainerLogs { name }, upgrade)
        }
        Err(rejection) => rejection.into_response(),
    }
}

async fn telemetry(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    subscribe_on_upgrade(state, SubscriptionTarget::Telemetry, upgrade)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/update", post(update))
        .route("/v1/download", post(download))
        .route("/v1/containers", get(containers))
        .route("/v1/containers/:name", get(container))
        .route("/v1/containers/:name/start", post(start_container))
        .route("/v1/containers/:name/stop", post(stop_container))
        .route("/v1/compile", post(compile_service))
        .route("/v1/device/info", get(device_info))
        .route("/v1/device/hardware-status", get(hardware_status))
        .route("/v1/containers/:name/logs", get(container_logs))
        .route("/v1/telemetry", get(telemetry))
        .with_state(state)
}

/// Start the API server, stopping when `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
