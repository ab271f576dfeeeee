//! Agent library for keeping a fleet of containers on their latest images
//!
//! This crate provides the core functionality for:
//! - Compiling declarative service descriptions into engine parameters
//! - Reconciling running containers against their registry
//! - Streaming container logs and host telemetry to clients
//! - Reporting device identity and connectivity
//! - Health checks and observability

pub mod broadcast;
pub mod device;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod reconcile;
pub mod runtime;
pub mod service;

pub use broadcast::{BroadcastConfig, EndReason, StreamBroadcaster, SubscriptionTarget};
pub use device::{ConnectionStatus, DeviceInfo, DeviceInspector};
pub use error::{
    CompileError, ControlError, LockBusyError, PlanError, RegistryError, RuntimeError, SubscriptionError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthObserver, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{FleetMetrics, StructuredLogger};
pub use reconcile::{
    CycleObserver, CycleRequest, EngineConfig, ExecutionToken, ReconciliationEngine,
    SchedulerConfig, UpdateScheduler,
};
pub use runtime::{DockerEngine, RegistryLookup, RuntimeGateway};
pub use service::{compile, CreateDirective, ServiceSpec};
