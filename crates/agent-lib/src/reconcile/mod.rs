//! Reconciliation of running containers against their registry
//!
//! A cycle scans containers through the runtime gateway, asks the registry
//! which ones are stale, orders the work along `depends_on` edges and then
//! stops, recreates and starts containers one step at a time, rolling back
//! a container whose replacement fails.

mod engine;
mod plan;
mod scheduler;
mod token;

#[cfg(test)]
mod tests;

pub use engine::{
    CycleObserver, CyclePhase, CycleRequest, EngineConfig, ReconciliationEngine,
    ReconciliationEngineBuilder,
};
pub use plan::{build_plan, topo_sort, Assessment, PlanOptions, PlanStep, UpdatePlan};
pub use scheduler::{SchedulerConfig, UpdateScheduler};
pub use token::{ExecutionGuard, ExecutionToken};
