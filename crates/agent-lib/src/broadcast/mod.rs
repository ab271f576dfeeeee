//! Live log and telemetry streaming to connected clients
//!
//! `StreamBroadcaster` owns a registry of subscriptions. Each subscription
//! reads from one upstream (a container's log stream or periodic host
//! telemetry), sanitises it and writes it to a client through the
//! transport-neutral `ClientSink`/`ClientSource` pair.

mod broadcaster;
mod connection;
mod lines;
mod sanitize;
mod telemetry;

#[cfg(test)]
mod tests;

pub use broadcaster::{
    BroadcastConfig, EndReason, StreamBroadcaster, StreamBroadcasterBuilder, SubscriptionHandle,
    SubscriptionId, SubscriptionTarget,
};
pub use connection::{ClientSink, ClientSource, InboundFrame, OutboundFrame};
pub use sanitize::{sanitize, sanitize_str};
pub use telemetry::{HardwareStatus, ProcTelemetry, TelemetrySource};
