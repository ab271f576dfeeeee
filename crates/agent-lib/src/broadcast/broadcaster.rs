use super::connection::{ClientSink, ClientSource, InboundFrame, OutboundFrame};
use super::lines::LineSplitter;
use super::telemetry::TelemetrySource;
use crate::error::SubscriptionError;
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::runtime::{LogStream, RuntimeGateway};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type SubscriptionId = u64;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// How often queued messages are flushed to the client
    pub write_tick: Duration,
    pub ping_interval: Duration,
    /// A client that sends no pong within this window is dropped
    pub liveness_window: Duration,
    /// Messages buffered per subscription before the producer waits
    pub queue_capacity: usize,
    /// Lines of history sent before following
    pub log_tail: String,
    /// Longest log line sent as one message; longer output is split
    pub max_line_bytes: usize,
    pub telemetry_interval: Duration,
    /// Upper bound on `shutdown` waiting for subscriptions to drain
    pub shutdown_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            write_tick: Duration::from_millis(100),
            ping_interval: Duration::from_secs(1),
            liveness_window: Duration::from_secs(10),
            queue_capacity: 256,
            log_tail: "20".to_string(),
            max_line_bytes: 16 * 1024,
            telemetry_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// What a subscription streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionTarget {
    ContainerLogs { name: String },
    Telemetry,
}

impl fmt::Display for SubscriptionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionTarget::ContainerLogs { name } => write!(f, "logs:{name}"),
            SubscriptionTarget::Telemetry => f.write_str("telemetry"),
        }
    }
}

/// Why a subscription ended. The first recorded reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ContainerGone,
    StreamEnded,
    ClientClosed,
    LivenessTimeout,
    WriteFailed,
    ReadFailed,
    /// Ended through `StreamBroadcaster::close`
    Closed,
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EndReason::ContainerGone => "container gone",
            EndReason::StreamEnded => "stream ended",
            EndReason::ClientClosed => "client closed",
            EndReason::LivenessTimeout => "liveness timeout",
            EndReason::WriteFailed => "write failed",
            EndReason::ReadFailed => "read failed",
            EndReason::Closed => "closed by server",
            EndReason::Shutdown => "server shutting down",
        };
        f.write_str(text)
    }
}

struct Entry {
    target: SubscriptionTarget,
    cancel: CancellationToken,
    ended: Arc<OnceLock<EndReason>>,
}

struct BroadcasterInner {
    runtime: Arc<dyn RuntimeGateway>,
    telemetry: Arc<dyn TelemetrySource>,
    config: BroadcastConfig,
    registry: Mutex<HashMap<SubscriptionId, Entry>>,
    next_id: AtomicU64,
    root: CancellationToken,
    emptied: Notify,
    metrics: Option<FleetMetrics>,
    logger: Option<StructuredLogger>,
}

impl BroadcasterInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Entry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct StreamBroadcasterBuilder {
    runtime: Arc<dyn RuntimeGateway>,
    telemetry: Arc<dyn TelemetrySource>,
    config: BroadcastConfig,
    metrics: Option<FleetMetrics>,
    logger: Option<StructuredLogger>,
}

impl StreamBroadcasterBuilder {
    pub fn config(mut self, config: BroadcastConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> StreamBroadcaster {
        StreamBroadcaster {
            inner: Arc::new(BroadcasterInner {
                runtime: self.runtime,
                telemetry: self.telemetry,
                config: self.config,
                registry: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                root: CancellationToken::new(),
                emptied: Notify::new(),
                metrics: self.metrics,
                logger: self.logger,
            }),
        }
    }
}

/// Fans container logs and host telemetry out to connected clients.
///
/// Each subscription runs three tasks: a producer filling a bounded queue,
/// a writer draining it to the client on a fixed tick and sending pings,
/// and a reader watching for pongs. All three share one cancellation token,
/// a child of the broadcaster's root token.
#[derive(Clone)]
pub struct StreamBroadcaster {
    inner: Arc<BroadcasterInner>,
}

enum Upstream {
    Logs { container: String, stream: LogStream },
    Telemetry,
}

impl StreamBroadcaster {
    pub fn builder(
        runtime: Arc<dyn RuntimeGateway>,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> StreamBroadcasterBuilder {
        StreamBroadcasterBuilder {
            runtime,
            telemetry,
            config: BroadcastConfig::default(),
            metrics: None,
            logger: None,
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    /// Open a subscription and start streaming to `sink`
    pub async fn subscribe(
        &self,
        target: SubscriptionTarget,
        sink: Box<dyn ClientSink>,
        source: Box<dyn ClientSource>,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        if self.inner.root.is_cancelled() {
            return Err(SubscriptionError::ShuttingDown);
        }

        let upstream = self.open_upstream(&target).await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.root.child_token();
        let ended = Arc::new(OnceLock::new());
        let active = {
            let mut registry = self.inner.registry();
            registry.insert(
                id,
                Entry {
                    target: target.clone(),
                    cancel: cancel.clone(),
                    ended: ended.clone(),
                },
            );
            registry.len()
        };
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_active_subscriptions(active as i64);
        }
        match &self.inner.logger {
            Some(logger) => logger.log_subscription_opened(id, &target.to_string()),
            None => debug!(subscription = id, target = %target, "Subscription opened"),
        }

        let ctx = Arc::new(SubscriptionContext {
            id,
            target,
            cancel,
            ended,
            inner: self.inner.clone(),
        });
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));

        let producer = match upstream {
            Upstream::Logs { container, stream } => {
                tokio::spawn(produce_logs(ctx.clone(), container, stream, tx))
            }
            Upstream::Telemetry => tokio::spawn(produce_telemetry(ctx.clone(), tx)),
        };
        let writer = tokio::spawn(write_loop(ctx.clone(), sink, rx));
        let reader = tokio::spawn(read_loop(ctx.clone(), source));

        Ok(SubscriptionHandle {
            id,
            ctx,
            tasks: vec![producer, writer, reader],
        })
    }

    async fn open_upstream(&self, target: &SubscriptionTarget) -> Result<Upstream, SubscriptionError> {
        let name = match target {
            SubscriptionTarget::Telemetry => return Ok(Upstream::Telemetry),
            SubscriptionTarget::ContainerLogs { name } => name,
        };
        let not_found = |e: crate::error::RuntimeError| {
            if e.is_not_found() {
                SubscriptionError::ContainerNotFound(name.clone())
            } else {
                SubscriptionError::Runtime(e)
            }
        };
        let record = self.inner.runtime.inspect(name).await.map_err(not_found)?;
        let stream = self
            .inner
            .runtime
            .stream_logs(&record.id, true, &self.inner.config.log_tail)
            .await
            .map_err(not_found)?;
        Ok(Upstream::Logs {
            container: record.id,
            stream,
        })
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn is_active(&self, id: SubscriptionId) -> bool {
        self.inner.registry().contains_key(&id)
    }

    /// Open subscriptions and what they stream
    pub fn subscriptions(&self) -> Vec<(SubscriptionId, SubscriptionTarget)> {
        let mut subs: Vec<_> = self
            .inner
            .registry()
            .iter()
            .map(|(id, entry)| (*id, entry.target.clone()))
            .collect();
        subs.sort_by_key(|(id, _)| *id);
        subs
    }

    /// End one subscription from the server side
    pub fn close(&self, id: SubscriptionId) -> bool {
        match self.inner.registry().get(&id) {
            Some(entry) => {
                let _ = entry.ended.set(EndReason::Closed);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every subscription and wait until all have cleaned up.
    ///
    /// Returns false if the registry did not drain within `shutdown_timeout`.
    pub async fn shutdown(&self) -> bool {
        info!(active = self.active_count(), "Shutting down stream broadcaster");
        self.inner.root.cancel();

        let drained = async {
            loop {
                let notified = self.inner.emptied.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        match timeout(self.inner.config.shutdown_timeout, drained).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.active_count(),
                    "Subscriptions did not drain before the shutdown timeout"
                );
                false
            }
        }
    }
}

/// Returned by `subscribe`; await `join` to learn why the stream ended
pub struct SubscriptionHandle {
    id: SubscriptionId,
    ctx: Arc<SubscriptionContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Reason recorded so far, if the subscription has ended
    pub fn end_reason(&self) -> Option<EndReason> {
        self.ctx.ended.get().copied()
    }

    /// Wait for all three tasks to finish
    pub async fn join(self) -> EndReason {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(subscription = self.id, error = %e, "Subscription task failed");
            }
        }
        self.ctx.reason_or(EndReason::Shutdown)
    }
}

struct SubscriptionContext {
    id: SubscriptionId,
    target: SubscriptionTarget,
    cancel: CancellationToken,
    ended: Arc<OnceLock<EndReason>>,
    inner: Arc<BroadcasterInner>,
}

impl SubscriptionContext {
    fn finish(&self, reason: EndReason) {
        let _ = self.ended.set(reason);
    }

    fn reason_or(&self, fallback: EndReason) -> EndReason {
        *self.ended.get_or_init(|| fallback)
    }

    /// Tear down the subscription. Only the first caller does any work.
    fn cleanup(&self, reason: EndReason) {
        self.finish(reason);
        self.cancel.cancel();

        let remaining = {
            let mut registry = self.inner.registry();
            if registry.remove(&self.id).is_none() {
                return;
            }
            registry.len()
        };

        let reason = self.reason_or(reason);
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_active_subscriptions(remaining as i64);
        }
        match &self.inner.logger {
            Some(logger) => {
                logger.log_subscription_closed(self.id, &self.target.to_string(), &reason.to_string())
            }
            None => debug!(subscription = self.id, reason = %reason, "Subscription closed"),
        }
        if remaining == 0 {
            self.inner.emptied.notify_waiters();
        }
    }

    /// Queue a message, waiting while the queue is full. False once the
    /// subscription is over.
    async fn push(&self, tx: &mpsc::Sender<String>, message: String) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = tx.send(message) => sent.is_ok(),
        }
    }
}

async fn produce_logs(
    ctx: Arc<SubscriptionContext>,
    container: String,
    mut stream: LogStream,
    tx: mpsc::Sender<String>,
) {
    let mut lines = LineSplitter::new(ctx.inner.config.max_line_bytes);
    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for line in lines.push(&bytes) {
                    if !ctx.push(&tx, line).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                warn!(subscription = ctx.id, error = %e, "Log stream failed");
                break;
            }
            None => break,
        }
    }

    if let Some(rest) = lines.finish() {
        if !ctx.push(&tx, rest).await {
            return;
        }
    }

    let reason = match ctx.inner.runtime.inspect(&container).await {
        Err(e) if e.is_not_found() => EndReason::ContainerGone,
        _ => EndReason::StreamEnded,
    };
    debug!(subscription = ctx.id, reason = %reason, "Upstream ended");
    ctx.finish(reason);
    // Dropping the sender closes the queue; the writer sends the close frame
}

async fn produce_telemetry(ctx: Arc<SubscriptionContext>, tx: mpsc::Sender<String>) {
    let mut ticker = interval(ctx.inner.config.telemetry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let status = match ctx.inner.telemetry.sample().await {
            Ok(status) => status,
            Err(e) => {
                warn!(subscription = ctx.id, error = %e, "Telemetry sample failed");
                continue;
            }
        };
        match serde_json::to_string(&status) {
            Ok(json) => {
                if !ctx.push(&tx, json).await {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode telemetry sample"),
        }
    }
}

enum WriteOutcome {
    Sent,
    Failed,
    Cancelled,
}

async fn send_frame(
    ctx: &SubscriptionContext,
    sink: &mut Box<dyn ClientSink>,
    frame: OutboundFrame,
) -> WriteOutcome {
    tokio::select! {
        _ = ctx.cancel.cancelled() => WriteOutcome::Cancelled,
        sent = sink.send(frame) => match sent {
            Ok(()) => WriteOutcome::Sent,
            Err(e) => {
                debug!(subscription = ctx.id, error = %e, "Client write failed");
                WriteOutcome::Failed
            }
        },
    }
}

/// Best-effort close frame, bounded by one ping interval
async fn send_close(ctx: &SubscriptionContext, sink: &mut Box<dyn ClientSink>, reason: EndReason) {
    let frame = OutboundFrame::Close(Some(reason.to_string()));
    match timeout(ctx.inner.config.ping_interval, sink.send(frame)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(subscription = ctx.id, error = %e, "Close frame not delivered"),
        Err(_) => debug!(subscription = ctx.id, "Close frame timed out"),
    }
}

async fn write_loop(
    ctx: Arc<SubscriptionContext>,
    mut sink: Box<dyn ClientSink>,
    mut rx: mpsc::Receiver<String>,
) {
    let config = &ctx.inner.config;
    let mut flush = interval(config.write_tick);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancel.cancelled() => {
                let reason = ctx.reason_or(EndReason::Shutdown);
                send_close(&ctx, &mut sink, reason).await;
                ctx.cleanup(reason);
                return;
            }
            _ = flush.tick() => {
                loop {
                    match rx.try_recv() {
                        Ok(message) => {
                            match send_frame(&ctx, &mut sink, OutboundFrame::Text(message)).await {
                                WriteOutcome::Sent => {}
                                WriteOutcome::Failed => {
                                    ctx.cleanup(EndReason::WriteFailed);
                                    return;
                                }
                                // Handled by the cancellation arm
                                WriteOutcome::Cancelled => break,
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            let reason = ctx.reason_or(EndReason::StreamEnded);
                            send_close(&ctx, &mut sink, reason).await;
                            ctx.cleanup(reason);
                            return;
                        }
                    }
                }
            }
            _ = ping.tick() => {
                if let WriteOutcome::Failed =
                    send_frame(&ctx, &mut sink, OutboundFrame::Ping(Vec::new())).await
                {
                    ctx.cleanup(EndReason::WriteFailed);
                    return;
                }
            }
        }
    }
}

async fn read_loop(ctx: Arc<SubscriptionContext>, mut source: Box<dyn ClientSource>) {
    let window = ctx.inner.config.liveness_window;
    let mut deadline = Instant::now() + window;

    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            frame = timeout_at(deadline, source.recv()) => frame,
        };
        match frame {
            Err(_) => {
                debug!(subscription = ctx.id, "No pong within the liveness window");
                ctx.cleanup(EndReason::LivenessTimeout);
                return;
            }
            Ok(None) | Ok(Some(Ok(InboundFrame::Close))) => {
                ctx.cleanup(EndReason::ClientClosed);
                return;
            }
            Ok(Some(Err(e))) => {
                debug!(subscription = ctx.id, error = %e, "Client read failed");
                ctx.cleanup(EndReason::ReadFailed);
                return;
            }
            Ok(Some(Ok(InboundFrame::Pong(_)))) => deadline = Instant::now() + window,
            Ok(Some(Ok(_))) => {}
        }
    }
}
