use super::*;
use crate::error::SubscriptionError;
use crate::runtime::{MemoryContainer, MemoryRuntime};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

struct ChannelSink {
    frames: mpsc::UnboundedSender<OutboundFrame>,
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl ClientSink for ChannelSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), SubscriptionError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| SubscriptionError::Send(e.to_string()))?
                .forget();
        }
        self.frames
            .send(frame)
            .map_err(|_| SubscriptionError::Send("client gone".into()))
    }
}

struct ChannelSource {
    replies: mpsc::UnboundedReceiver<Result<InboundFrame, SubscriptionError>>,
}

#[async_trait]
impl ClientSource for ChannelSource {
    async fn recv(&mut self) -> Option<Result<InboundFrame, SubscriptionError>> {
        self.replies.recv().await
    }
}

/// The far end of a subscription as a test sees it
struct TestClient {
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    replies: mpsc::UnboundedSender<Result<InboundFrame, SubscriptionError>>,
}

impl TestClient {
    async fn next_frame(&mut self) -> Option<OutboundFrame> {
        tokio::time::timeout(Duration::from_secs(60), self.frames.recv())
            .await
            .ok()
            .flatten()
    }

    /// Text frames until the close frame, ignoring pings
    async fn texts_until_close(&mut self) -> (Vec<String>, Option<String>) {
        let mut texts = Vec::new();
        while let Some(frame) = self.next_frame().await {
            match frame {
                OutboundFrame::Text(text) => texts.push(text),
                OutboundFrame::Ping(_) => {}
                OutboundFrame::Close(reason) => return (texts, reason),
            }
        }
        (texts, None)
    }

    /// Answer every ping on a background task
    fn spawn_ponger(mut self) -> tokio::task::JoinHandle<Vec<OutboundFrame>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = self.frames.recv().await {
                if let OutboundFrame::Ping(payload) = &frame {
                    let _ = self.replies.send(Ok(InboundFrame::Pong(payload.clone())));
                }
                let closed = matches!(frame, OutboundFrame::Close(_));
                seen.push(frame);
                if closed {
                    break;
                }
            }
            seen
        })
    }
}

fn client_with_gate(
    gate: Option<Arc<Semaphore>>,
) -> (Box<dyn ClientSink>, Box<dyn ClientSource>, TestClient) {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    (
        Box::new(ChannelSink {
            frames: frame_tx,
            gate,
        }),
        Box::new(ChannelSource { replies: reply_rx }),
        TestClient {
            frames: frame_rx,
            replies: reply_tx,
        },
    )
}

fn client() -> (Box<dyn ClientSink>, Box<dyn ClientSource>, TestClient) {
    client_with_gate(None)
}

struct FixedTelemetry;

#[async_trait]
impl TelemetrySource for FixedTelemetry {
    async fn sample(&self) -> anyhow::Result<HardwareStatus> {
        Ok(HardwareStatus {
            cpu_percent: Some(12.5),
            ram_percent: Some(40.0),
            temperature_celsius: None,
            uptime_secs: Some(90.0),
            sampled_at: Utc::now(),
        })
    }
}

fn broadcaster(runtime: &MemoryRuntime, config: BroadcastConfig) -> StreamBroadcaster {
    StreamBroadcaster::builder(Arc::new(runtime.clone()), Arc::new(FixedTelemetry))
        .config(config)
        .build()
}

fn runtime_with_web() -> MemoryRuntime {
    let runtime = MemoryRuntime::new();
    runtime.add_container(MemoryContainer::new("web", "nginx:1.25"));
    runtime
}

fn logs(name: &str) -> SubscriptionTarget {
    SubscriptionTarget::ContainerLogs {
        name: name.to_string(),
    }
}

mod stream_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lines_are_sanitised_and_split() {
        let runtime = runtime_with_web();
        runtime.set_logs("web", vec![&b"hello \x1b[0mworld\npart"[..], &b"ial\n\n\xffdone"[..]]);
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, mut client) = client();
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();

        let (texts, close) = client.texts_until_close().await;
        assert_eq!(texts, vec!["hello [0mworld", "partial", "done"]);
        assert_eq!(close.as_deref(), Some("stream ended"));
        assert_eq!(handle.join().await, EndReason::StreamEnded);
        assert_eq!(broadcaster.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_output_is_delivered_while_streaming() {
        let runtime = runtime_with_web();
        let feed = runtime.open_log_feed("web");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, mut client) = client();
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();

        // 1 KiB progress updates that never contain '\n'
        for step in 0..8 {
            let mut chunk = format!("step {step} ").into_bytes();
            chunk.resize(1023, b'#');
            chunk.push(b'\r');
            feed.send(chunk).unwrap();
        }

        let mut texts = Vec::new();
        while texts.len() < 8 {
            match client.next_frame().await {
                Some(OutboundFrame::Text(text)) => texts.push(text),
                Some(OutboundFrame::Ping(_)) => {}
                other => panic!("stream ended early: {other:?}"),
            }
        }
        assert!(texts[0].starts_with("step 0 "));
        assert!(texts.iter().all(|t| t.len() == 1023));
        assert!(broadcaster.is_active(handle.id()));

        drop(feed);
        let (_, close) = client.texts_until_close().await;
        assert_eq!(close.as_deref(), Some("stream ended"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unterminated_output_is_split_at_line_limit() {
        let runtime = runtime_with_web();
        let feed = runtime.open_log_feed("web");
        let config = BroadcastConfig {
            max_line_bytes: 4096,
            ..Default::default()
        };
        let broadcaster = broadcaster(&runtime, config);

        let (sink, source, mut client) = client();
        let _handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();

        for _ in 0..64 {
            feed.send(vec![b'x'; 1024]).unwrap();
        }

        let mut received = 0;
        while received < 64 * 1024 {
            match client.next_frame().await {
                Some(OutboundFrame::Text(text)) => {
                    assert_eq!(text.len(), 4096);
                    received += text.len();
                }
                Some(OutboundFrame::Ping(_)) => {}
                other => panic!("stream ended early: {other:?}"),
            }
        }
        drop(feed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_container_gone_closes_stream() {
        let runtime = runtime_with_web();
        let feed = runtime.open_log_feed("web");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, mut client) = client();
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();

        feed.send(b"last words\n".to_vec()).unwrap();
        runtime.delete_container("web");
        drop(feed);

        let (texts, close) = client.texts_until_close().await;
        assert_eq!(texts, vec!["last words"]);
        assert_eq!(close.as_deref(), Some("container gone"));
        assert_eq!(handle.join().await, EndReason::ContainerGone);
    }

    #[tokio::test]
    async fn test_unknown_container_is_rejected() {
        let runtime = runtime_with_web();
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, _client) = client();
        let err = broadcaster
            .subscribe(logs("missing"), sink, source)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SubscriptionError::ContainerNotFound(name) if name == "missing"));
        assert_eq!(broadcaster.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_samples_are_json() {
        let runtime = MemoryRuntime::new();
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, client) = client();
        let handle = broadcaster
            .subscribe(SubscriptionTarget::Telemetry, sink, source)
            .await
            .unwrap();
        let ponger = client.spawn_ponger();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(broadcaster.close(handle.id()));
        assert_eq!(handle.join().await, EndReason::Closed);

        let samples: Vec<serde_json::Value> = ponger
            .await
            .unwrap()
            .into_iter()
            .filter_map(|f| match f {
                OutboundFrame::Text(t) => serde_json::from_str(&t).ok(),
                _ => None,
            })
            .collect();
        // Ticks at 0s, 10s and 20s
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0]["cpu"], 12.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_suspends_producer_without_loss() {
        let runtime = runtime_with_web();
        let feed = runtime.open_log_feed("web");
        let config = BroadcastConfig {
            queue_capacity: 2,
            liveness_window: Duration::from_secs(3600),
            ..BroadcastConfig::default()
        };
        let broadcaster = broadcaster(&runtime, config);

        let gate = Arc::new(Semaphore::new(0));
        let (sink, source, mut client) = client_with_gate(Some(gate.clone()));
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();

        for i in 0..10 {
            feed.send(format!("line {i}\n").into_bytes()).unwrap();
        }
        drop(feed);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.end_reason().is_none());

        gate.add_permits(1000);
        let (texts, close) = client.texts_until_close().await;
        let expected: Vec<String> = (0..10).map(|i| format!("line {i}")).collect();
        assert_eq!(texts, expected);
        assert_eq!(close.as_deref(), Some("stream ended"));
        handle.join().await;
    }
}

mod liveness_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let runtime = runtime_with_web();
        let _feed = runtime.open_log_feed("web");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, mut client) = client();
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();

        let (_, close) = client.texts_until_close().await;
        assert_eq!(close.as_deref(), Some("liveness timeout"));
        assert_eq!(handle.join().await, EndReason::LivenessTimeout);
        assert_eq!(broadcaster.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_subscription_alive() {
        let runtime = runtime_with_web();
        let _feed = runtime.open_log_feed("web");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, client) = client();
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();
        let id = handle.id();
        let ponger = client.spawn_ponger();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(broadcaster.is_active(id));

        broadcaster.close(id);
        handle.join().await;
        let frames = ponger.await.unwrap();
        let pings = frames
            .iter()
            .filter(|f| matches!(f, OutboundFrame::Ping(_)))
            .count();
        assert!(pings >= 25, "expected a ping per second, saw {pings}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_close_frame_ends_subscription() {
        let runtime = runtime_with_web();
        let _feed = runtime.open_log_feed("web");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, client) = client();
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();
        client.replies.send(Ok(InboundFrame::Close)).unwrap();

        assert_eq!(handle.join().await, EndReason::ClientClosed);
        assert_eq!(broadcaster.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_ends_subscription() {
        let runtime = runtime_with_web();
        let _feed = runtime.open_log_feed("web");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, client) = client();
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();
        client
            .replies
            .send(Err(SubscriptionError::Receive("reset".into())))
            .unwrap();

        assert_eq!(handle.join().await, EndReason::ReadFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_ends_subscription() {
        let runtime = runtime_with_web();
        let _feed = runtime.open_log_feed("web");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink, source, client) = client();
        let handle = broadcaster.subscribe(logs("web"), sink, source).await.unwrap();
        // Keep the reader side open but stop accepting frames
        let TestClient { frames, replies } = client;
        drop(frames);

        assert_eq!(handle.join().await, EndReason::WriteFailed);
        drop(replies);
    }
}

mod registry_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_one_client_leaving_does_not_affect_another() {
        let runtime = runtime_with_web();
        runtime.add_container(MemoryContainer::new("db", "postgres:16"));
        let _web_feed = runtime.open_log_feed("web");
        let _db_feed = runtime.open_log_feed("db");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink_a, source_a, client_a) = client();
        let (sink_b, source_b, client_b) = client();
        let first = broadcaster.subscribe(logs("web"), sink_a, source_a).await.unwrap();
        let second = broadcaster.subscribe(logs("db"), sink_b, source_b).await.unwrap();
        assert_ne!(first.id(), second.id());
        let _ponger = client_b.spawn_ponger();

        drop(client_a);
        assert_eq!(first.join().await, EndReason::ClientClosed);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(broadcaster.is_active(second.id()));
        assert_eq!(broadcaster.active_count(), 1);
        assert_eq!(broadcaster.subscriptions()[0].1, logs("db"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_every_subscription() {
        let runtime = runtime_with_web();
        let _feed = runtime.open_log_feed("web");
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());

        let (sink_a, source_a, mut client_a) = client();
        let (sink_b, source_b, mut client_b) = client();
        let logs_handle = broadcaster.subscribe(logs("web"), sink_a, source_a).await.unwrap();
        let telemetry_handle = broadcaster
            .subscribe(SubscriptionTarget::Telemetry, sink_b, source_b)
            .await
            .unwrap();
        assert_eq!(broadcaster.active_count(), 2);

        assert!(broadcaster.shutdown().await);
        assert_eq!(broadcaster.active_count(), 0);

        assert_eq!(client_a.texts_until_close().await.1.as_deref(), Some("server shutting down"));
        assert_eq!(client_b.texts_until_close().await.1.as_deref(), Some("server shutting down"));
        assert_eq!(logs_handle.join().await, EndReason::Shutdown);
        assert_eq!(telemetry_handle.join().await, EndReason::Shutdown);

        let (sink, source, _client) = client();
        let late = broadcaster.subscribe(SubscriptionTarget::Telemetry, sink, source).await;
        assert!(matches!(late, Err(SubscriptionError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_shutdown_with_no_subscriptions_returns_immediately() {
        let runtime = MemoryRuntime::new();
        let broadcaster = broadcaster(&runtime, BroadcastConfig::default());
        assert!(broadcaster.shutdown().await);
    }
}
