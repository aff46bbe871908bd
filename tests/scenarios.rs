//! End-to-end scenarios across the assembled engine, run under paused
//! virtual time so backoffs and periodic loops resolve deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use adaptive_traffic::resilience::error::{CallError, TransportError};
use adaptive_traffic::resilience::interceptor::CallOptions;
use adaptive_traffic::resilience::monitor::{AlertLevel, MonitorSettings};
use adaptive_traffic::resilience::queue::QueueStore;
use adaptive_traffic::resilience::rate_limiter::RateLimitSettings;
use adaptive_traffic::resilience::transport::{RequestParts, Transport, TransportResponse};
use adaptive_traffic::resilience::{EngineSettings, ResilienceEngine};

/// Records every URL it is asked to send, failing those queued up as
/// failures (each failure entry is consumed once).
#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<String>>,
}

impl RecordingTransport {
    fn failing(urls: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(urls.iter().map(|u| u.to_string()).collect()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send(
        &self,
        request: RequestParts,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        self.calls.lock().unwrap().push(request.url.clone());
        let mut failures = self.failures.lock().unwrap();
        let fail = failures
            .iter()
            .position(|u| *u == request.url)
            .map(|i| failures.remove(i))
            .is_some();
        Box::pin(async move {
            if fail {
                Err(TransportError::Connect { source: "scripted outage".into() })
            } else {
                Ok(TransportResponse { status: 200, body: bytes::Bytes::new() })
            }
        })
    }
}

fn engine_with(
    transport: Arc<RecordingTransport>,
    settings: EngineSettings,
) -> ResilienceEngine {
    ResilienceEngine::builder()
        .transport(transport)
        .settings(settings)
        .build()
}

#[tokio::test(start_paused = true)]
async fn five_calls_succeed_then_the_sixth_is_rate_limited() {
    let settings = EngineSettings::builder()
        .rate_limit(
            RateLimitSettings::builder()
                .max_requests(5)
                .window(Duration::from_secs(60))
                .build(),
        )
        .build();
    let transport = Arc::new(RecordingTransport::default());
    let engine = engine_with(Arc::clone(&transport), settings);

    for expected_remaining in (0..5).rev() {
        let decision = engine
            .limiter()
            .check("tenant-1", &Default::default())
            .unwrap();
        assert_eq!(decision.remaining, expected_remaining);
        assert_eq!(decision.limit, 5);
    }

    let err = engine
        .limiter()
        .check("tenant-1", &Default::default())
        .unwrap_err();
    let secs = err.retry_after.as_secs();
    assert!((59..=60).contains(&secs), "retry_after was {secs}s");
}

#[tokio::test(start_paused = true)]
async fn offline_call_fails_immediately_and_lands_in_the_queue() {
    let transport = Arc::new(RecordingTransport::default());
    let engine = engine_with(Arc::clone(&transport), EngineSettings::default());
    engine.connectivity().set_online(false);

    let err = engine
        .interceptor()
        .execute(RequestParts::get("https://api.test/deals"), &CallOptions::default())
        .await
        .unwrap_err();
    let CallError::Offline { id: Some(id) } = err else {
        panic!("expected an offline failure with a queued id");
    };

    // The caller got a synchronous failure and nothing hit the network.
    assert!(transport.calls().is_empty());

    let backlog = engine.coordinator().store().list().await.unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].id, id);
    assert_eq!(backlog[0].request.url, "https://api.test/deals");
}

#[tokio::test(start_paused = true)]
async fn restore_drains_by_priority_then_fifo() {
    let transport = Arc::new(RecordingTransport::default());
    let engine = engine_with(Arc::clone(&transport), EngineSettings::default());
    engine.start();
    // Let the startup drain and the connectivity watcher settle before the
    // outage begins.
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.connectivity().set_online(false);

    for (url, priority) in [
        ("https://api.test/a", 1),
        ("https://api.test/b", 5),
        ("https://api.test/c", 1),
    ] {
        let opts = CallOptions::with_priority(priority);
        let err = engine
            .interceptor()
            .execute(RequestParts::get(url), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Offline { id: Some(_) }));
    }

    engine.connectivity().set_online(true);
    // Give the watcher time to drain; backoffs auto-advance under paused
    // time.
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        transport.calls(),
        vec!["https://api.test/b", "https://api.test/a", "https://api.test/c"]
    );
    assert_eq!(engine.coordinator().store().len().await.unwrap(), 0);
    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_alert_before_any_periodic_check() {
    let settings = EngineSettings::builder()
        .monitor(MonitorSettings::builder().consecutive_errors_threshold(3).build())
        .build();
    let transport = Arc::new(RecordingTransport::failing(&[
        "https://api.test/x",
        "https://api.test/x",
        "https://api.test/x",
    ]));
    // Deliberately not started: no periodic check cycle ever runs.
    let engine = engine_with(Arc::clone(&transport), settings);

    for _ in 0..3 {
        let err = engine
            .interceptor()
            .execute(RequestParts::get("https://api.test/x"), &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Transport { .. }));
    }

    let alerts = engine.alerts().alerts();
    assert!(
        alerts.iter().any(|a| a.level == AlertLevel::Critical),
        "expected an event-driven critical alert, got {alerts:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn network_failure_copies_are_redelivered_on_restore() {
    let transport = Arc::new(RecordingTransport::failing(&["https://api.test/flaky"]));
    let engine = engine_with(Arc::clone(&transport), EngineSettings::default());
    engine.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Online, but the first attempt dies on the wire: the caller sees the
    // error and a copy is queued.
    let err = engine
        .interceptor()
        .execute(RequestParts::get("https://api.test/flaky"), &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Transport { source: TransportError::Connect { .. } }
    ));
    assert_eq!(engine.coordinator().store().len().await.unwrap(), 1);

    // A connectivity flap triggers the drain; the retry succeeds.
    engine.connectivity().set_online(false);
    engine.connectivity().set_online(true);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(engine.coordinator().store().len().await.unwrap(), 0);
    assert_eq!(transport.calls().len(), 2);
    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn stopped_engine_no_longer_reacts_to_connectivity() {
    let transport = Arc::new(RecordingTransport::default());
    let engine = engine_with(Arc::clone(&transport), EngineSettings::default());
    engine.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.connectivity().set_online(false);
    tokio::task::yield_now().await;

    engine
        .interceptor()
        .execute(RequestParts::get("https://api.test/later"), &CallOptions::default())
        .await
        .unwrap_err();
    engine.stop();

    engine.connectivity().set_online(true);
    tokio::time::sleep(Duration::from_secs(30)).await;

    // The watcher is gone; nothing was delivered.
    assert!(transport.calls().is_empty());
    assert_eq!(engine.coordinator().store().len().await.unwrap(), 1);
}
