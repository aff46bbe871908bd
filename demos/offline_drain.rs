// Walkthrough of the offline capture / restore / drain cycle.
//
// A scripted transport stands in for the real backend so the demo runs
// without network access: the first two sends fail at the connection level,
// everything afterwards succeeds. Watch the tracing output to follow the
// queue filling up while offline and draining in priority order once
// connectivity returns.
//
// Run with:
//   cargo run --example offline_drain
//   RUST_LOG=adaptive_traffic=trace cargo run --example offline_drain

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::info;
use tracing_subscriber::EnvFilter;

use adaptive_traffic::resilience::error::TransportError;
use adaptive_traffic::resilience::interceptor::CallOptions;
use adaptive_traffic::resilience::queue::QueueStore;
use adaptive_traffic::resilience::transport::{RequestParts, Transport, TransportResponse};
use adaptive_traffic::resilience::{EngineSettings, ResilienceEngine};

struct FlakyBackend {
    failures_left: AtomicUsize,
}

impl Transport for FlakyBackend {
    fn send(
        &self,
        request: RequestParts,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if fail {
                Err(TransportError::Connect {
                    source: format!("no route to {}", request.url).into(),
                })
            } else {
                Ok(TransportResponse { status: 200, body: bytes::Bytes::from_static(b"ok") })
            }
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), adaptive_traffic::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("adaptive_traffic=debug")),
        )
        .init();

    let engine = ResilienceEngine::builder()
        .transport(Arc::new(FlakyBackend { failures_left: AtomicUsize::new(2) }))
        .settings(EngineSettings::default())
        .build();
    engine.start();

    // Simulate losing the connection: calls fail fast and are captured.
    engine.connectivity().set_online(false);
    for (url, priority) in [
        ("https://api.example.com/deals/sync", 1),
        ("https://api.example.com/deals/urgent", 5),
        ("https://api.example.com/properties/refresh", 1),
    ] {
        let result = engine
            .interceptor()
            .execute(RequestParts::get(url), &CallOptions::with_priority(priority))
            .await;
        info!(url, ?result, "call while offline");
    }
    info!(
        queued = engine.coordinator().store().len().await?,
        "backlog while offline"
    );

    // Connectivity returns; the watcher drains in priority order. The two
    // scripted connection failures force a couple of backoff retries along
    // the way.
    engine.connectivity().set_online(true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let report = engine.coordinator().drain().await;
    info!(?report, "manual follow-up drain");
    info!(
        queued = engine.coordinator().store().len().await?,
        alerts = engine.alerts().alerts().len(),
        "backlog after restore"
    );

    engine.stop();
    Ok(())
}
