//! The integration point wrapping every outbound call.
//!
//! Resilience here is an orthogonal side effect layered on top of a
//! synchronous answer: the caller always gets an immediate success or
//! failure, and queueing/retrying happens behind its back. The interceptor
//! never swallows an error.
//!
//! Classification rules:
//!
//! - Offline: persist the request, fail the call with [`CallError::Offline`].
//! - Network-classified failure (no HTTP response received): re-surface the
//!   original error to the caller and best-effort queue a copy.
//! - Valid HTTP error response: pass through untouched, nothing queued.

use std::sync::Arc;

use tokio::time::Instant;

use super::connectivity::Connectivity;
use super::error::CallError;
use super::identity::IdentityResolver;
use super::internal_event::CallObserved;
use super::monitor::PredictiveMonitor;
use super::rate_limiter::{AdaptiveRateLimiter, CheckOptions};
use super::retries::RetryCoordinator;
use super::transport::{RequestParts, Transport, TransportResponse};

/// Default redelivery priority for queued copies.
pub const DEFAULT_PRIORITY: u8 = 3;

/// Per-call behavior knobs.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Identity to charge the call to; resolved from the session when unset.
    pub identity: Option<String>,
    /// Redelivery priority should the request end up queued.
    pub priority: Option<u8>,
    /// Skip queueing while offline (the call still fails with `Offline`).
    pub skip_offline_queue: bool,
    /// Skip queueing a copy on network-classified failure.
    pub skip_failure_queue: bool,
    /// Rate limiter overrides.
    pub limiter: CheckOptions,
}

impl CallOptions {
    pub fn with_priority(priority: u8) -> Self {
        Self { priority: Some(priority), ..Self::default() }
    }

    fn priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }
}

/// Wraps the transport with admission control, offline capture, failure
/// classification, and telemetry.
pub struct RequestInterceptor {
    limiter: Arc<AdaptiveRateLimiter>,
    coordinator: Arc<RetryCoordinator>,
    monitor: Arc<PredictiveMonitor>,
    connectivity: Connectivity,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityResolver>,
}

impl RequestInterceptor {
    pub fn new(
        limiter: Arc<AdaptiveRateLimiter>,
        coordinator: Arc<RetryCoordinator>,
        monitor: Arc<PredictiveMonitor>,
        connectivity: Connectivity,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            limiter,
            coordinator,
            monitor,
            connectivity,
            transport,
            identity,
        }
    }

    /// Executes one outbound call through the full resilience stack.
    pub async fn execute(
        &self,
        request: RequestParts,
        opts: &CallOptions,
    ) -> Result<TransportResponse, CallError> {
        let identity = opts
            .identity
            .clone()
            .unwrap_or_else(|| self.identity.identity());
        self.limiter
            .check(&identity, &opts.limiter)
            .map_err(|source| CallError::RateLimited { source })?;

        if !self.connectivity.is_online() {
            let id = if opts.skip_offline_queue {
                None
            } else {
                self.enqueue_copy(&request, opts.priority()).await
            };
            debug!(
                target: "adaptive_traffic::interceptor",
                url = %request.url,
                queued_id = ?id,
                "offline, request captured for later delivery"
            );
            return Err(CallError::Offline { id });
        }

        let endpoint = request.endpoint();
        let started = Instant::now();
        let result = self.transport.send(request.clone()).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let is_error = result.is_err();

        CallObserved { endpoint: &endpoint, latency_ms, is_error }.emit();
        self.monitor.record_sample(latency_ms, is_error, &endpoint);
        self.limiter.stats().record_outcome(latency_ms, is_error);

        match result {
            Ok(response) => Ok(response),
            Err(source) => {
                if source.is_network() && !opts.skip_failure_queue {
                    let _ = self.enqueue_copy(&request, opts.priority()).await;
                }
                Err(CallError::Transport { source })
            }
        }
    }

    /// Best effort: a queue store failure downgrades to a log line, never a
    /// second error on top of the one the caller is already getting.
    async fn enqueue_copy(&self, request: &RequestParts, priority: u8) -> Option<u64> {
        match self.coordinator.enqueue(request.clone(), priority).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(
                    target: "adaptive_traffic::interceptor",
                    url = %request.url,
                    error = %e,
                    "could not queue request copy"
                );
                None
            }
        }
    }
}
