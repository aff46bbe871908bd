//! Prioritized redelivery of the durable queue.
//!
//! The drain walks the backlog in `(priority desc, enqueued_at asc)` order,
//! waiting out each request's exponential backoff before reissuing it. One
//! request failing never aborts the drain; it just earns another retry
//! count. Requests that exhaust their retries are evicted, which is a
//! permanent failure visible only through alerts and logs since the original
//! caller already got its synchronous answer long ago.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use super::error::QueueError;
use super::internal_event::{QueueDrained, RequestQueued};
use super::monitor::{AlertLevel, AlertLog};
use super::queue::{QueueStore, QueuedRequest};
use super::transport::{RequestParts, Transport};

/// Tuning for queue redelivery.
#[derive(Clone, Copy, Debug, Builder)]
pub struct RetrySettings {
    /// Redelivery attempts before a request is evicted for good.
    #[builder(default = default_max_retries())]
    pub max_retries: u32,

    /// Backoff for the first redelivery attempt; doubles per attempt.
    #[builder(default = default_base_delay())]
    pub base_delay: Duration,

    /// Ceiling on any single backoff delay.
    #[builder(default = default_max_delay())]
    pub max_delay: Duration,

    /// Fixed pause between consecutive redeliveries, so a recovering backend
    /// is not greeted with a retry storm.
    #[builder(default = default_redelivery_pause())]
    pub redelivery_pause: Duration,
}

const fn default_max_retries() -> u32 {
    5
}
const fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}
const fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}
const fn default_redelivery_pause() -> Duration {
    Duration::from_millis(100)
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            redelivery_pause: default_redelivery_pause(),
        }
    }
}

impl RetrySettings {
    /// Backoff for the given attempt: `min(base_delay * 2^retry_count,
    /// max_delay)`, saturating instead of overflowing for absurd counts.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let multiplier = 1u128 << retry_count.min(63);
        match self.base_delay.as_millis().checked_mul(multiplier) {
            Some(ms) if ms < self.max_delay.as_millis() => {
                Duration::from_millis(ms as u64)
            }
            _ => self.max_delay,
        }
    }
}

/// What one drain pass accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub evicted: usize,
    /// True when another drain was already in flight and this call was a
    /// no-op.
    pub skipped: bool,
}

/// Owns the durable backlog: enqueues failed requests and drains them in
/// priority order once someone (connectivity restore, startup, the monitor)
/// asks.
pub struct RetryCoordinator {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    settings: RetrySettings,
    alerts: Arc<AlertLog>,
    // Single-flight guard. One permit; a drain that cannot take it
    // immediately reports itself skipped rather than queueing behind the
    // running pass.
    drain_gate: Semaphore,
}

impl RetryCoordinator {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        settings: RetrySettings,
        alerts: Arc<AlertLog>,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
            alerts,
            drain_gate: Semaphore::new(1),
        }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Persists a request for later redelivery and returns its queue id.
    pub async fn enqueue(&self, request: RequestParts, priority: u8) -> Result<u64, QueueError> {
        let id = self.store.add(request, priority).await?;
        let queue_depth = self.store.len().await.unwrap_or(0);
        RequestQueued { id, priority, queue_depth }.emit();
        Ok(id)
    }

    /// Drains the backlog. Re-entrant safe: a second call while a drain is
    /// in progress returns immediately with `skipped` set.
    pub async fn drain(&self) -> DrainReport {
        let Ok(_permit) = self.drain_gate.try_acquire() else {
            debug!(target: "adaptive_traffic::retry", "drain already in progress, skipping");
            return DrainReport { skipped: true, ..DrainReport::default() };
        };

        let mut report = DrainReport::default();
        let mut backlog = match self.store.list().await {
            Ok(backlog) => backlog,
            Err(e) => {
                error!(target: "adaptive_traffic::retry", error = %e, "could not read queue, aborting drain");
                return report;
            }
        };
        if backlog.is_empty() {
            return report;
        }

        // Strict priority, FIFO within a priority. The id tie-break keeps
        // FIFO exact when two requests share an enqueue millisecond.
        backlog.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at_ms.cmp(&b.enqueued_at_ms))
                .then(a.id.cmp(&b.id))
        });
        info!(target: "adaptive_traffic::retry", backlog = backlog.len(), "draining queued requests");

        for mut record in backlog {
            if record.retry_count >= self.settings.max_retries {
                self.evict(&record).await;
                report.evicted += 1;
                continue;
            }

            sleep(self.settings.delay_for(record.retry_count)).await;
            match self.transport.send(record.request.clone()).await {
                Ok(response) => {
                    if let Err(e) = self.store.delete(record.id).await {
                        warn!(target: "adaptive_traffic::retry", id = record.id, error = %e, "delivered but could not remove from queue");
                    }
                    debug!(
                        target: "adaptive_traffic::retry",
                        id = record.id,
                        status = response.status,
                        "queued request delivered"
                    );
                    report.delivered += 1;
                }
                Err(e) => {
                    record.retry_count += 1;
                    warn!(
                        target: "adaptive_traffic::retry",
                        id = record.id,
                        retry_count = record.retry_count,
                        error = %e,
                        "redelivery failed"
                    );
                    match self.store.put(&record).await {
                        Ok(()) | Err(QueueError::Missing { .. }) => {}
                        Err(e) => {
                            warn!(target: "adaptive_traffic::retry", id = record.id, error = %e, "could not persist retry count");
                        }
                    }
                    report.retried += 1;
                }
            }
            sleep(self.settings.redelivery_pause).await;
        }

        QueueDrained {
            delivered: report.delivered,
            retried: report.retried,
            evicted: report.evicted,
        }
        .emit();
        report
    }

    async fn evict(&self, record: &QueuedRequest) {
        if let Err(e) = self.store.delete(record.id).await {
            warn!(target: "adaptive_traffic::retry", id = record.id, error = %e, "could not evict exhausted request");
            return;
        }
        error!(
            target: "adaptive_traffic::retry",
            id = record.id,
            url = %record.request.url,
            retry_count = record.retry_count,
            "request dropped permanently, retries exhausted"
        );
        self.alerts.raise(
            AlertLevel::Warning,
            format!(
                "request to {} dropped after {} failed deliveries",
                record.request.endpoint(),
                record.retry_count
            ),
            serde_json::json!({
                "id": record.id,
                "url": record.request.url,
                "retry_count": record.retry_count,
            }),
        );
    }
}
