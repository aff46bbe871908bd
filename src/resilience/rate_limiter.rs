//! Per-identity adaptive admission control.
//!
//! Each identity gets a sliding window of request timestamps and a dynamic
//! capacity. Capacity is steered by a periodic additive-increase /
//! additive-decrease loop fed from process-wide latency and error-rate
//! aggregates. The adjustment is applied uniformly to every tracked identity
//! per tick rather than per-identity signal, a deliberate simplification
//! trading fairness for simplicity.
//!
//! Violations escalate: each capacity overrun extends the penalty window
//! linearly up to a cap, and reputation recovers one step per idle
//! adjustment interval rather than resetting abruptly.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bon::Builder;
use tokio::time::Instant;

use super::NotificationSink;
use super::error::RateLimitExceeded;
use super::internal_event::{LimitsAdjusted, RequestAdmitted, RequestBlocked};
use super::monitor::AlertLevel;
use std::sync::Arc;

/// Tuning for the adaptive rate limiter.
///
/// The thresholds and step sizes are hand-tuned values carried over from the
/// production client; change them only with load data in hand.
#[derive(Clone, Copy, Debug, Builder)]
pub struct RateLimitSettings {
    /// Starting window capacity for a newly tracked identity.
    #[builder(default = default_max_requests())]
    pub max_requests: usize,

    /// Width of the sliding window.
    #[builder(default = default_window())]
    pub window: Duration,

    /// Floor the adaptive loop will never shrink capacity below.
    #[builder(default = default_min_requests())]
    pub min_requests: usize,

    /// Ceiling the adaptive loop will never grow capacity above.
    #[builder(default = default_max_requests_limit())]
    pub max_requests_limit: usize,

    /// Capacity delta applied per adjustment tick (both directions).
    #[builder(default = default_adaptive_step())]
    pub adaptive_step: usize,

    /// First-violation penalty. Repeat violations multiply this by the
    /// violation count, capped at [`PENALTY_CAP_MULTIPLIER`].
    #[builder(default = default_base_penalty())]
    pub base_penalty: Duration,

    /// Window-utilization ratio at which a non-blocking warning is emitted.
    #[builder(default = default_warning_threshold())]
    pub warning_threshold: f64,

    /// Below both healthy thresholds, capacity is increased.
    #[builder(default = default_healthy_latency_ms())]
    pub healthy_latency_ms: f64,
    #[builder(default = default_healthy_error_rate())]
    pub healthy_error_rate: f64,

    /// Above either degraded threshold, capacity is decreased.
    #[builder(default = default_degraded_latency_ms())]
    pub degraded_latency_ms: f64,
    #[builder(default = default_degraded_error_rate())]
    pub degraded_error_rate: f64,

    /// Period of the adjustment / garbage-collection loop.
    #[builder(default = default_adjust_interval())]
    pub adjust_interval: Duration,

    /// Smoothing factor for the global latency and error-rate EWMAs.
    #[builder(default = default_ewma_alpha())]
    pub ewma_alpha: f64,
}

/// Repeat violations never extend the penalty past this multiple of
/// `base_penalty`.
pub const PENALTY_CAP_MULTIPLIER: u32 = 5;

const fn default_max_requests() -> usize {
    30
}
const fn default_window() -> Duration {
    Duration::from_secs(60)
}
const fn default_min_requests() -> usize {
    5
}
const fn default_max_requests_limit() -> usize {
    100
}
const fn default_adaptive_step() -> usize {
    5
}
const fn default_base_penalty() -> Duration {
    Duration::from_secs(30)
}
const fn default_warning_threshold() -> f64 {
    0.8
}
const fn default_healthy_latency_ms() -> f64 {
    300.0
}
const fn default_healthy_error_rate() -> f64 {
    0.05
}
const fn default_degraded_latency_ms() -> f64 {
    1000.0
}
const fn default_degraded_error_rate() -> f64 {
    0.15
}
const fn default_adjust_interval() -> Duration {
    Duration::from_secs(30)
}
const fn default_ewma_alpha() -> f64 {
    0.4
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
            min_requests: default_min_requests(),
            max_requests_limit: default_max_requests_limit(),
            adaptive_step: default_adaptive_step(),
            base_penalty: default_base_penalty(),
            warning_threshold: default_warning_threshold(),
            healthy_latency_ms: default_healthy_latency_ms(),
            healthy_error_rate: default_healthy_error_rate(),
            degraded_latency_ms: default_degraded_latency_ms(),
            degraded_error_rate: default_degraded_error_rate(),
            adjust_interval: default_adjust_interval(),
            ewma_alpha: default_ewma_alpha(),
        }
    }
}

/// Per-call overrides for a single admission check.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    /// Use this capacity instead of the identity's adaptive limit.
    pub max_requests: Option<usize>,
    /// Use this window width instead of the configured one.
    pub window: Option<Duration>,
}

/// Outcome of a successful admission check.
#[derive(Debug, Clone, Copy)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining: usize,
    pub limit: usize,
    /// When the oldest windowed request expires.
    pub reset_at: Instant,
}

#[derive(Debug)]
struct RateRecord {
    timestamps: VecDeque<Instant>,
    current_limit: usize,
    violation_count: u32,
    penalty_until: Option<Instant>,
}

impl RateRecord {
    fn new(limit: usize) -> Self {
        Self {
            timestamps: VecDeque::new(),
            current_limit: limit,
            violation_count: 0,
            penalty_until: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until enough windowed entries expire for one more admission.
    fn window_free_in(&self, limit: usize, window: Duration, now: Instant) -> Duration {
        if self.timestamps.len() < limit {
            return Duration::ZERO;
        }
        let oldest_blocking = self.timestamps[self.timestamps.len() - limit];
        (oldest_blocking + window).saturating_duration_since(now)
    }
}

/// Process-wide request aggregates. Counters are plain atomics; latency and
/// error rate are EWMAs stored as f64 bits so the adjustment loop reads a
/// smoothed signal instead of chasing single samples.
#[derive(Debug)]
pub struct GlobalStats {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    completed_requests: AtomicU64,
    error_requests: AtomicU64,
    average_latency_ms: AtomicU64,
    error_rate: AtomicU64,
    ewma_alpha: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub completed_requests: u64,
    pub error_requests: u64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
}

impl GlobalStats {
    fn new(ewma_alpha: f64) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            completed_requests: AtomicU64::new(0),
            error_requests: AtomicU64::new(0),
            average_latency_ms: AtomicU64::new(0f64.to_bits()),
            error_rate: AtomicU64::new(0f64.to_bits()),
            ewma_alpha,
        }
    }

    /// Folds one completed call into the aggregates.
    pub fn record_outcome(&self, latency_ms: f64, is_error: bool) {
        let first = self.completed_requests.fetch_add(1, Ordering::AcqRel) == 0;
        if is_error {
            self.error_requests.fetch_add(1, Ordering::AcqRel);
        }
        update_ewma(&self.average_latency_ms, self.ewma_alpha, latency_ms, first);
        let error_sample = if is_error { 1.0 } else { 0.0 };
        update_ewma(&self.error_rate, self.ewma_alpha, error_sample, first);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Acquire),
            blocked_requests: self.blocked_requests.load(Ordering::Acquire),
            completed_requests: self.completed_requests.load(Ordering::Acquire),
            error_requests: self.error_requests.load(Ordering::Acquire),
            average_latency_ms: f64::from_bits(self.average_latency_ms.load(Ordering::Acquire)),
            error_rate: f64::from_bits(self.error_rate.load(Ordering::Acquire)),
        }
    }
}

fn update_ewma(cell: &AtomicU64, alpha: f64, sample: f64, seed: bool) {
    let _ = cell.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        let next = if seed {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * f64::from_bits(bits)
        };
        Some(next.to_bits())
    });
}

/// Sliding-window admission control with adaptive capacity.
pub struct AdaptiveRateLimiter {
    settings: RateLimitSettings,
    records: Mutex<HashMap<String, RateRecord>>,
    stats: GlobalStats,
    sink: Arc<dyn NotificationSink>,
}

impl AdaptiveRateLimiter {
    pub fn new(settings: RateLimitSettings, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            stats: GlobalStats::new(settings.ewma_alpha),
            settings,
            records: Mutex::new(HashMap::new()),
            sink,
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    pub fn stats(&self) -> &GlobalStats {
        &self.stats
    }

    /// Penalty for the n-th violation: linear in the violation count, capped.
    fn penalty_for(base: Duration, violation_count: u32) -> Duration {
        base * violation_count.min(PENALTY_CAP_MULTIPLIER)
    }

    /// Admission check. Pruning happens before the capacity comparison on
    /// every call, so the decision never sees stale window entries.
    /// Rejection is synchronous and final for this call; the limiter itself
    /// never retries.
    pub fn check(
        &self,
        identity: &str,
        opts: &CheckOptions,
    ) -> Result<LimitDecision, RateLimitExceeded> {
        let now = Instant::now();
        let window = opts.window.unwrap_or(self.settings.window);
        let mut records = self.records.lock().expect("rate limiter state");
        let record = records
            .entry(identity.to_string())
            .or_insert_with(|| RateRecord::new(self.settings.max_requests));

        record.prune(now, window);
        let limit = opts.max_requests.unwrap_or(record.current_limit);
        self.stats.total_requests.fetch_add(1, Ordering::AcqRel);

        if let Some(penalty_until) = record.penalty_until {
            if penalty_until > now {
                let retry_after = penalty_until
                    .saturating_duration_since(now)
                    .max(record.window_free_in(limit, window, now));
                self.stats.blocked_requests.fetch_add(1, Ordering::AcqRel);
                RequestBlocked {
                    identity,
                    violation_count: record.violation_count,
                    retry_after_secs: retry_after.as_secs(),
                }
                .emit();
                return Err(RateLimitExceeded { retry_after });
            }
        }

        let used = record.timestamps.len();
        if used >= limit {
            record.violation_count += 1;
            let penalty = Self::penalty_for(self.settings.base_penalty, record.violation_count);
            record.penalty_until = Some(now + penalty);
            let retry_after = penalty.max(record.window_free_in(limit, window, now));
            self.stats.blocked_requests.fetch_add(1, Ordering::AcqRel);
            RequestBlocked {
                identity,
                violation_count: record.violation_count,
                retry_after_secs: retry_after.as_secs(),
            }
            .emit();
            return Err(RateLimitExceeded { retry_after });
        }

        let near_capacity =
            limit > 0 && used as f64 / limit as f64 >= self.settings.warning_threshold;

        record.timestamps.push_back(now);
        let remaining = limit - record.timestamps.len();
        let reset_at = record
            .timestamps
            .front()
            .map(|oldest| *oldest + window)
            .unwrap_or(now + window);
        drop(records);

        if near_capacity {
            // Non-blocking side effect; the call itself still succeeds. The
            // sink is invoked outside the record lock so a host sink may call
            // back into the limiter.
            self.sink.notify(
                &format!("approaching rate limit: {used}/{limit} requests in window"),
                AlertLevel::Warning,
            );
        }
        RequestAdmitted { identity, remaining, limit }.emit();
        Ok(LimitDecision { allowed: true, remaining, limit, reset_at })
    }

    /// One AIAD step, applied uniformly to every tracked identity. Fed by the
    /// periodic loop with the current [`StatsSnapshot`]; callable directly
    /// with synthetic numbers.
    pub fn apply_adjustment(&self, average_latency_ms: f64, error_rate: f64) {
        let s = &self.settings;
        let direction: i8 = if average_latency_ms < s.healthy_latency_ms
            && error_rate < s.healthy_error_rate
        {
            1
        } else if average_latency_ms > s.degraded_latency_ms || error_rate > s.degraded_error_rate {
            -1
        } else {
            0
        };

        let mut records = self.records.lock().expect("rate limiter state");
        if direction != 0 {
            for record in records.values_mut() {
                record.current_limit = if direction > 0 {
                    record
                        .current_limit
                        .saturating_add(s.adaptive_step)
                        .min(s.max_requests_limit)
                } else {
                    record
                        .current_limit
                        .saturating_sub(s.adaptive_step)
                        .max(s.min_requests)
                };
            }
        }
        LimitsAdjusted {
            direction,
            tracked_identities: records.len(),
            average_latency_ms,
            error_rate,
        }
        .emit();
    }

    /// Drops identities whose window is empty and whose reputation has fully
    /// recovered; lapsed penalties decay the violation count one step per
    /// tick instead of resetting it.
    pub fn collect_garbage(&self) {
        let now = Instant::now();
        let window = self.settings.window;
        let mut records = self.records.lock().expect("rate limiter state");
        records.retain(|identity, record| {
            record.prune(now, window);
            match record.penalty_until {
                Some(until) if until <= now => {
                    record.penalty_until = None;
                    record.violation_count = record.violation_count.saturating_sub(1);
                }
                None => {
                    record.violation_count = record.violation_count.saturating_sub(1);
                }
                Some(_) => {}
            }
            let keep = !record.timestamps.is_empty()
                || record.penalty_until.is_some()
                || record.violation_count > 0;
            if !keep {
                trace!(
                    target: "adaptive_traffic::rate_limiter",
                    identity = %identity,
                    "dropping idle rate record"
                );
            }
            keep
        });
    }

    /// One tick of the periodic control loop: adjust from the smoothed
    /// global signal, then collect garbage.
    pub fn run_adjustment_cycle(&self) {
        let snapshot = self.stats.snapshot();
        self.apply_adjustment(snapshot.average_latency_ms, snapshot.error_rate);
        self.collect_garbage();
    }

    pub fn tracked_identities(&self) -> usize {
        self.records.lock().expect("rate limiter state").len()
    }

    /// The identity's current adaptive capacity, if it is tracked.
    pub fn current_limit(&self, identity: &str) -> Option<usize> {
        self.records
            .lock()
            .expect("rate limiter state")
            .get(identity)
            .map(|r| r.current_limit)
    }
}
