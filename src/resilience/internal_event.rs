//! Internal telemetry events.
//!
//! Each event struct couples a metrics emission with a structured tracing
//! line so operators get both an aggregate series and a greppable log. Call
//! sites construct the struct and call [`emit`](RequestBlocked::emit); the
//! structs carry exactly the fields worth recording.

use metrics::{counter, gauge, histogram};

pub struct RequestAdmitted<'a> {
    pub identity: &'a str,
    pub remaining: usize,
    pub limit: usize,
}

impl RequestAdmitted<'_> {
    pub fn emit(self) {
        counter!("traffic_requests_admitted_total").increment(1);
        trace!(
            target: "adaptive_traffic::rate_limiter",
            identity = %self.identity,
            remaining = self.remaining,
            limit = self.limit,
            "request admitted"
        );
    }
}

pub struct RequestBlocked<'a> {
    pub identity: &'a str,
    pub violation_count: u32,
    pub retry_after_secs: u64,
}

impl RequestBlocked<'_> {
    pub fn emit(self) {
        counter!("traffic_requests_blocked_total").increment(1);
        warn!(
            target: "adaptive_traffic::rate_limiter",
            identity = %self.identity,
            violation_count = self.violation_count,
            retry_after_secs = self.retry_after_secs,
            "request blocked by rate limiter"
        );
    }
}

pub struct LimitsAdjusted {
    pub direction: i8,
    pub tracked_identities: usize,
    pub average_latency_ms: f64,
    pub error_rate: f64,
}

impl LimitsAdjusted {
    pub fn emit(self) {
        histogram!("traffic_limit_adjustment").record(f64::from(self.direction));
        debug!(
            target: "adaptive_traffic::rate_limiter",
            direction = self.direction,
            tracked_identities = self.tracked_identities,
            average_latency_ms = self.average_latency_ms,
            error_rate = self.error_rate,
            "adaptive limits adjusted"
        );
    }
}

pub struct RequestQueued {
    pub id: u64,
    pub priority: u8,
    pub queue_depth: usize,
}

impl RequestQueued {
    pub fn emit(self) {
        counter!("traffic_requests_queued_total").increment(1);
        gauge!("traffic_queue_depth").set(self.queue_depth as f64);
        debug!(
            target: "adaptive_traffic::retry",
            id = self.id,
            priority = self.priority,
            queue_depth = self.queue_depth,
            "request queued for redelivery"
        );
    }
}

pub struct QueueDrained {
    pub delivered: usize,
    pub retried: usize,
    pub evicted: usize,
}

impl QueueDrained {
    pub fn emit(self) {
        counter!("traffic_drain_delivered_total").increment(self.delivered as u64);
        counter!("traffic_drain_retried_total").increment(self.retried as u64);
        counter!("traffic_drain_evicted_total").increment(self.evicted as u64);
        info!(
            target: "adaptive_traffic::retry",
            delivered = self.delivered,
            retried = self.retried,
            evicted = self.evicted,
            "queue drain finished"
        );
    }
}

pub struct CallObserved<'a> {
    pub endpoint: &'a str,
    pub latency_ms: f64,
    pub is_error: bool,
}

impl CallObserved<'_> {
    pub fn emit(self) {
        histogram!("traffic_call_latency_ms").record(self.latency_ms);
        if self.is_error {
            counter!("traffic_call_errors_total").increment(1);
        }
        trace!(
            target: "adaptive_traffic::interceptor",
            endpoint = %self.endpoint,
            latency_ms = self.latency_ms,
            is_error = self.is_error,
            "call observed"
        );
    }
}

pub struct RiskEvaluated {
    pub level: u8,
    pub flags: usize,
}

impl RiskEvaluated {
    pub fn emit(self) {
        gauge!("traffic_risk_level").set(f64::from(self.level));
        debug!(
            target: "adaptive_traffic::monitor",
            level = self.level,
            flags = self.flags,
            "risk evaluated"
        );
    }
}
