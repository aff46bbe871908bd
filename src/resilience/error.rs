//! Error taxonomy for the resilience layer.
//!
//! The split matters operationally:
//!
//! - [`RateLimitExceeded`] is caller-caused, surfaced immediately with a
//!   retry-after hint, and never auto-retried.
//! - [`CallError::Offline`] means the request was accepted for durable
//!   delivery but the call itself still fails right away. The caller never
//!   blocks waiting for eventual redelivery.
//! - [`TransportError`] distinguishes network-classified failures (which get
//!   a copy queued for background redelivery) from valid HTTP error
//!   responses (which pass through untouched).
//!
//! Retries exhausting in the background queue produce an alert and a log
//! line, never an error: the original caller already moved on.

use std::time::Duration;

use snafu::Snafu;

use crate::Error as BoxedError;

/// Transport-level outcome classification for a single send attempt.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    /// The connection could not be established or broke mid-flight. No HTTP
    /// response was received.
    #[snafu(display("connection failed: {source}"))]
    Connect { source: BoxedError },

    /// The request timed out before a response arrived.
    #[snafu(display("request timed out"))]
    Timeout,

    /// The server answered with a non-success status. This is a valid HTTP
    /// exchange, not a network failure.
    #[snafu(display("server responded with status {status}: {body}"))]
    Status { status: u16, body: String },

    /// The request URL could not be parsed.
    #[snafu(display("invalid request URL {url:?}: {details}"))]
    InvalidUrl { url: String, details: String },

    /// The request could not be assembled (bad header name or value).
    #[snafu(display("failed to build request: {details}"))]
    Build { details: String },

    /// Client-side failure outside the categories above (body decode,
    /// redirect loop, and similar).
    #[snafu(display("http client error: {source}"))]
    Client { source: BoxedError },
}

impl TransportError {
    /// True when no valid HTTP response was received. Network-classified
    /// failures are the ones worth queueing for redelivery; everything else
    /// would fail again identically.
    pub const fn is_network(&self) -> bool {
        matches!(self, TransportError::Connect { .. } | TransportError::Timeout)
    }
}

/// Rejection by the adaptive rate limiter.
#[derive(Debug, Clone, Copy, Snafu)]
#[snafu(display("rate limit exceeded, retry after {}s", retry_after.as_secs()))]
pub struct RateLimitExceeded {
    /// Time until a retry could be admitted: the later of the penalty expiry
    /// and the moment a window slot frees up.
    pub retry_after: Duration,
}

/// Failure of an intercepted call, as seen by the caller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CallError {
    /// Rejected before any network activity.
    #[snafu(display("{source}"))]
    RateLimited { source: RateLimitExceeded },

    /// The client is offline. When `id` is set, a copy of the request was
    /// durably queued and will be redelivered once connectivity returns.
    #[snafu(display("client is offline (queued as {id:?})"))]
    Offline { id: Option<u64> },

    /// The underlying send failed. Network-classified sources additionally
    /// had a copy queued, best effort.
    #[snafu(display("{source}"))]
    Transport { source: TransportError },
}

impl CallError {
    /// The retry-after hint, present only for rate-limit rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::RateLimited { source } => Some(source.retry_after),
            _ => None,
        }
    }
}

/// Durable queue store failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum QueueError {
    #[snafu(display("queue store I/O failed: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("queued request could not be encoded: {source}"))]
    Encode { source: serde_json::Error },

    #[snafu(display("queue snapshot could not be decoded: {source}"))]
    Decode { source: serde_json::Error },

    #[snafu(display("no queued request with id {id}"))]
    Missing { id: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_classification_covers_only_transport_failures() {
        assert!(TransportError::Timeout.is_network());
        assert!(
            TransportError::Connect { source: "refused".into() }.is_network()
        );
        assert!(
            !TransportError::Status { status: 503, body: String::new() }.is_network()
        );
        assert!(
            !TransportError::Build { details: "bad header".into() }.is_network()
        );
    }

    #[test]
    fn retry_after_is_exposed_only_for_rate_limits() {
        let limited = CallError::RateLimited {
            source: RateLimitExceeded { retry_after: Duration::from_secs(42) },
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(42)));
        assert_eq!(CallError::Offline { id: Some(1) }.retry_after(), None);
    }
}
