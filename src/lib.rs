//! Client-side adaptive traffic control and resilience for outbound HTTP.
//!
//! This crate sits between application code and the HTTP client, protecting a
//! shared backend from overload while keeping the client usable through
//! network degradation. Three cooperating pieces:
//!
//! 1. **Adaptive rate limiting**: per-identity sliding windows whose capacity
//!    grows and shrinks with observed latency and error rate (additive
//!    increase / additive decrease), with escalating penalties for repeat
//!    violators.
//! 2. **Durable offline queue**: requests that fail with a network-classified
//!    error (or are issued while offline) are persisted and redelivered in
//!    priority order with exponential backoff once connectivity returns.
//! 3. **Predictive monitoring**: rolling windows of latency, error,
//!    connectivity, and memory signals are aggregated into a risk level;
//!    critical risk triggers idempotent remediation (queue drain, memory
//!    trim, alerting).
//!
//! All state is local to one client instance. There is no cross-client
//! coordination and no server-side enforcement; the server must still apply
//! its own limits.
//!
//! # Basic usage
//!
//! ```no_run
//! use adaptive_traffic::resilience::{EngineSettings, ResilienceEngine};
//! use adaptive_traffic::resilience::transport::{ReqwestTransport, RequestParts};
//! use adaptive_traffic::resilience::interceptor::CallOptions;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), adaptive_traffic::Error> {
//! let engine = ResilienceEngine::builder()
//!     .transport(Arc::new(ReqwestTransport::new()))
//!     .settings(EngineSettings::default())
//!     .build();
//! engine.start();
//!
//! let response = engine
//!     .interceptor()
//!     .execute(RequestParts::get("https://api.example.com/deals"), &CallOptions::default())
//!     .await?;
//! # let _ = response;
//! engine.stop();
//! # Ok(())
//! # }
//! ```

pub mod resilience;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
