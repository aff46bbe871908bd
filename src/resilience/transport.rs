//! The transport hook: the only place this crate touches the network.
//!
//! Outbound calls are described by [`RequestParts`], a serializable snapshot
//! of everything needed to (re)issue a request. Keeping the description
//! serializable is what lets the retry queue persist requests across process
//! restarts.

use bytes::Bytes;
use futures::future::BoxFuture;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::TransportError;

/// A self-contained description of one outbound HTTP request.
///
/// Headers are kept as string pairs and the body as raw bytes so the whole
/// struct round-trips through serde for durable queueing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParts {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

impl RequestParts {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let mut parts = Self::new("POST", url);
        parts.body = Some(body.into());
        parts
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The path component of the URL, used to label telemetry samples.
    /// Falls back to the full URL when it does not parse.
    pub fn endpoint(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self.url.clone(),
        }
    }
}

/// A successful HTTP exchange. Non-success statuses surface as
/// [`TransportError::Status`] instead, so downstream code can treat `Ok` as
/// "the backend accepted this".
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status).ok()
    }
}

/// The narrow seam to the host HTTP client. Everything above it (limiting,
/// queueing, monitoring) is transport-agnostic; tests substitute scripted
/// implementations.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: RequestParts) -> BoxFuture<'static, Result<TransportResponse, TransportError>>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: RequestParts) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let url = match reqwest::Url::parse(&request.url) {
            Ok(url) => url,
            Err(parse_err) => {
                let err = TransportError::InvalidUrl {
                    url: request.url.clone(),
                    details: parse_err.to_string(),
                };
                return Box::pin(async move { Err(err) });
            }
        };

        let method = match request.method.parse::<http::Method>() {
            Ok(method) => method,
            Err(_) => {
                let err = TransportError::Build {
                    details: format!("invalid method {:?}", request.method),
                };
                return Box::pin(async move { Err(err) });
            }
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        Box::pin(async move {
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    warn!(url = %request.url, "request timed out");
                    return Err(TransportError::Timeout);
                }
                Err(e) if e.is_connect() => {
                    warn!(url = %request.url, error = %e, "connection failed");
                    return Err(TransportError::Connect { source: Box::new(e) });
                }
                Err(e) => {
                    error!(url = %request.url, error = %e, "http client error");
                    return Err(TransportError::Client { source: Box::new(e) });
                }
            };

            let status = response.status();
            if status.is_success() {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| TransportError::Client { source: Box::new(e) })?;
                Ok(TransportResponse { status: status.as_u16(), body })
            } else {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "could not read error body".to_string());
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    warn!(status = %status, body = %body, "server error response");
                } else {
                    debug!(status = %status, body = %body, "client error response");
                }
                Err(TransportError::Status { status: status.as_u16(), body })
            }
        })
    }
}
