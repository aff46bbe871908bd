//! `tower` integration.
//!
//! Two adapters, one per direction:
//!
//! - [`ResilienceService`] exposes the interceptor as a
//!   `tower::Service<RequestParts>`, so hosts already composing tower stacks
//!   mount the resilience layer like any other middleware.
//! - [`ServiceTransport`] goes the other way: any cloneable tower service
//!   speaking `RequestParts` can serve as the engine's [`Transport`], which
//!   is how a host plugs its own instrumented client stack underneath.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use pin_project::pin_project;
use tower::{Service, ServiceExt};

use super::error::{CallError, TransportError};
use super::interceptor::{CallOptions, RequestInterceptor};
use super::transport::{RequestParts, Transport, TransportResponse};

/// The interceptor as a tower service. Cloning shares the underlying
/// interceptor; per-clone call options allow different priorities per stack.
#[derive(Clone)]
pub struct ResilienceService {
    interceptor: Arc<RequestInterceptor>,
    options: CallOptions,
}

impl ResilienceService {
    pub fn new(interceptor: Arc<RequestInterceptor>, options: CallOptions) -> Self {
        Self { interceptor, options }
    }
}

impl Service<RequestParts> for ResilienceService {
    type Response = TransportResponse;
    type Error = CallError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Admission control happens per call inside the interceptor; the
        // service itself is always ready.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RequestParts) -> Self::Future {
        let interceptor = Arc::clone(&self.interceptor);
        let options = self.options.clone();
        ResponseFuture {
            inner: Box::pin(async move { interceptor.execute(request, &options).await }),
        }
    }
}

/// Response future of [`ResilienceService`].
#[pin_project]
pub struct ResponseFuture {
    #[pin]
    inner: BoxFuture<'static, Result<TransportResponse, CallError>>,
}

impl Future for ResponseFuture {
    type Output = Result<TransportResponse, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().inner.poll(cx)
    }
}

/// [`Transport`] backed by a cloneable tower service.
pub struct ServiceTransport<S> {
    inner: S,
}

impl<S> ServiceTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> Transport for ServiceTransport<S>
where
    S: Service<RequestParts, Response = TransportResponse, Error = TransportError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    fn send(
        &self,
        request: RequestParts,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let service = self.inner.clone();
        Box::pin(async move { service.oneshot(request).await })
    }
}
