//! Client-side interceptors applied once per dial.
//!
//! The chain is logging, then correlation propagation, then retry (only when
//! the service has a retry policy), then the dialed transport. Retry sits
//! innermost, so the logging layer times the whole retried call. Individual
//! attempts are logged by the retry layer itself.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::HeaderValue;
use http_body_util::BodyExt;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceBuilder, ServiceExt};
use tracing::{debug, warn};

use super::channel::{full_body, BoxBody, Transport};
use super::errors::BoxError;
use crate::config::{RetryPolicy, ServiceConfig};
use crate::correlation::{current_correlation_id, CorrelationId, CORRELATION_ID_HEADER};

type Request = http::Request<BoxBody>;
type Response = http::Response<BoxBody>;

/// Wrap a dialed transport in the interceptor chain for `config`.
pub fn intercept(config: &ServiceConfig, transport: Transport) -> Transport {
    let inner = match config.retry_policy() {
        Some(policy) => BoxCloneSyncService::new(RetryLayer::new(policy.clone()).layer(transport)),
        None => transport,
    };

    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(LoggingLayer::new(&config.name))
            .layer(CorrelationLayer)
            .service(inner),
    )
}

/// The `grpc-status` of a trailers-only response, when it reports an error.
fn error_status(response: &Response) -> Option<&str> {
    response
        .headers()
        .get("grpc-status")
        .and_then(|value| value.to_str().ok())
        .filter(|status| *status != "0")
}

// Logging

#[derive(Debug, Clone)]
pub struct LoggingLayer {
    service: Arc<str>,
}

impl LoggingLayer {
    pub fn new(service: &str) -> Self {
        Self {
            service: Arc::from(service),
        }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = Logging<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Logging {
            inner,
            service: self.service.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Logging<S> {
    inner: S,
    service: Arc<str>,
}

impl<S> Service<Request> for Logging<S>
where
    S: Service<Request, Response = Response, Error = BoxError>,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let service = self.service.clone();
        let method = request.uri().path().to_string();
        let target = request
            .uri()
            .authority()
            .map(|authority| authority.to_string())
            .unwrap_or_default();
        let started = Instant::now();
        let future = self.inner.call(request);

        Box::pin(async move {
            let result = future.await;
            let latency_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(response) => match error_status(response) {
                    Some(status) => warn!(
                        service = %service,
                        method = %method,
                        target = %target,
                        latency_ms,
                        grpc_status = %status,
                        "RPC returned error status"
                    ),
                    None => debug!(
                        service = %service,
                        method = %method,
                        target = %target,
                        latency_ms,
                        "RPC completed"
                    ),
                },
                Err(e) => warn!(
                    service = %service,
                    method = %method,
                    target = %target,
                    latency_ms,
                    error = %e,
                    "RPC failed"
                ),
            }
            result
        })
    }
}

// Correlation propagation

/// Stamps `x-correlation-id` on outbound calls.
///
/// The id comes from a [`CorrelationId`] request extension, else from the
/// ambient scope set by `with_correlation_id`, else a fresh one is generated.
/// A header the caller already set is left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationLayer;

impl<S> Layer<S> for CorrelationLayer {
    type Service = Correlation<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Correlation { inner }
    }
}

#[derive(Debug, Clone)]
pub struct Correlation<S> {
    inner: S,
}

impl<S> Service<Request> for Correlation<S>
where
    S: Service<Request, Response = Response, Error = BoxError>,
{
    type Response = Response;
    type Error = BoxError;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        if !request.headers().contains_key(CORRELATION_ID_HEADER) {
            let id = request
                .extensions()
                .get::<CorrelationId>()
                .cloned()
                .or_else(current_correlation_id)
                .unwrap_or_else(CorrelationId::generate);

            match HeaderValue::from_str(id.as_str()) {
                Ok(value) => {
                    request.headers_mut().insert(CORRELATION_ID_HEADER, value);
                }
                Err(_) => warn!(correlation_id = %id, "Correlation id is not a valid header value"),
            }
        }
        self.inner.call(request)
    }
}

// Retry

#[derive(Debug, Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Re-sends a failed call up to `policy.max` more times with a fixed delay.
///
/// The request body is buffered once so every attempt sends identical bytes.
/// Client-streaming calls are therefore fully buffered before the first send.
#[derive(Debug, Clone)]
pub struct Retry<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Service<Request> for Retry<S>
where
    S: Service<Request, Response = Response, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let policy = self.policy.clone();

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let payload = body.collect().await.map_err(BoxError::from)?.to_bytes();
            let method = parts.uri.path().to_string();
            let attempts = policy.max.saturating_add(1);
            let mut attempt = 1;

            loop {
                let request = replay(&parts, &payload);
                let result = match ServiceExt::<Request>::ready(&mut inner).await {
                    Ok(service) => service.call(request).await,
                    Err(e) => Err(e),
                };

                let failure = match &result {
                    Ok(response) => {
                        error_status(response).map(|status| format!("grpc-status {}", status))
                    }
                    Err(e) => Some(e.to_string()),
                };

                let Some(reason) = failure else {
                    return result;
                };
                if attempt >= attempts {
                    warn!(
                        method = %method,
                        attempts,
                        reason = %reason,
                        "Giving up after final attempt"
                    );
                    return result;
                }

                warn!(
                    method = %method,
                    attempt,
                    attempts,
                    backoff_ms = policy.backoff_ms,
                    reason = %reason,
                    "Attempt failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(policy.backoff()).await;
            }
        })
    }
}

fn replay(parts: &http::request::Parts, payload: &Bytes) -> Request {
    let mut request = http::Request::new(full_body(payload.clone()));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();
    request
}
