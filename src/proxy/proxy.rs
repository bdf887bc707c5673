// ────────────────────────────────
// src/proxy/proxy.rs
// Dispatch entry point: pool selection, failover and re-dispatch
// ────────────────────────────────

use super::forwarder::ClientAddr;
use super::pool::ServerPool;
use crate::metrics::MetricsCollector;
use crate::retry::{RetryState, RetryStrategy};
use http_body::{LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode, Uri, Version};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument};

const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub struct Proxy {
    pool: Arc<ServerPool>,
    strategy: RetryStrategy,
    metrics: Option<Arc<MetricsCollector>>,
    request_timeout: Option<Duration>,
    max_body_bytes: usize,
}

impl Proxy {
    pub fn new(
        pool: Arc<ServerPool>,
        strategy: RetryStrategy,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            pool,
            strategy,
            metrics,
            request_timeout: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Abandons the request, pending retries included, once `limit` elapses.
    pub fn with_request_timeout(mut self, limit: Option<Duration>) -> Self {
        self.request_timeout = limit;
        self
    }

    /// Requests with larger bodies are refused with 413 before any backend is tried.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub async fn handle(&self, mut req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let request_id = match req.headers().get("x-request-id").and_then(|v| v.to_str().ok()) {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    req.headers_mut().insert("x-request-id", value);
                }
                id
            }
        };
        let span = info_span!(
            "request",
            id = %request_id,
            method = %req.method(),
            path = %req.uri().path(),
        );

        let result = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, self.dispatch(req))
                .instrument(span)
                .await
                .unwrap_or(Err(ProxyError::Timeout)),
            None => self.dispatch(req).instrument(span).await,
        };

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "forwarded",
                Err(e) => e.outcome(),
            };
            metrics.record_request(outcome);
        }
        result
    }

    async fn dispatch(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let request = BufferedRequest::read(req, self.max_body_bytes).await?;
        let max_attempts = self.strategy.max_attempts(self.pool.len());
        let mut state = RetryState::default();

        loop {
            let backend = self
                .pool
                .get_next()
                .await
                .ok_or(ProxyError::NoHealthyBackends)?;

            match self
                .strategy
                .forward_with_retries(&backend, || request.to_request(), state)
                .await
            {
                Ok(response) => return Ok(response),
                Err((error, spent)) => {
                    self.pool.mark_backend_status(&backend.url, false).await;
                    warn!(
                        backend = %backend.url,
                        status = "down",
                        "Backend demoted after {} retries: {}",
                        spent.retries,
                        error
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_demotion(backend.url.as_str());
                        metrics.update_backend_health(backend.url.as_str(), false);
                        metrics.update_backend_counts(self.pool.alive_count().await, self.pool.len());
                    }

                    info!(
                        "{}({}) Attempting retry {}",
                        request.client_label(),
                        request.uri.path(),
                        spent.attempts
                    );
                    state = spent.next_attempt();
                    if state.attempts >= max_attempts {
                        return Err(ProxyError::AttemptsExhausted(state.attempts));
                    }
                }
            }
        }
    }
}

/// Inbound request held in memory so it can be replayed on every attempt.
#[derive(Debug, Clone)]
pub struct BufferedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client: Option<ClientAddr>,
}

impl BufferedRequest {
    /// Reads at most `limit` body bytes; a declared or streamed excess fails early.
    pub async fn read(req: Request<Body>, limit: usize) -> Result<Self, ProxyError> {
        let declared = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.map_or(false, |len| len > limit as u64) {
            return Err(ProxyError::PayloadTooLarge(limit));
        }

        let (parts, body) = req.into_parts();
        let body = hyper::body::to_bytes(Limited::new(body, limit))
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProxyError::PayloadTooLarge(limit)
                } else {
                    ProxyError::BadRequest(e.to_string())
                }
            })?;

        Ok(Self {
            client: parts.extensions.get::<ClientAddr>().copied(),
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }

    pub fn to_request(&self) -> Request<Body> {
        let mut req = Request::new(Body::from(self.body.clone()));
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.version_mut() = self.version;
        *req.headers_mut() = self.headers.clone();
        if let Some(client) = self.client {
            req.extensions_mut().insert(client);
        }
        req
    }

    fn client_label(&self) -> String {
        match self.client {
            Some(ClientAddr(addr)) => addr.to_string(),
            None => "unknown".to_string(),
        }
    }
}

// Custom error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Gave up after dispatching to {0} backends")]
    AttemptsExhausted(u32),

    #[error("Request timeout")]
    Timeout,

    #[error("Unreadable request body: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl ProxyError {
    fn outcome(&self) -> &'static str {
        match self {
            ProxyError::NoHealthyBackends => "unavailable",
            ProxyError::AttemptsExhausted(_) => "exhausted",
            ProxyError::Timeout => "timeout",
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::PayloadTooLarge(_) => "too_large",
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let (status, message) = match err {
            ProxyError::NoHealthyBackends | ProxyError::AttemptsExhausted(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "Service not available")
            }
            ProxyError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout"),
            ProxyError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad request"),
            ProxyError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large"),
        };

        let mut response = Response::new(Body::from(message));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}
