// src/retry/strategy.rs

use crate::config::RetryConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, ForwardError};
use hyper::{Body, Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Per-request failover counters, replaced rather than mutated on each hop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts against the current backend beyond the first.
    pub retries: u32,
    /// Re-dispatches to a fresh backend after a demotion.
    pub attempts: u32,
}

impl RetryState {
    pub fn next_retry(self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self
        }
    }

    /// A re-dispatch starts a new retry budget on the next backend.
    pub fn next_attempt(self) -> Self {
        Self {
            retries: 0,
            attempts: self.attempts + 1,
        }
    }
}

#[derive(Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self { config, metrics }
    }

    pub fn backoff(&self) -> Duration {
        self.config.backoff()
    }

    /// Re-dispatch ceiling for a pool of `pool_size` backends.
    pub fn max_attempts(&self, pool_size: usize) -> u32 {
        self.config
            .max_attempts
            .unwrap_or_else(|| u32::try_from(pool_size).unwrap_or(u32::MAX))
    }

    /// Forwards to `backend`, retrying transport failures up to `max_retries`
    /// times with a fixed backoff. The final error means the backend should be
    /// demoted; the returned state carries the retries spent.
    pub async fn forward_with_retries<F>(
        &self,
        backend: &Backend,
        mut make_request: F,
        mut state: RetryState,
    ) -> Result<Response<Body>, (ForwardError, RetryState)>
    where
        F: FnMut() -> Request<Body>,
    {
        loop {
            match backend.forward(make_request()).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    warn!("[{}] {}", backend.url, error);

                    if state.retries >= self.config.max_retries {
                        return Err((error, state));
                    }

                    sleep(self.backoff()).await;
                    state = state.next_retry();
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry(backend.url.as_str());
                    }
                    debug!(
                        "Retrying {} ({}/{})",
                        backend.url, state.retries, self.config.max_retries
                    );
                }
            }
        }
    }
}
