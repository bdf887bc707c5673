// src/proxy/pool.rs
use super::backend::Backend;
use super::forwarder::Forward;
use crate::health::is_backend_alive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid backend address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: url::ParseError,
    },

    #[error("backend address {0} has no host")]
    MissingHost(String),

    #[error("backend address {0} must use http or https")]
    UnsupportedScheme(String),

    #[error("no backends configured")]
    Empty,
}

/// Ordered, fixed set of backends with a shared round-robin cursor.
#[derive(Debug)]
pub struct ServerPool {
    backends: Vec<Arc<Backend>>,
    // Index of the last selection; starts one before slot 0.
    current: AtomicUsize,
}

impl Default for ServerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerPool {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
            current: AtomicUsize::new(usize::MAX),
        }
    }

    /// Builds a pool in configured order, every backend bound to `forwarder`.
    pub fn from_addresses<S: AsRef<str>>(
        addresses: &[S],
        forwarder: Arc<dyn Forward>,
    ) -> Result<Self, PoolError> {
        if addresses.is_empty() {
            return Err(PoolError::Empty);
        }

        let mut pool = Self::new();
        for address in addresses {
            let url = parse_backend_url(address.as_ref())?;
            pool.add_backend(Backend::new(url, forwarder.clone()));
        }
        Ok(pool)
    }

    /// Construction-time only; `&mut self` keeps it away from concurrent selection.
    pub fn add_backend(&mut self, backend: Backend) {
        info!("Added backend: {}", backend.url);
        self.backends.push(Arc::new(backend));
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn next_index(&self) -> usize {
        self.current.fetch_add(1, Ordering::SeqCst).wrapping_add(1) % self.backends.len()
    }

    /// Next alive backend in round-robin order, or `None` when none is alive.
    pub async fn get_next(&self) -> Option<Arc<Backend>> {
        if self.backends.is_empty() {
            return None;
        }

        let len = self.backends.len();
        let next = self.next_index();
        for i in next..next + len {
            let idx = i % len;
            if self.backends[idx].is_alive().await {
                if i != next {
                    self.current.store(idx, Ordering::SeqCst);
                }
                return Some(self.backends[idx].clone());
            }
        }
        None
    }

    /// Sets liveness on the first backend whose address matches; no-op otherwise.
    pub async fn mark_backend_status(&self, url: &Url, alive: bool) {
        if let Some(backend) = self.backends.iter().find(|b| b.url == *url) {
            let previous = backend.set_alive(alive).await;
            if previous != alive {
                let status = if alive { "up" } else { "down" };
                debug!(backend = %backend.url, status, "Backend status changed");
            }
        }
    }

    pub async fn alive_count(&self) -> usize {
        let mut alive = 0;
        for backend in &self.backends {
            if backend.is_alive().await {
                alive += 1;
            }
        }
        alive
    }

    /// Probes every backend in order and records the result. Returns the alive count.
    pub async fn health_check_all(&self, timeout: Duration) -> usize {
        let mut alive_count = 0;

        for backend in &self.backends {
            let alive = is_backend_alive(&backend.url, timeout).await;
            let was_alive = backend.record_health_check(alive).await;
            let status = if alive { "up" } else { "down" };

            info!("{} [{}]", backend.url, status);
            if alive && !was_alive {
                info!(backend = %backend.url, "Backend recovered");
            } else if !alive && was_alive {
                warn!(backend = %backend.url, "Backend became unreachable");
            }

            if alive {
                alive_count += 1;
            }
        }
        alive_count
    }
}

fn parse_backend_url(address: &str) -> Result<Url, PoolError> {
    let url = Url::parse(address).map_err(|source| PoolError::InvalidAddress {
        address: address.to_string(),
        source,
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(PoolError::UnsupportedScheme(address.to_string()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(PoolError::MissingHost(address.to_string()));
    }
    Ok(url)
}
