// src/proxy/backend.rs
use super::forwarder::{Forward, ForwardError};
use chrono::{DateTime, Utc};
use hyper::{Body, Request, Response};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

/// One upstream target: its address, a liveness flag and the bound forwarder.
pub struct Backend {
    pub url: Url,

    // Runtime state
    alive: RwLock<bool>,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    forwarder: Arc<dyn Forward>,
}

impl Backend {
    /// Backends start out alive; only failures or health checks demote them.
    pub fn new(url: Url, forwarder: Arc<dyn Forward>) -> Self {
        Self {
            url,
            alive: RwLock::new(true),
            last_health_check: RwLock::new(None),
            forwarder,
        }
    }

    /// Updates liveness and returns the previous value.
    pub async fn set_alive(&self, alive: bool) -> bool {
        let mut guard = self.alive.write().await;
        std::mem::replace(&mut *guard, alive)
    }

    pub async fn is_alive(&self) -> bool {
        *self.alive.read().await
    }

    /// Stores a probe outcome and returns the previous liveness.
    pub async fn record_health_check(&self, alive: bool) -> bool {
        let previous = self.set_alive(alive).await;
        *self.last_health_check.write().await = Some(Utc::now());
        previous
    }

    pub async fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.read().await
    }

    pub async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, ForwardError> {
        self.forwarder.forward(&self.url, req).await
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").field("url", &self.url.as_str()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        targets: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Forward for Recorder {
        async fn forward(&self, target: &Url, _req: Request<Body>) -> Result<Response<Body>, ForwardError> {
            self.targets.lock().unwrap().push(target.to_string());
            Err(ForwardError::Other("refused".into()))
        }
    }

    #[tokio::test]
    async fn test_liveness_toggles() {
        let backend = Backend::new(
            Url::parse("http://127.0.0.1:8001").unwrap(),
            Arc::new(Recorder::default()),
        );

        assert!(backend.is_alive().await);
        assert!(backend.set_alive(false).await);
        assert!(!backend.is_alive().await);
        assert!(!backend.set_alive(true).await);
        assert!(backend.is_alive().await);
    }

    #[tokio::test]
    async fn test_health_check_timestamp_recorded() {
        let backend = Backend::new(
            Url::parse("http://127.0.0.1:8001").unwrap(),
            Arc::new(Recorder::default()),
        );
        assert!(backend.last_health_check().await.is_none());

        backend.record_health_check(false).await;

        assert!(!backend.is_alive().await);
        assert!(backend.last_health_check().await.is_some());
    }

    #[tokio::test]
    async fn test_forward_uses_bound_target() {
        let recorder = Arc::new(Recorder::default());
        let backend = Backend::new(Url::parse("http://10.0.0.9:80/").unwrap(), recorder.clone());

        let result = backend.forward(Request::new(Body::empty())).await;

        assert!(matches!(result, Err(ForwardError::Other(_))));
        assert_eq!(*recorder.targets.lock().unwrap(), vec!["http://10.0.0.9/".to_string()]);
    }
}
