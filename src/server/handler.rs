// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::proxy::{ClientAddr, Proxy};

/// Per-connection service; proxy failures become responses, never connection errors.
#[derive(Clone)]
pub struct RequestHandler {
    proxy: Arc<Proxy>,
    peer: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy, peer: None }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let proxy = self.proxy.clone();
        if let Some(peer) = self.peer {
            req.extensions_mut().insert(ClientAddr(peer));
        }

        Box::pin(async move {
            Ok(proxy.handle(req).await.unwrap_or_else(|e| {
                tracing::error!(%e, "proxy error");
                e.into()
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::proxy::{HttpForwarder, ServerPool};
    use crate::retry::RetryStrategy;
    use hyper::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_dead_pool_answers_service_unavailable() {
        let pool = Arc::new(
            ServerPool::from_addresses(&["http://127.0.0.1:1"], Arc::new(HttpForwarder::new()))
                .unwrap(),
        );
        for backend in pool.backends() {
            backend.set_alive(false).await;
        }
        let proxy = Arc::new(Proxy::new(pool, RetryStrategy::new(RetryConfig::default(), None), None));

        let response = RequestHandler::new(proxy)
            .with_peer("127.0.0.1:40000".parse().unwrap())
            .oneshot(Request::new(Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
