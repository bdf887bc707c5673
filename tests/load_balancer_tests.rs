// tests/load_balancer_tests.rs
use failover_lb::config::RetryConfig;
use failover_lb::proxy::{Forward, HttpForwarder, Proxy, ServerPool};
use failover_lb::retry::RetryStrategy;
use failover_lb::server::{RequestHandler, ServerBuilder};
use hyper::{Body, Client, Request, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Harness {
    addr: SocketAddr,
    pool: Arc<ServerPool>,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start_balancer(backends: &[String]) -> Harness {
    let forwarder: Arc<dyn Forward> = Arc::new(HttpForwarder::new());
    let pool = Arc::new(ServerPool::from_addresses(backends, forwarder).unwrap());
    let strategy = RetryStrategy::new(
        RetryConfig {
            max_retries: 3,
            backoff_ms: 1,
            max_attempts: None,
        },
        None,
    );
    let proxy = Arc::new(Proxy::new(pool.clone(), strategy, None));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();

    tokio::spawn(
        ServerBuilder::new(addr)
            .with_listener(listener)
            .with_handler(RequestHandler::new(proxy))
            .serve_with_shutdown(async {
                let _ = stopped.await;
            }),
    );

    Harness {
        addr,
        pool,
        stop: Some(stop),
    }
}

async fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    format!("http://{}", listener.local_addr().unwrap())
}

async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
    let response = Client::new()
        .get(format!("http://{}{}", addr, path).parse().unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let mut servers = Vec::new();
    let mut addresses = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/whoami")
            .with_status(200)
            .with_body(name)
            .create_async()
            .await;
        addresses.push(server.url());
        servers.push(server);
    }

    let lb = start_balancer(&addresses).await;

    let mut seen = Vec::new();
    for _ in 0..6 {
        let (status, body) = get(lb.addr, "/whoami").await;
        assert_eq!(status, StatusCode::OK);
        seen.push(body);
    }
    assert_eq!(seen, ["alpha", "beta", "gamma", "alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn test_unreachable_backend_is_demoted_and_request_served() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/orders")
        .match_body("{\"id\":7}")
        .with_status(201)
        .with_body("created")
        .create_async()
        .await;

    let dead = closed_address().await;
    let lb = start_balancer(&[dead, server.url()]).await;

    let response = Client::new()
        .request(
            Request::post(format!("http://{}/orders", lb.addr))
                .body(Body::from("{\"id\":7}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    mock.assert_async().await;
    assert!(!lb.pool.backends()[0].is_alive().await);
    assert!(lb.pool.backends()[1].is_alive().await);
}

#[tokio::test]
async fn test_upstream_errors_are_relayed_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/boom")
        .with_status(500)
        .with_body("upstream failed")
        .expect(1)
        .create_async()
        .await;

    let lb = start_balancer(&[server.url()]).await;

    let (status, body) = get(lb.addr, "/boom").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "upstream failed");
    mock.assert_async().await;
    assert!(lb.pool.backends()[0].is_alive().await);
}

#[tokio::test]
async fn test_all_backends_down_yields_service_unavailable() {
    let lb = start_balancer(&[closed_address().await, closed_address().await]).await;

    let (status, body) = get(lb.addr, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "Service not available");
    assert_eq!(lb.pool.alive_count().await, 0);

    // pool exhausted: answered without touching any backend
    let (status, _) = get(lb.addr, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_health_check_restores_backend() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/")
        .with_status(200)
        .with_body("back")
        .create_async()
        .await;

    let lb = start_balancer(&[server.url()]).await;
    let url = lb.pool.backends()[0].url.clone();
    lb.pool.mark_backend_status(&url, false).await;

    let (status, _) = get(lb.addr, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(lb.pool.health_check_all(Duration::from_secs(2)).await, 1);

    let (status, body) = get(lb.addr, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "back");
}
