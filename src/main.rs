// src/main.rs
use anyhow::Result;
use failover_lb::{
    config::{self, Config},
    health::HealthChecker,
    metrics::{MetricsCollector, MetricsRegistry},
    proxy::{Forward, HttpForwarder, Proxy, ServerPool},
    retry::RetryStrategy,
    server::{RequestHandler, ServerBuilder},
};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("failover_lb=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    // Initialize metrics
    let (metrics_registry, metrics) = if config.metrics.enabled {
        let registry = MetricsRegistry::new()?;
        let collector = registry.collector();
        (Some(registry), Some(collector))
    } else {
        (None, None)
    };

    // Create backend pool; a bad address aborts startup
    let forwarder: Arc<dyn Forward> = Arc::new(HttpForwarder::new());
    let pool = Arc::new(ServerPool::from_addresses(&config.backends, forwarder)?);
    if let Some(metrics) = &metrics {
        for backend in pool.backends() {
            metrics.update_backend_health(backend.url.as_str(), true);
        }
        metrics.update_backend_counts(pool.len(), pool.len());
    }

    let proxy = Arc::new(build_proxy(&config, pool.clone(), metrics.clone()));

    // Start health checker
    let health_checker = Arc::new(HealthChecker::new(
        config.health_check.clone(),
        pool.clone(),
        metrics.clone(),
    ));
    let health_task = tokio::spawn(health_checker.clone().start());

    // Start metrics server if enabled
    if let Some(registry) = metrics_registry {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, registry, config.metrics.path.clone()).await?;
    }

    info!(
        "Load balancer starting on {} with {} backends",
        config.listen,
        pool.len()
    );

    let served = ServerBuilder::new(config.listen)
        .with_handler(RequestHandler::new(proxy))
        .serve_with_shutdown(shutdown_signal())
        .await;

    health_checker.shutdown();
    if let Err(e) = health_task.await {
        error!("Health checker task failed: {}", e);
    }

    served?;
    info!("Load balancer stopped");
    Ok(())
}

fn build_proxy(
    config: &Config,
    pool: Arc<ServerPool>,
    metrics: Option<Arc<MetricsCollector>>,
) -> Proxy {
    let strategy = RetryStrategy::new(config.retry.clone(), metrics.clone());
    Proxy::new(pool, strategy, metrics)
        .with_request_timeout(config.request_timeout())
        .with_max_body_bytes(config.max_body_bytes)
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move {
                    if req.uri().path() != path.as_str() {
                        return Ok::<_, Infallible>(text_response(StatusCode::NOT_FOUND, "Not Found".into()));
                    }
                    let response = match registry.gather() {
                        Ok(metrics) => {
                            let mut response = text_response(StatusCode::OK, Body::from(metrics));
                            response.headers_mut().insert(
                                hyper::header::CONTENT_TYPE,
                                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                            );
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, Body::empty())
                        }
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_service);

    info!(
        "Metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

fn text_response(status: StatusCode, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
