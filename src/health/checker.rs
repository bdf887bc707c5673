// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::ServerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::info;

/// Background task that re-probes the whole pool on a fixed interval.
pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: Arc<ServerPool>,
    metrics: Option<Arc<MetricsCollector>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        pool: Arc<ServerPool>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            pool,
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Runs until `shutdown` is called. The first pass happens one interval in.
    pub async fn start(self: Arc<Self>) {
        let period = self.config.interval();
        let mut ticker = health_ticker(period);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!("Starting health checker with interval: {:?}", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all_backends().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One full pass over the pool.
    pub async fn check_all_backends(&self) -> usize {
        info!("Starting health check...");
        let alive = self.pool.health_check_all(self.config.timeout()).await;

        if let Some(metrics) = &self.metrics {
            for backend in self.pool.backends() {
                metrics.update_backend_health(backend.url.as_str(), backend.is_alive().await);
            }
            metrics.update_backend_counts(alive, self.pool.len());
        }

        info!("Health check completed: {}/{} backends up", alive, self.pool.len());
        alive
    }
}

/// First tick one `period` from now. A pass slower than the interval skips
/// the missed ticks instead of bursting.
fn health_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
