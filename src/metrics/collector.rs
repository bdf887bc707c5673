// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Text exposition of every registered metric.
    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,

    // Failover metrics
    pub backend_retries_total: IntCounterVec,
    pub backend_demotions_total: IntCounterVec,
    pub unavailable_total: IntCounter,

    // Backend liveness
    pub backend_alive: IntGaugeVec,
    pub alive_backends: IntGauge,
    pub total_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Total number of requests by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let backend_retries_total = IntCounterVec::new(
            Opts::new(
                "lb_backend_retries_total",
                "Same-backend retries after a forwarding failure",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_retries_total.clone()))?;

        let backend_demotions_total = IntCounterVec::new(
            Opts::new(
                "lb_backend_demotions_total",
                "Backends marked down after exhausting retries",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_demotions_total.clone()))?;

        let unavailable_total = IntCounter::new(
            "lb_unavailable_total",
            "Requests answered with 503 because no backend was alive",
        )?;
        registry.register(Box::new(unavailable_total.clone()))?;

        let backend_alive = IntGaugeVec::new(
            Opts::new("lb_backend_alive", "Backend liveness (1=up, 0=down)"),
            &["backend"],
        )?;
        registry.register(Box::new(backend_alive.clone()))?;

        let alive_backends = IntGauge::new("lb_alive_backends", "Number of alive backends")?;
        registry.register(Box::new(alive_backends.clone()))?;

        let total_backends = IntGauge::new("lb_total_backends", "Total number of backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        Ok(Self {
            requests_total,
            backend_retries_total,
            backend_demotions_total,
            unavailable_total,
            backend_alive,
            alive_backends,
            total_backends,
        })
    }

    pub fn record_request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
        if outcome == "unavailable" || outcome == "exhausted" {
            self.unavailable_total.inc();
        }
    }

    pub fn record_retry(&self, backend: &str) {
        self.backend_retries_total.with_label_values(&[backend]).inc();
    }

    pub fn record_demotion(&self, backend: &str) {
        self.backend_demotions_total.with_label_values(&[backend]).inc();
    }

    pub fn update_backend_health(&self, backend: &str, alive: bool) {
        let value = if alive { 1 } else { 0 };
        self.backend_alive.with_label_values(&[backend]).set(value);
    }

    pub fn update_backend_counts(&self, alive: usize, total: usize) {
        self.alive_backends.set(alive as i64);
        self.total_backends.set(total as i64);
    }
}
