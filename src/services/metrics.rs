use std::time::{Duration, Instant};

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::errors::Result;

pub struct MetricsService {
    registry: Registry,
    gate_decisions: IntCounterVec,
    replenishments: IntCounterVec,
    refunds: IntCounterVec,
    store_conflicts: IntCounter,
    request_duration: HistogramVec,
}

impl MetricsService {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("qdeli".to_string()), None)?;

        let gate_decisions = IntCounterVec::new(
            Opts::new("gate_decisions_total", "Feature gate decisions"),
            &["feature", "outcome"],
        )?;
        let replenishments = IntCounterVec::new(
            Opts::new("replenishments_total", "Scheduled balance top-ups applied"),
            &["point_type"],
        )?;
        let refunds = IntCounterVec::new(
            Opts::new("refunds_total", "Points returned after failed feature runs"),
            &["point_type"],
        )?;
        let store_conflicts = IntCounter::new(
            "store_conflicts_total",
            "Balance writes that lost an optimistic-concurrency race",
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "HTTP request latency"),
            &["endpoint", "status"],
        )?;

        registry.register(Box::new(gate_decisions.clone()))?;
        registry.register(Box::new(replenishments.clone()))?;
        registry.register(Box::new(refunds.clone()))?;
        registry.register(Box::new(store_conflicts.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            gate_decisions,
            replenishments,
            refunds,
            store_conflicts,
            request_duration,
        })
    }

    pub fn record_gate_decision(&self, feature: &str, outcome: &str) {
        self.gate_decisions.with_label_values(&[feature, outcome]).inc();
    }

    pub fn record_replenishment(&self, point_type: &str) {
        self.replenishments.with_label_values(&[point_type]).inc();
    }

    pub fn record_refund(&self, point_type: &str) {
        self.refunds.with_label_values(&[point_type]).inc();
    }

    pub fn record_store_conflict(&self) {
        self.store_conflicts.inc();
    }

    pub fn record_request_duration(&self, duration: Duration, endpoint: &str, status: u16) {
        self.request_duration
            .with_label_values(&[endpoint, &status.to_string()])
            .observe(duration.as_secs_f64());
    }

    /// Text exposition format for scraping.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| anyhow::Error::from(e).into())
    }
}

pub struct RequestTimer {
    start: Instant,
    endpoint: String,
}

impl RequestTimer {
    pub fn new(endpoint: String) -> Self {
        Self {
            start: Instant::now(),
            endpoint,
        }
    }

    pub fn finish(self, metrics: &MetricsService, status: u16) {
        metrics.record_request_duration(self.start.elapsed(), &self.endpoint, status);
    }
}
