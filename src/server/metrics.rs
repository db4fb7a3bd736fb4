//! Prometheus metrics for the drain controller

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Drain durations span seconds (empty node) up to the full drain budget
const DRAIN_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Controller metrics, registered in a private registry
pub struct ControllerMetrics {
    registry: Registry,
    triggers: IntCounterVec,
    drains: IntCounterVec,
    drain_duration: Histogram,
    evictions: IntCounterVec,
    uncordons: IntCounterVec,
    watch_restarts: IntCounterVec,
}

/// Metrics handle shared between the server, the watch loops and the queue
pub type SharedMetrics = Arc<ControllerMetrics>;

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let triggers = IntCounterVec::new(
            Opts::new(
                "autodrain_triggers_total",
                "Node actions queued, by detection source and action",
            ),
            &["source", "action"],
        )?;
        registry.register(Box::new(triggers.clone()))?;

        let drains = IntCounterVec::new(
            Opts::new("autodrain_drains_total", "Completed drains by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(drains.clone()))?;

        let drain_duration = Histogram::with_opts(
            HistogramOpts::new(
                "autodrain_drain_duration_seconds",
                "Wall-clock duration of drains",
            )
            .buckets(DRAIN_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(drain_duration.clone()))?;

        let evictions = IntCounterVec::new(
            Opts::new("autodrain_evictions_total", "Pod eviction requests by result"),
            &["result"],
        )?;
        registry.register(Box::new(evictions.clone()))?;

        let uncordons = IntCounterVec::new(
            Opts::new("autodrain_uncordons_total", "Uncordon attempts by result"),
            &["result"],
        )?;
        registry.register(Box::new(uncordons.clone()))?;

        let watch_restarts = IntCounterVec::new(
            Opts::new(
                "autodrain_watch_restarts_total",
                "Watch subscriptions re-established after the stream ended",
            ),
            &["stream"],
        )?;
        registry.register(Box::new(watch_restarts.clone()))?;

        Ok(Self {
            registry,
            triggers,
            drains,
            drain_duration,
            evictions,
            uncordons,
            watch_restarts,
        })
    }

    pub fn record_trigger(&self, source: &str, action: &str) {
        self.triggers.with_label_values(&[source, action]).inc();
    }

    /// Record a finished drain (`outcome` is success, timeout or error)
    pub fn record_drain(&self, outcome: &str, duration_secs: f64) {
        self.drains.with_label_values(&[outcome]).inc();
        self.drain_duration.observe(duration_secs);
    }

    pub fn record_eviction(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.evictions.with_label_values(&[result]).inc();
    }

    pub fn record_uncordon(&self, result: &str) {
        self.uncordons.with_label_values(&[result]).inc();
    }

    pub fn record_watch_restart(&self, stream: &str) {
        self.watch_restarts.with_label_values(&[stream]).inc();
    }

    /// Encode all metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Create the shared metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
