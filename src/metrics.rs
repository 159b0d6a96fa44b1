//! Prometheus collectors for the delivery pipeline, on an owned registry.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::{Error, Result, pool::PoolStats};

pub struct Metrics {
    registry: Registry,
    /// Labels: channel, tenant, status.
    pub sends_total: IntCounterVec,
    /// Labels: channel, outcome.
    pub job_duration_seconds: HistogramVec,
    pub queue_depth: IntGauge,
    /// Labels: state (`idle`, `leased`, `temporary`).
    pub pool_connections: IntGaugeVec,
    /// Labels: tenant.
    pub rate_limit_rejections_total: IntCounterVec,
    pub dead_letters: IntGauge,
    pub consumer_restarts_total: IntCounter,
    /// Labels: result.
    pub outbox_events_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("delivery".to_string()), None)
            .map_err(metrics_error)?;

        let sends_total = IntCounterVec::new(
            Opts::new("sends_total", "Send attempts by channel, tenant and outcome"),
            &["channel", "tenant", "status"],
        )
        .map_err(metrics_error)?;

        let job_duration_seconds = HistogramVec::new(
            HistogramOpts::new("job_duration_seconds", "Dispatch job processing time"),
            &["channel", "outcome"],
        )
        .map_err(metrics_error)?;

        let queue_depth = IntGauge::new("queue_depth", "Jobs waiting in the dispatch queue")
            .map_err(metrics_error)?;

        let pool_connections = IntGaugeVec::new(
            Opts::new("pool_connections", "Transport connections by state"),
            &["state"],
        )
        .map_err(metrics_error)?;

        let rate_limit_rejections_total = IntCounterVec::new(
            Opts::new("rate_limit_rejections_total", "Requests denied admission"),
            &["tenant"],
        )
        .map_err(metrics_error)?;

        let dead_letters = IntGauge::new("dead_letters", "Quarantined notifications")
            .map_err(metrics_error)?;

        let consumer_restarts_total =
            IntCounter::new("consumer_restarts_total", "Broker consumer restarts")
                .map_err(metrics_error)?;

        let outbox_events_total = IntCounterVec::new(
            Opts::new("outbox_events_total", "Outbox events relayed downstream"),
            &["result"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(sends_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(job_duration_seconds.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(pool_connections.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rate_limit_rejections_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(dead_letters.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(consumer_restarts_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(outbox_events_total.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            sends_total,
            job_duration_seconds,
            queue_depth,
            pool_connections,
            rate_limit_rejections_total,
            dead_letters,
            consumer_restarts_total,
            outbox_events_total,
        })
    }

    pub fn record_pool(&self, stats: &PoolStats) {
        self.pool_connections
            .with_label_values(&["idle"])
            .set(stats.idle as i64);
        self.pool_connections
            .with_label_values(&["leased"])
            .set(stats.leased as i64);
        self.pool_connections
            .with_label_values(&["temporary"])
            .set(stats.temporary_leased as i64);
    }

    /// Prometheus text exposition of every registered collector.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;

        String::from_utf8(buffer).map_err(|e| Error::Configuration(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Configuration(format!("metrics: {}", err))
}
