//! Platform metrics.
//!
//! One registry handle shared by every component. Exports in two formats:
//! Prometheus text exposition and a JSON rendering of the same families,
//! selected by the `format` query on `/api/platform/metrics`.

use std::sync::Arc;
use std::time::Duration;

use prometheus::proto::MetricType;
use prometheus::{
    exponential_buckets, histogram_opts, opts, Encoder, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Registry, TextEncoder,
};
use tokio_util::sync::CancellationToken;

use noplacelike_core::service::BoxFuture;
use noplacelike_core::{HealthState, PlatformError, Service};

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub struct Metrics {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_requests_in_flight: IntGauge,
    pub events_published_total: IntCounter,
    pub events_dropped_total: IntCounter,
    pub peers_known: IntGauge,
    pub peer_messages_sent_total: IntCounter,
    pub peer_messages_received_total: IntCounter,
    pub resources_registered: IntGauge,
    pub plugins_started: IntGauge,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            opts!("noplacelike_http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )
        .expect("metric can be created");
        let http_request_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "noplacelike_http_request_duration_seconds",
                "HTTP request duration in seconds",
                exponential_buckets(0.001, 2.0, 14).expect("static buckets")
            ),
            &["method", "path"],
        )
        .expect("metric can be created");
        let http_requests_in_flight = IntGauge::new(
            "noplacelike_http_requests_in_flight",
            "HTTP requests currently being processed",
        )
        .expect("metric can be created");
        let events_published_total = IntCounter::new(
            "noplacelike_events_published_total",
            "Events accepted by the bus",
        )
        .expect("metric can be created");
        let events_dropped_total = IntCounter::new(
            "noplacelike_events_dropped_total",
            "Buffered event deliveries evicted by backpressure",
        )
        .expect("metric can be created");
        let peers_known = IntGauge::new("noplacelike_peers_known", "Peers currently in the table")
            .expect("metric can be created");
        let peer_messages_sent_total = IntCounter::new(
            "noplacelike_peer_messages_sent_total",
            "Messages written to peer channels",
        )
        .expect("metric can be created");
        let peer_messages_received_total = IntCounter::new(
            "noplacelike_peer_messages_received_total",
            "Messages read from peer channels",
        )
        .expect("metric can be created");
        let resources_registered = IntGauge::new(
            "noplacelike_resources_registered",
            "Resources currently registered",
        )
        .expect("metric can be created");
        let plugins_started =
            IntGauge::new("noplacelike_plugins_started", "Plugins in the Started state")
                .expect("metric can be created");

        for collector in [
            Box::new(http_requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(http_request_duration_seconds.clone()),
            Box::new(http_requests_in_flight.clone()),
            Box::new(events_published_total.clone()),
            Box::new(events_dropped_total.clone()),
            Box::new(peers_known.clone()),
            Box::new(peer_messages_sent_total.clone()),
            Box::new(peer_messages_received_total.clone()),
            Box::new(resources_registered.clone()),
            Box::new(plugins_started.clone()),
        ] {
            registry.register(collector).expect("metric can be registered");
        }

        Arc::new(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            http_requests_in_flight,
            events_published_total,
            events_dropped_total,
            peers_known,
            peer_messages_sent_total,
            peer_messages_received_total,
            resources_registered,
            plugins_started,
        })
    }

    /// Record one finished HTTP request.
    pub fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Prometheus text exposition of every registered family.
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&families, &mut buffer) {
            tracing::error!(%err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// JSON rendering of the same families.
    pub fn render_json(&self) -> serde_json::Value {
        let mut families = serde_json::Map::new();
        for family in self.registry.gather() {
            let mut samples = Vec::new();
            for metric in family.get_metric() {
                let labels: serde_json::Map<String, serde_json::Value> = metric
                    .get_label()
                    .iter()
                    .map(|pair| {
                        (
                            pair.get_name().to_string(),
                            serde_json::Value::String(pair.get_value().to_string()),
                        )
                    })
                    .collect();
                let value = match family.get_field_type() {
                    MetricType::COUNTER => serde_json::json!(metric.get_counter().value()),
                    MetricType::GAUGE => serde_json::json!(metric.get_gauge().value()),
                    MetricType::HISTOGRAM => {
                        let histogram = metric.get_histogram();
                        serde_json::json!({
                            "count": histogram.get_sample_count(),
                            "sum": histogram.get_sample_sum(),
                        })
                    }
                    _ => serde_json::Value::Null,
                };
                samples.push(serde_json::json!({ "labels": labels, "value": value }));
            }
            families.insert(
                family.get_name().to_string(),
                serde_json::json!({
                    "help": family.get_help(),
                    "type": format!("{:?}", family.get_field_type()).to_lowercase(),
                    "metrics": samples,
                }),
            );
        }
        serde_json::Value::Object(families)
    }
}

impl Service for Metrics {
    fn name(&self) -> &str {
        "metrics"
    }

    fn start(&self, _shutdown: CancellationToken) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    /// Final flush: log the rendered snapshot so the last state survives
    /// in the logs after shutdown.
    fn stop(&self, _deadline: Duration) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async move {
            tracing::debug!(
                families = self.registry.gather().len(),
                "metrics flushed at shutdown"
            );
            Ok(())
        })
    }

    fn health(&self) -> BoxFuture<'_, HealthState> {
        Box::pin(async { HealthState::Healthy })
    }
}
