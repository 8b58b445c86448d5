//! Prometheus metrics for the counters and gauges this core actually
//! produces: request/route counts, transform and provider failures, active
//! stream gauge, request duration histogram.

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("modelmux_requests_total", "Total inbound requests by route class"),
        &["route_class"],
    )
    .expect("metric names are valid");

    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("modelmux_request_duration_seconds", "Request handling latency"),
        &["route_class"],
    )
    .expect("metric names are valid");

    pub static ref TRANSFORM_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("modelmux_transform_failures_total", "Transformer chain failures by step"),
        &["step"],
    )
    .expect("metric names are valid");

    pub static ref PROVIDER_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("modelmux_provider_failures_total", "Non-2xx responses by provider"),
        &["provider"],
    )
    .expect("metric names are valid");

    pub static ref ACTIVE_STREAMS: IntGauge = IntGauge::new(
        "modelmux_active_streams", "Currently open SSE streams to providers",
    )
    .expect("metric names are valid");
}

/// Registers every collector once. Called from `main` before the server
/// starts; a second call would panic on duplicate registration, so this is
/// idempotent-by-convention (call exactly once).
pub fn register() {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(REQUEST_DURATION.clone())).ok();
    REGISTRY.register(Box::new(TRANSFORM_FAILURES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(PROVIDER_FAILURES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(ACTIVE_STREAMS.clone())).ok();
}

pub fn render() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("prometheus text encoding does not fail");
    String::from_utf8(buffer).expect("prometheus text encoding is valid utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_names() {
        register();
        REQUESTS_TOTAL.with_label_values(&["default"]).inc();
        let text = render();
        assert!(text.contains("modelmux_requests_total"));
    }
}
