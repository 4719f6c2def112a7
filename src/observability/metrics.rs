//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by host, status
//! - `gateway_request_duration_seconds` (histogram): dispatch latency by host
//! - `gateway_script_errors_total` (counter): failed handler runs by host
//! - `gateway_vhost_cache_total` (counter): cache lookups by result (hit, miss)
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - Prometheus exporter only runs when enabled in config

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start the Prometheus scrape endpoint and install the global recorder.
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint started");
    Ok(())
}

/// Record one dispatched request.
pub fn record_request(host: &str, status: u16, start: Instant) {
    let host = host.to_string();
    metrics::counter!("gateway_requests_total", "host" => host.clone(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "host" => host)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_script_error(host: &str) {
    metrics::counter!("gateway_script_errors_total", "host" => host.to_string()).increment(1);
}

pub fn record_vhost_cache(result: &'static str) {
    metrics::counter!("gateway_vhost_cache_total", "result" => result).increment(1);
}
