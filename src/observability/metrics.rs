//! Metrics collection and exposition.
//!
//! # Metrics
//! - `live_sync_connections_total` (counter): accepted subscription sockets
//! - `live_sync_active_connections` (gauge): current socket count
//! - `live_sync_dispatch_total` (counter): dispatch outcomes by `outcome`
//! - `live_sync_reconnects_total` (counter): client retries after 1006
//! - `live_sync_decode_errors_total` (counter): undecodable client frames
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - The Prometheus exporter is opt-in via `observability.metrics_enabled`

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to install Prometheus exporter: {0}")]
    Install(String),
}

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection() {
    metrics::counter!("live_sync_connections_total").increment(1);
}

pub fn record_active_connections(active: u64) {
    metrics::gauge!("live_sync_active_connections").set(active as f64);
}

pub fn record_dispatch(outcome: &'static str) {
    metrics::counter!("live_sync_dispatch_total", "outcome" => outcome).increment(1);
}

pub fn record_reconnect() {
    metrics::counter!("live_sync_reconnects_total").increment(1);
}

pub fn record_decode_error() {
    metrics::counter!("live_sync_decode_errors_total").increment(1);
}
