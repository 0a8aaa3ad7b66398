//! Metrics collection and exposition.
//!
//! # Metrics
//! - `fastwire_client_dials_total` (counter): dial attempts by outcome
//! - `fastwire_client_pool_exhausted_total` (counter): acquires refused at the connection cap
//! - `fastwire_client_conns_closed_total` (counter): pooled connections closed, by reason
//! - `fastwire_client_retries_total` (counter): idempotent requests replayed
//! - `fastwire_pipeline_overflow_total` (counter): requests evicted or refused by a full queue
//! - `fastwire_server_requests_total` (counter): requests served
//! - `fastwire_server_rejected_total` (counter): connections refused, by reason
//! - `fastwire_server_workers` (gauge): live worker slots
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Starts the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(err) => tracing::error!(address = %addr, error = %err, "Failed to install Prometheus exporter"),
    }
}

pub fn record_dial(success: bool) {
    let outcome = if success { "ok" } else { "error" };
    metrics::counter!("fastwire_client_dials_total", "outcome" => outcome).increment(1);
}

pub fn record_pool_exhausted() {
    metrics::counter!("fastwire_client_pool_exhausted_total").increment(1);
}

pub fn record_conn_closed(reason: &'static str) {
    metrics::counter!("fastwire_client_conns_closed_total", "reason" => reason).increment(1);
}

pub fn record_retry() {
    metrics::counter!("fastwire_client_retries_total").increment(1);
}

pub fn record_pipeline_overflow() {
    metrics::counter!("fastwire_pipeline_overflow_total").increment(1);
}

pub fn record_request_served() {
    metrics::counter!("fastwire_server_requests_total").increment(1);
}

pub fn record_connection_rejected(reason: &'static str) {
    metrics::counter!("fastwire_server_rejected_total", "reason" => reason).increment(1);
}

pub fn record_workers(active: usize) {
    metrics::gauge!("fastwire_server_workers").set(active as f64);
}
