//! Metrics collection and exposition.
//!
//! # Metrics
//! - `record_sync_api_requests_total` (counter): outbound calls by status
//! - `record_sync_api_request_duration_seconds` (histogram)
//! - `record_sync_rate_limit_wait_seconds` (histogram): forced waits
//! - `record_sync_circuit_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `record_sync_batches_total` (counter): batch outcomes by status
//! - `record_sync_runs_total` (counter): runs by mode and success
//! - `record_sync_records_added_total` / `record_sync_records_updated_total`
//! - `record_sync_triggers_total` (counter): next-batch triggers by kind and outcome

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::batch::trigger::TriggerOutcome;
use crate::coordinator::metrics::UpdateMetrics;
use crate::resilience::CircuitState;
use crate::store::{BatchStatus, SyncMode};

pub const API_REQUESTS_TOTAL: &str = "record_sync_api_requests_total";
pub const API_REQUEST_DURATION: &str = "record_sync_api_request_duration_seconds";
pub const RATE_LIMIT_WAIT: &str = "record_sync_rate_limit_wait_seconds";
pub const CIRCUIT_STATE: &str = "record_sync_circuit_state";
pub const BATCHES_TOTAL: &str = "record_sync_batches_total";
pub const RUNS_TOTAL: &str = "record_sync_runs_total";
pub const RECORDS_ADDED_TOTAL: &str = "record_sync_records_added_total";
pub const RECORDS_UPDATED_TOTAL: &str = "record_sync_records_updated_total";
pub const TRIGGERS_TOTAL: &str = "record_sync_triggers_total";

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, address = %addr, "Failed to install metrics exporter"),
    }
}

/// `status` is the HTTP status, or "error" for transport failures.
pub fn record_api_request(status: &str, started: Instant) {
    counter!(API_REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
    histogram!(API_REQUEST_DURATION).record(started.elapsed().as_secs_f64());
}

pub fn record_rate_limit_wait(waited: Duration) {
    histogram!(RATE_LIMIT_WAIT).record(waited.as_secs_f64());
}

pub fn record_circuit_state(name: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    gauge!(CIRCUIT_STATE, "breaker" => name.to_string()).set(value);
}

pub fn record_batch_outcome(status: BatchStatus) {
    counter!(BATCHES_TOTAL, "status" => status.to_string()).increment(1);
}

pub fn record_batch_superseded() {
    counter!(BATCHES_TOTAL, "status" => "superseded").increment(1);
}

pub fn record_run(mode: SyncMode, success: bool, run: &UpdateMetrics) {
    counter!(
        RUNS_TOTAL,
        "mode" => mode.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    counter!(RECORDS_ADDED_TOTAL).increment(run.records_added as u64);
    counter!(RECORDS_UPDATED_TOTAL).increment(run.records_updated as u64);
}

pub fn record_trigger(kind: &'static str, outcome: TriggerOutcome) {
    counter!(TRIGGERS_TOTAL, "kind" => kind, "outcome" => outcome.as_str()).increment(1);
}
