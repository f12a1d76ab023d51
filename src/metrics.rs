//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Per-peer HTTP operation counts and latency
//! - Documents read, written, and failed
//! - Changes-feed batches
//! - Checkpoints recorded
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, histograms track durations in
//! seconds.

use metrics::{counter, histogram};
use std::time::Duration;

/// Record one HTTP operation against a peer.
pub fn record_peer_request(peer: &str, operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_peer_requests_total",
        "peer" => peer.to_string(),
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record the latency of an HTTP operation against a peer.
pub fn record_peer_request_latency(peer: &str, operation: &str, latency: Duration) {
    histogram!(
        "replication_peer_request_seconds",
        "peer" => peer.to_string(),
        "operation" => operation.to_string()
    )
    .record(latency.as_secs_f64());
}

/// Record rows received in one changes batch.
pub fn record_changes_rows(peer: &str, count: usize) {
    counter!("replication_changes_rows_total", "peer" => peer.to_string())
        .increment(count as u64);
}

/// Record documents read from the source.
pub fn record_docs_read(count: u64) {
    counter!("replication_docs_read_total").increment(count);
}

/// Record documents written to the target.
pub fn record_docs_written(count: u64) {
    counter!("replication_docs_written_total").increment(count);
}

/// Record failed document writes.
pub fn record_doc_write_failures(count: u64) {
    counter!("replication_doc_write_failures_total").increment(count);
}

/// Record a checkpoint persisted at a peer.
pub fn record_checkpoint(peer: &str) {
    counter!("replication_checkpoints_recorded_total", "peer" => peer.to_string())
        .increment(1);
}
