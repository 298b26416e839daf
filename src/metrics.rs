use crate::error::{Error, Result};
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramOpts,
    HistogramVec, TextEncoder,
};
use std::time::Duration;

lazy_static::lazy_static! {
    // Transaction outcomes as seen by the initiator
    static ref TXN_COUNTER: CounterVec = register_counter_vec!(
        "cluster_txn_transactions_total",
        "Total number of transactions run by this node as initiator",
        &["outcome"]
    ).unwrap();

    static ref TXN_LATENCY: HistogramVec = register_histogram_vec!(
        HistogramOpts::new(
            "cluster_txn_transaction_duration_seconds",
            "Wall-clock time from publish to completion"
        ).buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        &["outcome"]
    ).unwrap();

    // Step executions on the local node
    static ref STEP_COUNTER: CounterVec = register_counter_vec!(
        "cluster_txn_steps_total",
        "Step do/undo executions on this node",
        &["kind", "result"]
    ).unwrap();

    static ref CTX_COUNTER: CounterVec = register_counter_vec!(
        "cluster_txn_ctx_operations_total",
        "Transaction context store operations",
        &["operation"]
    ).unwrap();

    static ref ROLLBACK_COUNTER: CounterVec = register_counter_vec!(
        "cluster_txn_rollbacks_total",
        "Local rollbacks performed",
        &["trigger"]
    ).unwrap();

    static ref GC_COUNTER: CounterVec = register_counter_vec!(
        "cluster_txn_gc_actions_total",
        "Cleanup actions performed by the elected leader",
        &["action"]
    ).unwrap();
}

pub fn record_txn_outcome(outcome: &str, elapsed: Duration) {
    TXN_COUNTER.with_label_values(&[outcome]).inc();
    TXN_LATENCY
        .with_label_values(&[outcome])
        .observe(elapsed.as_secs_f64());
}

pub fn record_step(kind: &str, success: bool) {
    let result = if success { "success" } else { "failure" };
    STEP_COUNTER.with_label_values(&[kind, result]).inc();
}

pub fn record_ctx_op(operation: &str) {
    CTX_COUNTER.with_label_values(&[operation]).inc();
}

pub fn record_rollback(trigger: &str) {
    ROLLBACK_COUNTER.with_label_values(&[trigger]).inc();
}

pub fn record_gc(action: &str, count: usize) {
    if count > 0 {
        GC_COUNTER.with_label_values(&[action]).inc_by(count as f64);
    }
}

// Export metrics in Prometheus format
pub fn export() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Generic(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| Error::Generic(format!("Failed to convert metrics to string: {}", e)))
}
