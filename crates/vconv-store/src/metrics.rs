//! Store metrics collection.

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Total store queries by operation and status.
    pub const QUERIES_TOTAL: &str = "vconv_store_queries_total";

    /// Query latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "vconv_store_latency_seconds";
}

/// Record metrics for a completed store query.
pub fn record_query(operation: &'static str, ok: bool, latency_secs: f64) {
    counter!(
        names::QUERIES_TOTAL,
        "operation" => operation,
        "status" => if ok { "ok" } else { "error" }
    )
    .increment(1);

    histogram!(names::LATENCY_SECONDS, "operation" => operation).record(latency_secs);
}
