//! Worker metrics.
//!
//! Exported through Prometheus when `METRICS_ADDR` is set; otherwise the
//! recording calls are no-ops.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use vconv_models::ProcessingStage;

/// Metric name constants for consistency.
pub mod names {
    /// Handled deliveries by outcome.
    pub const TASKS_TOTAL: &str = "vconv_tasks_total";

    /// Failure records by pipeline stage.
    pub const STAGE_FAILURES_TOTAL: &str = "vconv_stage_failures_total";

    /// Wall time of one delivery by outcome.
    pub const TASK_DURATION_SECONDS: &str = "vconv_task_duration_seconds";

    /// Deliveries currently being handled.
    pub const TASKS_IN_FLIGHT: &str = "vconv_tasks_in_flight";

    /// Acknowledgements that failed after retries.
    pub const ACK_FAILURES_TOTAL: &str = "vconv_ack_failures_total";

    /// Stale messages taken over from other consumers.
    pub const CLAIMED_TOTAL: &str = "vconv_claimed_messages_total";
}

/// Install the Prometheus recorder with an HTTP scrape endpoint on `addr`.
///
/// Must be called from within the Tokio runtime.
pub fn init_prometheus(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

pub fn record_outcome(outcome: &'static str, duration_secs: f64) {
    counter!(names::TASKS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::TASK_DURATION_SECONDS, "outcome" => outcome).record(duration_secs);
}

pub fn record_stage_failure(stage: ProcessingStage) {
    counter!(names::STAGE_FAILURES_TOTAL, "stage" => stage.as_str()).increment(1);
}

pub fn task_started() {
    gauge!(names::TASKS_IN_FLIGHT).increment(1.0);
}

pub fn task_finished() {
    gauge!(names::TASKS_IN_FLIGHT).decrement(1.0);
}

pub fn record_ack_failure() {
    counter!(names::ACK_FAILURES_TOTAL).increment(1);
}

pub fn record_claimed(count: usize) {
    counter!(names::CLAIMED_TOTAL).increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        for name in [
            names::TASKS_TOTAL,
            names::STAGE_FAILURES_TOTAL,
            names::TASK_DURATION_SECONDS,
            names::TASKS_IN_FLIGHT,
            names::ACK_FAILURES_TOTAL,
            names::CLAIMED_TOTAL,
        ] {
            assert!(name.starts_with("vconv_"));
        }
    }
}
