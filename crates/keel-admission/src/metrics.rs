//! Admission metrics.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `keel_admission_total` | Counter | `result` | Admission responses by result |
//! | `keel_admission_duration_seconds` | Histogram | - | Time spent mutating a workload |

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Admission responses by result.
    pub const ADMISSION_TOTAL: &str = "keel_admission_total";
    /// Histogram: Mutation latency in seconds.
    pub const ADMISSION_DURATION_SECONDS: &str = "keel_admission_duration_seconds";
}

/// Registers descriptions for admission metrics.
pub fn describe_metrics() {
    describe_counter!(names::ADMISSION_TOTAL, "Admission responses by result");
    describe_histogram!(
        names::ADMISSION_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time spent mutating a workload"
    );
}

/// Records one admission response.
pub fn record_admission(result: &'static str, elapsed: Duration) {
    counter!(names::ADMISSION_TOTAL, "result" => result).increment(1);
    histogram!(names::ADMISSION_DURATION_SECONDS).record(elapsed.as_secs_f64());
}
