//! Observability metrics for reconciliation.
//!
//! Metrics are recorded through the `metrics` crate facade; the operator
//! binary installs a Prometheus exporter.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `keel_reconcile_total` | Counter | `controller`, `result` | Reconcile invocations by outcome |
//! | `keel_reconcile_duration_seconds` | Histogram | `controller` | Reconcile latency |
//! | `keel_side_effects_total` | Counter | `controller`, `effect` | State-advancing writes and remote calls |
//! | `keel_reconcile_retries_total` | Counter | `controller`, `class` | Failed reconciles by error class |
//! | `keel_queue_depth` | Gauge | `controller` | Keys waiting in the work queue |
//! | `keel_fanout_entries` | Gauge | `controller`, `record`, `phase` | Fan-out entries of one record by phase after a write |
//! | `keel_artifact_frames_total` | Counter | `result` | Artifact frames sent |
//! | `keel_artifact_bytes_total` | Counter | - | Artifact payload bytes sent |

use std::time::Instant;

use keel_core::id::RecordKey;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Reconcile invocations by outcome.
    pub const RECONCILE_TOTAL: &str = "keel_reconcile_total";
    /// Histogram: Reconcile latency in seconds.
    pub const RECONCILE_DURATION_SECONDS: &str = "keel_reconcile_duration_seconds";
    /// Counter: Side effects performed.
    pub const SIDE_EFFECTS_TOTAL: &str = "keel_side_effects_total";
    /// Counter: Failed reconciles by class.
    pub const RETRIES_TOTAL: &str = "keel_reconcile_retries_total";
    /// Gauge: Keys waiting in the work queue.
    pub const QUEUE_DEPTH: &str = "keel_queue_depth";
    /// Gauge: Fan-out entries by phase.
    pub const FANOUT_ENTRIES: &str = "keel_fanout_entries";
    /// Counter: Artifact frames sent.
    pub const ARTIFACT_FRAMES_TOTAL: &str = "keel_artifact_frames_total";
    /// Counter: Artifact payload bytes sent.
    pub const ARTIFACT_BYTES_TOTAL: &str = "keel_artifact_bytes_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Controller name.
    pub const CONTROLLER: &str = "controller";
    /// Outcome (done, requeue, error).
    pub const RESULT: &str = "result";
    /// Side effect performed.
    pub const EFFECT: &str = "effect";
    /// Error class.
    pub const CLASS: &str = "class";
    /// Fan-out phase.
    pub const PHASE: &str = "phase";
    /// Record key (`namespace/name`).
    pub const RECORD: &str = "record";
}

/// Registers descriptions for every reconcile metric.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!(names::RECONCILE_TOTAL, "Reconcile invocations by outcome");
    describe_histogram!(
        names::RECONCILE_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Reconcile latency"
    );
    describe_counter!(
        names::SIDE_EFFECTS_TOTAL,
        "State-advancing writes and remote calls"
    );
    describe_counter!(names::RETRIES_TOTAL, "Failed reconciles by error class");
    describe_gauge!(names::QUEUE_DEPTH, "Keys waiting in the work queue");
    describe_gauge!(names::FANOUT_ENTRIES, "Fan-out entries by phase");
    describe_counter!(names::ARTIFACT_FRAMES_TOTAL, "Artifact frames sent");
    describe_counter!(
        names::ARTIFACT_BYTES_TOTAL,
        metrics::Unit::Bytes,
        "Artifact payload bytes sent"
    );
}

/// Records per-controller reconcile metrics.
#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    controller: &'static str,
}

impl ControllerMetrics {
    /// Creates a recorder for `controller`.
    #[must_use]
    pub const fn new(controller: &'static str) -> Self {
        Self { controller }
    }

    /// Records a finished reconcile.
    pub fn record_reconcile(&self, result: &'static str, started: Instant) {
        counter!(
            names::RECONCILE_TOTAL,
            labels::CONTROLLER => self.controller,
            labels::RESULT => result,
        )
        .increment(1);
        histogram!(
            names::RECONCILE_DURATION_SECONDS,
            labels::CONTROLLER => self.controller,
        )
        .record(started.elapsed().as_secs_f64());
    }

    /// Records one side effect.
    pub fn record_effect(&self, effect: &'static str) {
        counter!(
            names::SIDE_EFFECTS_TOTAL,
            labels::CONTROLLER => self.controller,
            labels::EFFECT => effect,
        )
        .increment(1);
    }

    /// Records a failed reconcile that will be retried or parked.
    pub fn record_retry(&self, class: &'static str) {
        counter!(
            names::RETRIES_TOTAL,
            labels::CONTROLLER => self.controller,
            labels::CLASS => class,
        )
        .increment(1);
    }

    /// Sets the queue depth gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_queue_depth(&self, depth: usize) {
        gauge!(names::QUEUE_DEPTH, labels::CONTROLLER => self.controller).set(depth as f64);
    }

    /// Sets the fan-out entry gauge of one record for one phase.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_fanout_entries(&self, record: &RecordKey, phase: &'static str, count: usize) {
        gauge!(
            names::FANOUT_ENTRIES,
            labels::CONTROLLER => self.controller,
            labels::RECORD => record.to_string(),
            labels::PHASE => phase,
        )
        .set(count as f64);
    }
}

/// Records artifact transfer metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferMetrics;

impl TransferMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records one frame sent.
    pub fn record_frame(&self, bytes: usize) {
        counter!(names::ARTIFACT_FRAMES_TOTAL, labels::RESULT => "sent").increment(1);
        counter!(names::ARTIFACT_BYTES_TOTAL).increment(bytes as u64);
    }

    /// Records an aborted push.
    pub fn record_aborted(&self) {
        counter!(names::ARTIFACT_FRAMES_TOTAL, labels::RESULT => "aborted").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};

    /// Captures the keys of registered gauges.
    #[derive(Default)]
    struct GaugeKeys(Mutex<Vec<Key>>);

    impl Recorder for GaugeKeys {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            self.0.lock().unwrap().push(key.clone());
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn recording_without_exporter_is_a_noop() {
        describe_metrics();
        let metrics = ControllerMetrics::new("entity");
        metrics.record_reconcile("done", Instant::now());
        metrics.record_effect("finalizer_add");
        metrics.record_retry("unavailable");
        metrics.set_queue_depth(3);
        metrics.set_fanout_entries(&RecordKey::new("network", "devicesim"), "installed", 2);
        TransferMetrics::new().record_frame(4096);
        TransferMetrics::new().record_aborted();
    }

    #[test]
    fn metric_names_share_prefix() {
        for name in [
            names::RECONCILE_TOTAL,
            names::RECONCILE_DURATION_SECONDS,
            names::SIDE_EFFECTS_TOTAL,
            names::RETRIES_TOTAL,
            names::QUEUE_DEPTH,
            names::FANOUT_ENTRIES,
            names::ARTIFACT_FRAMES_TOTAL,
            names::ARTIFACT_BYTES_TOTAL,
        ] {
            assert!(name.starts_with("keel_"), "{name}");
        }
    }

    #[test]
    fn fanout_gauges_are_kept_per_record() {
        let recorder = GaugeKeys::default();
        let controller = ControllerMetrics::new("model");
        metrics::with_local_recorder(&recorder, || {
            controller.set_fanout_entries(&RecordKey::new("network", "devicesim"), "installed", 2);
            controller.set_fanout_entries(&RecordKey::new("network", "testdevice"), "installed", 1);
        });

        let keys = recorder.0.lock().unwrap();
        let records: Vec<String> = keys
            .iter()
            .filter_map(|key| {
                key.labels()
                    .find(|label| label.key() == labels::RECORD)
                    .map(|label| label.value().to_string())
            })
            .collect();
        assert_eq!(records, ["network/devicesim", "network/testdevice"]);
    }
}
