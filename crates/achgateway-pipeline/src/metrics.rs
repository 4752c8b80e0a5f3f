//! Observability metrics for the aggregation pipeline.
//!
//! Exposed via the `metrics` crate facade; install a recorder (e.g. the
//! Prometheus exporter) in the embedding binary to export them.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `achgateway_uploaded_files_total` | Counter | `shard` | Files delivered to the remote agent |
//! | `achgateway_upload_errors_total` | Counter | `shard` | Failures in filename render, format, audit write, or upload |
//! | `achgateway_cutoff_duration_seconds` | Histogram | `shard` | Wall time of one cutoff run |
//! | `achgateway_notification_retries_total` | Counter | - | Transient notification failures retried |

use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: files delivered to the remote agent.
    pub const UPLOADED_FILES_TOTAL: &str = "achgateway_uploaded_files_total";
    /// Counter: upload-path failures.
    pub const UPLOAD_ERRORS_TOTAL: &str = "achgateway_upload_errors_total";
    /// Histogram: wall time of one cutoff run in seconds.
    pub const CUTOFF_DURATION_SECONDS: &str = "achgateway_cutoff_duration_seconds";
    /// Counter: transient notification failures retried.
    pub const NOTIFICATION_RETRIES_TOTAL: &str = "achgateway_notification_retries_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Shard name.
    pub const SHARD: &str = "shard";
}

/// Recorder for pipeline metrics; cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Creates a metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records one successful remote delivery.
    pub fn record_uploaded(&self, shard: &str) {
        counter!(
            names::UPLOADED_FILES_TOTAL,
            labels::SHARD => shard.to_string(),
        )
        .increment(1);
    }

    /// Records a failure anywhere on the upload path.
    pub fn record_upload_error(&self, shard: &str) {
        counter!(
            names::UPLOAD_ERRORS_TOTAL,
            labels::SHARD => shard.to_string(),
        )
        .increment(1);
    }

    /// Records the wall time of one cutoff run.
    pub fn observe_cutoff_duration(&self, shard: &str, duration: Duration) {
        histogram!(
            names::CUTOFF_DURATION_SECONDS,
            labels::SHARD => shard.to_string(),
        )
        .record(duration.as_secs_f64());
    }
}
