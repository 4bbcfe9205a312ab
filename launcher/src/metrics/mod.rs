//! Launch metrics
//!
//! Recorded through the `metrics` facade; the embedding service installs the
//! recorder and owns exposition.

use metrics::{counter, histogram};

/// Record the start of a launch
pub fn record_launch_started(application: &str) {
    counter!("appvm_launches_total", "application" => application.to_string()).increment(1);
}

/// Record a successful launch
pub fn record_launch_succeeded(application: &str, duration_secs: f64) {
    counter!("appvm_launches_success_total", "application" => application.to_string()).increment(1);
    histogram!("appvm_launch_duration_seconds", "application" => application.to_string()).record(duration_secs);
}

/// Record a failed launch by the stage that failed
pub fn record_launch_failed(application: &str, stage: &'static str) {
    counter!(
        "appvm_launch_failures_total",
        "application" => application.to_string(),
        "stage" => stage
    )
    .increment(1);
}

/// Record a launch of an application with no dedicated image
pub fn record_unknown_application(application: &str) {
    counter!("appvm_unknown_application_total", "application" => application.to_string()).increment(1);
}
