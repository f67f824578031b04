//! Metrics module
//!
//! Prometheus counters and histograms for uploads, variants and removals.
//! Metrics live in the default registry; [`gather_text`] renders them in the
//! text exposition format for whatever endpoint the host application serves.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_fanout_uploads_total",
        "Total number of handled uploads",
        &["bucket", "mode", "status"]  // mode: "single" or "variants"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "mizuchi_fanout_upload_duration_seconds",
        "Upload duration in seconds, all variants included",
        &["bucket", "mode"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();

    pub static ref SOURCE_BYTES_TOTAL: Counter = register_counter!(
        "mizuchi_fanout_source_bytes_total",
        "Total bytes read from upload sources"
    ).unwrap();

    // Variant metrics
    pub static ref VARIANTS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_fanout_variants_total",
        "Total pipeline runs by outcome",
        &["bucket", "status"]
    ).unwrap();

    pub static ref STORED_BYTES_TOTAL: Counter = register_counter!(
        "mizuchi_fanout_stored_bytes_total",
        "Total bytes written to the object store"
    ).unwrap();

    // Removal metrics
    pub static ref REMOVALS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_fanout_removals_total",
        "Total object removals",
        &["bucket", "status"]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_fanout_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a handled upload
pub fn record_upload(bucket: &str, mode: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "failure" };
    UPLOADS_TOTAL.with_label_values(&[bucket, mode, status]).inc();
    UPLOAD_DURATION
        .with_label_values(&[bucket, mode])
        .observe(duration_secs);
}

/// Record bytes read from an upload source
pub fn record_source_bytes(bytes: u64) {
    SOURCE_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a stored variant
pub fn record_variant_success(bucket: &str, bytes: u64) {
    VARIANTS_TOTAL.with_label_values(&[bucket, "success"]).inc();
    STORED_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed variant
///
/// `kind` is the error class, e.g. "transform" or "cancelled".
pub fn record_variant_failure(bucket: &str, kind: &str) {
    let status = if kind == "cancelled" { "cancelled" } else { "failure" };
    VARIANTS_TOTAL.with_label_values(&[bucket, status]).inc();
    record_error(kind);
}

/// Record an object removal
pub fn record_removal(bucket: &str, status: &str) {
    REMOVALS_TOTAL.with_label_values(&[bucket, status]).inc();
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Render the default registry in the Prometheus text format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
