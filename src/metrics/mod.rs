//! Metrics module
//!
//! Prometheus counters and histograms for S3 requests and uploads. Nothing
//! here serves them; callers scrape the default registry with [`gather`].

use crate::s3::ErrorKind;
use crate::upload::SessionState;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    pub static ref S3_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_s3_requests_total",
        "S3 requests by operation and HTTP status",
        &["operation", "status"]
    ).unwrap();

    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_uploads_total",
        "Finished uploads by strategy and outcome",
        &["bucket", "strategy", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_upload_bytes_total",
        "Bytes stored by successful uploads",
        &["bucket"]
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "mizuchi_upload_duration_seconds",
        "Wall time of one upload call",
        &["bucket", "strategy"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0, 1800.0]
    ).unwrap();

    // A session ends completed, aborted, or left open for resume
    pub static ref MULTIPART_SESSIONS: CounterVec = register_counter_vec!(
        "mizuchi_multipart_sessions_total",
        "Multipart sessions by final state",
        &["bucket", "state"]
    ).unwrap();

    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "mizuchi_multipart_parts",
        "Parts per completed multipart upload",
        vec![2.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]
    ).unwrap();

    pub static ref PART_RETRIES: Counter = register_counter!(
        "mizuchi_part_retries_total",
        "Part uploads retried after a transient failure"
    ).unwrap();

    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "mizuchi_errors_total",
        "Failed uploads by error kind",
        &["kind"]
    ).unwrap();
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Configuration => "configuration",
        ErrorKind::Transport => "transport",
        ErrorKind::Provider => "provider",
        ErrorKind::Integrity => "integrity",
        ErrorKind::Cancelled => "cancelled",
    }
}

/// Record one S3 request; `status` is the HTTP status or "error" when no
/// response arrived
pub fn record_s3_request(operation: &str, status: &str) {
    S3_REQUESTS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

/// Record a finished upload call
///
/// `outcome` is the number of bytes stored, or the kind of error that
/// ended the upload.
pub fn record_upload(bucket: &str, strategy: &str, duration_secs: f64, outcome: Result<u64, ErrorKind>) {
    UPLOAD_DURATION
        .with_label_values(&[bucket, strategy])
        .observe(duration_secs);

    match outcome {
        Ok(bytes) => {
            UPLOADS_TOTAL
                .with_label_values(&[bucket, strategy, "success"])
                .inc();
            UPLOAD_BYTES_TOTAL.with_label_values(&[bucket]).inc_by(bytes as f64);
        }
        Err(kind) => {
            UPLOADS_TOTAL
                .with_label_values(&[bucket, strategy, "failure"])
                .inc();
            ERRORS_TOTAL.with_label_values(&[kind_label(kind)]).inc();
        }
    }
}

/// Record the state a multipart session was left in
pub fn record_multipart_session(bucket: &str, state: SessionState, parts: usize) {
    let label = match state {
        SessionState::Completed => {
            MULTIPART_PARTS.observe(parts as f64);
            "completed"
        }
        SessionState::Aborted => "aborted",
        _ => "open",
    };
    MULTIPART_SESSIONS.with_label_values(&[bucket, label]).inc();
}

pub fn record_part_retry() {
    PART_RETRIES.inc();
}

/// Default registry in the Prometheus text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_outcomes() {
        record_upload("metrics-bucket", "simple", 0.2, Ok(1024));
        record_upload("metrics-bucket", "multipart", 3.0, Err(ErrorKind::Transport));

        let stored = UPLOAD_BYTES_TOTAL
            .with_label_values(&["metrics-bucket"])
            .get();
        assert!(stored >= 1024.0);

        let text = gather();
        assert!(text.contains("mizuchi_uploads_total"));
        assert!(text.contains("kind=\"transport\""));
    }

    #[test]
    fn test_session_states() {
        record_multipart_session("sessions-bucket", SessionState::Completed, 3);
        record_multipart_session("sessions-bucket", SessionState::Active, 1);
        record_multipart_session("sessions-bucket", SessionState::Aborted, 0);

        for state in ["completed", "open", "aborted"] {
            assert!(
                MULTIPART_SESSIONS
                    .with_label_values(&["sessions-bucket", state])
                    .get()
                    >= 1.0
            );
        }
    }

    #[test]
    fn test_gather_includes_requests() {
        record_s3_request("put_object", "200");
        let text = gather();
        assert!(text.contains("mizuchi_s3_requests_total"));
        assert!(text.contains("operation=\"put_object\""));
    }
}
