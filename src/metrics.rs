//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change feed reads
//! - Filtering decisions
//! - Batch dispatch and write outcomes
//! - Queue depth and backpressure waits
//! - Pipeline state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `firehose_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No exporter is installed here; the embedding application picks one.
//!
//! # Usage
//!
//! ```rust,no_run
//! use couch_firehose::metrics;
//! use std::time::Duration;
//!
//! // After each page from the changes feed
//! metrics::record_events_read(42);
//!
//! // After each bulk write
//! metrics::record_batch_written(500, 0, false, Duration::from_millis(80));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record change events read from the source.
pub fn record_events_read(count: usize) {
    counter!("firehose_events_read_total").increment(count as u64);
}

/// Record an event dropped by the filter chain.
pub fn record_event_filtered(reason: &str) {
    counter!("firehose_events_filtered_total", "reason" => reason.to_string()).increment(1);
}

/// Record documents accepted into the accumulator.
pub fn record_docs_accepted(count: usize) {
    counter!("firehose_docs_accepted_total").increment(count as u64);
}

/// Record a batch handed to the dispatch queue.
pub fn record_batch_dispatched(size: usize, preserve_revisions: bool) {
    let mode = write_mode(preserve_revisions);
    counter!("firehose_batches_dispatched_total", "mode" => mode).increment(1);
    histogram!("firehose_batch_size", "mode" => mode).record(size as f64);
}

/// Record a completed bulk write.
pub fn record_batch_written(
    written: usize,
    rejected: usize,
    preserve_revisions: bool,
    duration: Duration,
) {
    let mode = write_mode(preserve_revisions);
    counter!("firehose_docs_written_total", "mode" => mode).increment(written as u64);
    if rejected > 0 {
        counter!("firehose_docs_rejected_total", "mode" => mode).increment(rejected as u64);
    }
    histogram!("firehose_batch_write_duration_seconds", "mode" => mode)
        .record(duration.as_secs_f64());
}

/// Record a bulk write that was given up on.
pub fn record_batch_failed(docs: usize, preserve_revisions: bool) {
    let mode = write_mode(preserve_revisions);
    counter!("firehose_batches_failed_total", "mode" => mode).increment(1);
    counter!("firehose_docs_failed_total", "mode" => mode).increment(docs as u64);
}

/// Record a bulk write retry.
pub fn record_write_retry(attempt: u32) {
    counter!("firehose_write_retries_total").increment(1);
    gauge!("firehose_write_retry_last_attempt").set(attempt as f64);
}

/// Set the dispatch queue depth (queued + in flight).
pub fn set_queue_depth(depth: usize) {
    gauge!("firehose_queue_depth").set(depth as f64);
}

/// Record time spent paused by the backpressure governor.
pub fn record_backpressure_wait(duration: Duration) {
    counter!("firehose_backpressure_pauses_total").increment(1);
    histogram!("firehose_backpressure_wait_seconds").record(duration.as_secs_f64());
}

/// Record a flush triggered by the idle timer.
pub fn record_idle_flush(docs: usize) {
    counter!("firehose_idle_flushes_total").increment(1);
    counter!("firehose_idle_flushed_docs_total").increment(docs as u64);
}

/// Record the end-of-stream flush.
pub fn record_final_flush(batches: usize, docs: usize) {
    counter!("firehose_final_flush_batches_total").increment(batches as u64);
    counter!("firehose_final_flush_docs_total").increment(docs as u64);
}

/// Set the completion state gauge.
pub fn set_pipeline_state(state: &str) {
    let value = match state {
        "Running" => 0.0,
        "SourceDone" => 1.0,
        "Draining" => 2.0,
        "Complete" => 3.0,
        _ => -1.0,
    };
    gauge!("firehose_pipeline_state").set(value);
}

/// Record a changes feed request.
pub fn record_feed_request(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("firehose_feed_requests_total", "status" => status).increment(1);
    histogram!("firehose_feed_request_duration_seconds").record(duration.as_secs_f64());
}

fn write_mode(preserve_revisions: bool) -> &'static str {
    if preserve_revisions {
        "preserve_revisions"
    } else {
        "standard"
    }
}
