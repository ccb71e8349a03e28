//! Process-wide pipeline counters.
//!
//! [`PipelineState`] is shared by `Arc` between the event loop, the dispatch
//! workers and the progress reporter. Fields are private atomics; every
//! mutation goes through a method so the `written <= seen` relationship is
//! kept in one place.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Shared counters for one replication run.
#[derive(Debug)]
pub struct PipelineState {
    total_seen: AtomicU64,
    total_written: AtomicU64,
    total_failed: AtomicU64,
    batches_dispatched: AtomicU64,
    in_flight_batches: AtomicUsize,
    source_ended: AtomicBool,
    started_at: Instant,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            total_seen: AtomicU64::new(0),
            total_written: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            batches_dispatched: AtomicU64::new(0),
            in_flight_batches: AtomicUsize::new(0),
            source_ended: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// A document passed the filter and was handed to the accumulator.
    pub fn record_seen(&self) {
        self.total_seen.fetch_add(1, Ordering::SeqCst);
    }

    /// A batch was handed to a writer.
    pub fn record_dispatched(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::SeqCst);
        self.in_flight_batches.fetch_add(1, Ordering::SeqCst);
    }

    /// A dispatched batch of `docs` documents was acknowledged by the target.
    pub fn record_written(&self, docs: usize) {
        self.total_written.fetch_add(docs as u64, Ordering::SeqCst);
        self.finish_in_flight();
    }

    /// A dispatched batch of `docs` documents was given up on.
    pub fn record_failed(&self, docs: usize) {
        self.total_failed.fetch_add(docs as u64, Ordering::SeqCst);
        self.finish_in_flight();
    }

    /// Documents the target refused individually inside a successful write.
    ///
    /// Counted as failed; the batch itself is already accounted for by
    /// [`record_written()`](Self::record_written).
    pub fn record_rejected(&self, docs: usize) {
        self.total_failed.fetch_add(docs as u64, Ordering::SeqCst);
    }

    fn finish_in_flight(&self) {
        // saturating: a stray completion must not wrap the gauge
        let _ = self
            .in_flight_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn mark_source_ended(&self) {
        self.source_ended.store(true, Ordering::SeqCst);
    }

    pub fn source_ended(&self) -> bool {
        self.source_ended.load(Ordering::SeqCst)
    }

    pub fn total_seen(&self) -> u64 {
        self.total_seen.load(Ordering::SeqCst)
    }

    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::SeqCst)
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::SeqCst)
    }

    pub fn batches_dispatched(&self) -> u64 {
        self.batches_dispatched.load(Ordering::SeqCst)
    }

    pub fn in_flight_batches(&self) -> usize {
        self.in_flight_batches.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            elapsed: self.elapsed(),
            total_seen: self.total_seen(),
            total_written: self.total_written(),
            total_failed: self.total_failed(),
            batches_dispatched: self.batches_dispatched(),
            in_flight_batches: self.in_flight_batches(),
            source_ended: self.source_ended(),
        }
    }
}

/// Counters captured at one instant.
///
/// `Display` renders the progress line: `{elapsed}s {written}/{seen}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub elapsed: Duration,
    pub total_seen: u64,
    pub total_written: u64,
    pub total_failed: u64,
    pub batches_dispatched: u64,
    pub in_flight_batches: usize,
    pub source_ended: bool,
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  {}s {}/{}",
            self.elapsed.as_secs(),
            self.total_written,
            self.total_seen
        )
    }
}
