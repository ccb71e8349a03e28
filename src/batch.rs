//! Batch accumulator for filtered documents.
//!
//! Collects documents in arrival order and cuts them into batches of at most
//! `batch_size` documents for the dispatch queue.
//!
//! # Design
//!
//! ```text
//! Documents ──▶ BatchAccumulator ──┬──▶ len reaches batch_size ──▶ first batch_size docs
//!               (ordered buffer)   │
//!                                  ├──▶ force_flush()    ──▶ everything, in chunks
//!                                  │     (end of stream)
//!                                  │
//!                                  └──▶ flush_if_idle()  ──▶ one chunk
//!                                        (quiet source)
//!                                                 │
//!                                                 ▼
//!                                            BatchSink::submit()
//! ```
//!
//! [`BatchAccumulator`] is plain data with no I/O. [`SharedAccumulator`] wraps
//! it in a `tokio::sync::Mutex` together with the sink, and submits while the
//! lock is held so the event loop and the idle flush task can never reorder
//! batches between them.

use crate::document::{Batch, Document};
use crate::error::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Receives batches cut by the accumulator.
///
/// Submission must not block: the dispatch queue enqueues and returns.
pub trait BatchSink: Send + Sync + 'static {
    fn submit(&self, batch: Batch) -> Result<()>;
}

/// Ordered buffer of documents not yet dispatched.
#[derive(Debug)]
pub struct BatchAccumulator {
    buffer: Vec<Document>,
    batch_size: usize,
    last_event: Option<Instant>,
}

impl BatchAccumulator {
    /// Create an accumulator. A `batch_size` of zero is treated as one.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            last_event: None,
        }
    }

    /// Add a document to the tail of the buffer.
    ///
    /// Returns a full batch once the buffer reaches `batch_size`.
    pub fn append(&mut self, doc: Document) -> Option<Batch> {
        self.append_at(doc, Instant::now())
    }

    /// [`append()`](Self::append) with an explicit arrival time.
    pub fn append_at(&mut self, doc: Document, now: Instant) -> Option<Batch> {
        self.buffer.push(doc);
        self.last_event = Some(now);

        if self.buffer.len() >= self.batch_size {
            Some(self.take_chunk())
        } else {
            None
        }
    }

    /// Record that the source delivered events, even if none were kept.
    pub fn touch(&mut self) {
        self.touch_at(Instant::now());
    }

    /// [`touch()`](Self::touch) with an explicit arrival time.
    pub fn touch_at(&mut self, now: Instant) {
        self.last_event = Some(now);
    }

    /// Remove everything that is buffered, in chunks of at most `batch_size`.
    pub fn force_flush(&mut self) -> Vec<Batch> {
        let mut batches = Vec::with_capacity(self.buffer.len().div_ceil(self.batch_size));
        while !self.buffer.is_empty() {
            batches.push(self.take_chunk());
        }
        batches
    }

    /// Remove one chunk if nothing arrived for at least `quiet`.
    pub fn flush_if_idle(&mut self, quiet: Duration) -> Option<Batch> {
        self.flush_if_idle_at(quiet, Instant::now())
    }

    /// [`flush_if_idle()`](Self::flush_if_idle) against an explicit clock.
    pub fn flush_if_idle_at(&mut self, quiet: Duration, now: Instant) -> Option<Batch> {
        if self.buffer.is_empty() {
            return None;
        }
        let idle = self
            .last_event
            .map(|t| now.saturating_duration_since(t) >= quiet)
            .unwrap_or(true);
        idle.then(|| self.take_chunk())
    }

    fn take_chunk(&mut self) -> Batch {
        let n = self.buffer.len().min(self.batch_size);
        Batch::new(self.buffer.drain(..n).collect())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Time the source last delivered anything.
    pub fn last_event(&self) -> Option<Instant> {
        self.last_event
    }
}

/// Totals for a multi-batch flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub batches: usize,
    pub docs: usize,
}

/// Thread-safe accumulator that submits cut batches to a sink.
///
/// Append, force flush and idle flush all take the same lock, and batches
/// are submitted before it is released.
pub struct SharedAccumulator<S: BatchSink> {
    inner: Mutex<BatchAccumulator>,
    sink: Arc<S>,
}

impl<S: BatchSink> SharedAccumulator<S> {
    /// Create a new shared accumulator.
    pub fn new(batch_size: usize, sink: Arc<S>) -> Self {
        Self {
            inner: Mutex::new(BatchAccumulator::new(batch_size)),
            sink,
        }
    }

    /// Append a document, submitting a batch if the threshold was reached.
    ///
    /// Returns the size of the submitted batch, if any.
    pub async fn append(&self, doc: Document) -> Result<Option<usize>> {
        let mut acc = self.inner.lock().await;
        match acc.append(doc) {
            Some(batch) => {
                let size = batch.len();
                self.sink.submit(batch)?;
                Ok(Some(size))
            }
            None => Ok(None),
        }
    }

    /// Restart the idle clock.
    pub async fn touch(&self) {
        self.inner.lock().await.touch();
    }

    /// Submit everything that is buffered.
    #[instrument(skip(self))]
    pub async fn force_flush(&self) -> Result<FlushSummary> {
        let mut acc = self.inner.lock().await;
        let mut summary = FlushSummary::default();
        for batch in acc.force_flush() {
            summary.batches += 1;
            summary.docs += batch.len();
            self.sink.submit(batch)?;
        }
        if summary.batches > 0 {
            debug!(batches = summary.batches, docs = summary.docs, "Flushed trailing documents");
        }
        Ok(summary)
    }

    /// Submit one chunk if the source has been quiet for `quiet`.
    ///
    /// Returns the number of documents submitted.
    pub async fn flush_if_idle(&self, quiet: Duration) -> Result<usize> {
        let mut acc = self.inner.lock().await;
        match acc.flush_if_idle(quiet) {
            Some(batch) => {
                let size = batch.len();
                self.sink.submit(batch)?;
                Ok(size)
            }
            None => Ok(0),
        }
    }

    /// Check if there are buffered documents.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Get buffered document count.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirehoseError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Test sink that records every batch.
    #[derive(Default)]
    struct RecordingSink {
        batches: std::sync::Mutex<Vec<Batch>>,
        closed: AtomicBool,
    }

    impl RecordingSink {
        fn sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Batch::len).collect()
        }

        fn ids(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|b| b.docs().iter().map(|d| d.id().unwrap().to_string()))
                .collect()
        }
    }

    impl BatchSink for RecordingSink {
        fn submit(&self, batch: Batch) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(FirehoseError::Internal("sink closed".to_string()));
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn make_doc(n: usize) -> Document {
        Document::from_value(json!({"_id": format!("doc-{n:05}"), "n": n})).unwrap()
    }

    #[test]
    fn test_append_emits_at_threshold() {
        let mut acc = BatchAccumulator::new(3);
        assert!(acc.append(make_doc(0)).is_none());
        assert!(acc.append(make_doc(1)).is_none());
        let batch = acc.append(make_doc(2)).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_append_never_exceeds_batch_size() {
        let mut acc = BatchAccumulator::new(4);
        let mut emitted = Vec::new();
        for n in 0..10 {
            if let Some(batch) = acc.append(make_doc(n)) {
                emitted.push(batch.len());
            }
            assert!(acc.len() < 4);
        }
        assert_eq!(emitted, vec![4, 4]);
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn test_force_flush_chunks() {
        let mut acc = BatchAccumulator::new(500);
        for n in 0..499 {
            assert!(acc.append(make_doc(n)).is_none());
        }
        let batches = acc.force_flush();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 499);
        assert!(acc.force_flush().is_empty());
    }

    #[test]
    fn test_force_flush_empty() {
        let mut acc = BatchAccumulator::new(10);
        assert!(acc.force_flush().is_empty());
    }

    #[test]
    fn test_batch_size_one() {
        let mut acc = BatchAccumulator::new(1);
        for n in 0..5 {
            assert_eq!(acc.append(make_doc(n)).unwrap().len(), 1);
        }
        assert!(acc.is_empty());
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        let acc = BatchAccumulator::new(0);
        assert_eq!(acc.batch_size(), 1);
    }

    #[test]
    fn test_flush_if_idle_respects_quiet_period() {
        let mut acc = BatchAccumulator::new(10);
        let t0 = Instant::now();
        acc.append_at(make_doc(0), t0);
        acc.append_at(make_doc(1), t0);

        let quiet = Duration::from_secs(5);
        assert!(acc.flush_if_idle_at(quiet, t0 + Duration::from_secs(4)).is_none());
        assert_eq!(acc.len(), 2);

        let batch = acc.flush_if_idle_at(quiet, t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(acc.flush_if_idle_at(quiet, t0 + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_flush_if_idle_clock_moved_back() {
        let mut acc = BatchAccumulator::new(10);
        let t0 = Instant::now() + Duration::from_secs(10);
        acc.append_at(make_doc(0), t0);
        // saturating: "now" before the last event counts as zero idle time
        assert!(acc
            .flush_if_idle_at(Duration::from_secs(1), t0 - Duration::from_secs(5))
            .is_none());
    }

    #[test]
    fn test_touch_defers_idle_flush() {
        let mut acc = BatchAccumulator::new(10);
        let t0 = Instant::now();
        acc.append_at(make_doc(0), t0);

        // filtered-out events still count as activity
        let quiet = Duration::from_secs(5);
        acc.touch_at(t0 + Duration::from_secs(4));
        assert!(acc.flush_if_idle_at(quiet, t0 + Duration::from_secs(6)).is_none());
        assert_eq!(acc.len(), 1);

        let batch = acc.flush_if_idle_at(quiet, t0 + Duration::from_secs(9)).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_order_preserved() {
        let mut acc = BatchAccumulator::new(3);
        let mut out = Vec::new();
        for n in 0..8 {
            if let Some(b) = acc.append(make_doc(n)) {
                out.extend(b.into_docs());
            }
        }
        for b in acc.force_flush() {
            out.extend(b.into_docs());
        }
        let ns: Vec<u64> = out.iter().map(|d| d.get("n").unwrap().as_u64().unwrap()).collect();
        assert_eq!(ns, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_revision_markers_per_batch() {
        let mut acc = BatchAccumulator::new(2);
        acc.append(make_doc(0));
        let b1 = acc
            .append(Document::from_value(json!({"_id": "r", "_rev": "1-a"})).unwrap())
            .unwrap();
        assert!(b1.has_revision_markers());

        acc.append(make_doc(1));
        let b2 = acc.append(make_doc(2)).unwrap();
        assert!(!b2.has_revision_markers());
    }

    #[tokio::test]
    async fn test_shared_append_submits_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let shared = SharedAccumulator::new(500, Arc::clone(&sink));

        for n in 0..1050 {
            shared.append(make_doc(n)).await.unwrap();
        }
        assert_eq!(sink.sizes(), vec![500, 500]);
        assert_eq!(shared.len().await, 50);

        let summary = shared.force_flush().await.unwrap();
        assert_eq!(summary, FlushSummary { batches: 1, docs: 50 });
        assert_eq!(sink.sizes(), vec![500, 500, 50]);
        assert!(shared.is_empty().await);

        let expected: Vec<String> = (0..1050).map(|n| format!("doc-{n:05}")).collect();
        assert_eq!(sink.ids(), expected);
    }

    #[tokio::test]
    async fn test_shared_idle_flush() {
        let sink = Arc::new(RecordingSink::default());
        let shared = SharedAccumulator::new(10, Arc::clone(&sink));
        shared.append(make_doc(0)).await.unwrap();

        assert_eq!(shared.flush_if_idle(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(shared.flush_if_idle(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(sink.sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_shared_sink_error_propagates() {
        let sink = Arc::new(RecordingSink::default());
        sink.closed.store(true, Ordering::SeqCst);
        let shared = SharedAccumulator::new(1, Arc::clone(&sink));

        let err = shared.append(make_doc(0)).await.unwrap_err();
        assert!(matches!(err, FirehoseError::Internal(_)));
    }

    #[tokio::test]
    async fn test_concurrent_idle_and_append_no_duplicates() {
        let sink = Arc::new(RecordingSink::default());
        let shared = Arc::new(SharedAccumulator::new(7, Arc::clone(&sink)));

        let flusher = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                for _ in 0..200 {
                    shared.flush_if_idle(Duration::ZERO).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for n in 0..300 {
            shared.append(make_doc(n)).await.unwrap();
            tokio::task::yield_now().await;
        }
        flusher.await.unwrap();
        shared.force_flush().await.unwrap();

        let expected: Vec<String> = (0..300).map(|n| format!("doc-{n:05}")).collect();
        assert_eq!(sink.ids(), expected);
        assert!(sink.sizes().iter().all(|&s| s <= 7));
    }
}
