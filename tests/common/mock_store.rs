//! Mock ChangeFeed and BulkWriter for testing.
//!
//! `ScriptedFeed` plays back a list of steps. `RecordingWriter` records
//! every bulk write and tracks how many were in flight at once.

use couch_firehose::store::{BoxFuture, BulkWriteRequest, BulkWriter, ChangeFeed, WriteReport};
use couch_firehose::{ChangeEvent, FirehoseError, PipelineState};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// One step of a scripted feed.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return these events.
    Chunk(Vec<ChangeEvent>),
    /// Sleep, then continue with the next step.
    Pause(Duration),
    /// Fail with a source error.
    Fail(String),
}

/// A change feed that plays back scripted steps, then ends.
///
/// Once a [`PipelineState`] is attached through [`observer()`](Self::observer),
/// it records how many accepted documents were not yet written each time it
/// is asked for more.
pub struct ScriptedFeed {
    steps: VecDeque<Step>,
    calls: Arc<AtomicUsize>,
    state: Arc<OnceLock<Arc<PipelineState>>>,
    outstanding: Arc<Mutex<Vec<u64>>>,
}

impl ScriptedFeed {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            calls: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(OnceLock::new()),
            outstanding: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Feed of `events` split into chunks of `chunk_size`.
    pub fn chunked(events: Vec<ChangeEvent>, chunk_size: usize) -> Self {
        let steps = events
            .chunks(chunk_size.max(1))
            .map(|c| Step::Chunk(c.to_vec()))
            .collect();
        Self::new(steps)
    }

    /// Slot for the run's counters. Once set, every call samples
    /// `total_seen - total_written - total_failed`.
    pub fn observer(&self) -> Arc<OnceLock<Arc<PipelineState>>> {
        Arc::clone(&self.state)
    }

    /// Shared count of `next_batch()` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Shared list of outstanding-document samples.
    pub fn outstanding(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.outstanding)
    }
}

impl ChangeFeed for ScriptedFeed {
    fn next_batch(&mut self) -> BoxFuture<'_, Option<Vec<ChangeEvent>>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(state) = self.state.get() {
                let done = state.total_written() + state.total_failed();
                let pending = state.total_seen().saturating_sub(done);
                self.outstanding.lock().unwrap().push(pending);
            }
            loop {
                match self.steps.pop_front() {
                    None => return Ok(None),
                    Some(Step::Chunk(events)) => return Ok(Some(events)),
                    Some(Step::Pause(d)) => tokio::time::sleep(d).await,
                    Some(Step::Fail(msg)) => return Err(FirehoseError::source("_changes", msg)),
                }
            }
        })
    }
}

/// A recorded bulk write.
#[derive(Debug, Clone)]
pub struct WriteCall {
    pub ids: Vec<String>,
    pub preserve_revisions: bool,
    pub had_revs: bool,
}

impl WriteCall {
    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Bulk writer that records every request.
pub struct RecordingWriter {
    calls: Mutex<Vec<WriteCall>>,
    delay: Duration,
    fail_all: bool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingWriter {
    /// Accept every write immediately.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail_all: false,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Accept every write after `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Fail every write with a 503.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<WriteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls().iter().map(WriteCall::len).collect()
    }

    /// All written ids in request order.
    pub fn written_ids(&self) -> Vec<String> {
        self.calls().into_iter().flat_map(|c| c.ids).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl BulkWriter for RecordingWriter {
    fn bulk_write(&self, request: BulkWriteRequest) -> BoxFuture<'_, WriteReport> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let docs = request.docs.len();
            self.calls.lock().unwrap().push(WriteCall {
                ids: request
                    .docs
                    .iter()
                    .map(|d| d.id().unwrap_or_default().to_string())
                    .collect(),
                preserve_revisions: request.preserve_revisions,
                had_revs: request.docs.iter().any(|d| d.has_rev()),
            });

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_all {
                return Err(FirehoseError::write(docs, "503: Service Unavailable"));
            }
            Ok(WriteReport::accepted(docs))
        })
    }
}
