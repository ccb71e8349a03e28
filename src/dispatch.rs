// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch queue: bounded-concurrency, rate-limited bulk writes.
//!
//! # Architecture
//!
//! ```text
//!  push(batch) ──▶ unbounded mpsc ──▶ dispatcher task
//!   depth += 1                          │
//!                                       ├─ Bulkhead::acquire()     (≤ C in flight)
//!                                       ├─ RateLimiter::acquire()  (≤ R per second)
//!                                       └─ spawn write task ──▶ BulkWriter::bulk_write()
//!                                                                 │
//!                                             ok  ─▶ record_written(len)
//!                                             err ─▶ retry (opt-in) / record_failed(len)
//!                                                                 │
//!                                                             depth -= 1 ──▶ watch
//! ```
//!
//! Depth counts queued plus in-flight batches. Every change is published on a
//! `watch` channel so the backpressure governor and the completion
//! coordinator can wait on it instead of polling.
//!
//! A write task settles its batch when it is dropped. If the writer panics
//! the batch is counted as failed and depth still goes down.
//!
//! Batches leave the queue in push order. Writes complete in any order.

use crate::batch::BatchSink;
use crate::document::Batch;
use crate::error::{FirehoseError, Result};
use crate::metrics;
use crate::resilience::{Bulkhead, RateLimiter, RetryConfig};
use crate::state::PipelineState;
use crate::store::{BulkWriteRequest, BulkWriter};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};

/// Dispatch limits.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Maximum concurrent bulk writes (C).
    pub concurrency: usize,
    /// Maximum bulk writes started per second (R).
    pub max_writes_per_second: u32,
    /// Retry policy for failed writes.
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_writes_per_second: 50,
            retry: RetryConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_config(config: &crate::config::FirehoseConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_writes_per_second: config.max_writes_per_second,
            retry: config.settings.write_retry.clone(),
        }
    }
}

/// Queue of batches waiting to be written to the target.
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Batch>,
    depth: Arc<watch::Sender<usize>>,
    dispatcher: JoinHandle<()>,
    concurrency: usize,
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("depth", &self.depth())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl DispatchQueue {
    /// Start the dispatcher task. Must be called inside a tokio runtime.
    pub fn start<W: BulkWriter>(
        writer: Arc<W>,
        state: Arc<PipelineState>,
        config: DispatchConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let (depth_tx, _) = watch::channel(0usize);
        let depth = Arc::new(depth_tx);

        let dispatcher = Dispatcher {
            writer,
            state,
            bulkhead: Bulkhead::new(concurrency),
            limiter: Arc::new(RateLimiter::per_second(config.max_writes_per_second)),
            retry: config.retry,
            depth: Arc::clone(&depth),
        };
        let handle = tokio::spawn(dispatcher.run(rx).instrument(info_span!("dispatcher")));

        Self {
            tx,
            depth,
            dispatcher: handle,
            concurrency,
        }
    }

    /// Enqueue a batch. Never blocks.
    pub fn push(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        metrics::record_batch_dispatched(batch.len(), batch.has_revision_markers());
        self.depth.send_modify(|d| *d += 1);
        if self.tx.send(batch).is_err() {
            self.depth.send_modify(|d| *d = d.saturating_sub(1));
            return Err(FirehoseError::Internal(
                "dispatcher task is no longer running".to_string(),
            ));
        }
        metrics::set_queue_depth(self.depth());
        Ok(())
    }

    /// Queued plus in-flight batches.
    pub fn depth(&self) -> usize {
        *self.depth.borrow()
    }

    /// Watch channel that changes on every depth update.
    pub fn subscribe_depth(&self) -> watch::Receiver<usize> {
        self.depth.subscribe()
    }

    /// Resolve once nothing is queued or in flight.
    pub async fn drained(&self) {
        let mut rx = self.depth.subscribe();
        // the sender lives in self, so wait_for cannot fail here
        let _ = rx.wait_for(|d| *d == 0).await;
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl BatchSink for DispatchQueue {
    fn submit(&self, batch: Batch) -> Result<()> {
        self.push(batch)
    }
}

struct Dispatcher<W: BulkWriter> {
    writer: Arc<W>,
    state: Arc<PipelineState>,
    bulkhead: Bulkhead,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    depth: Arc<watch::Sender<usize>>,
}

impl<W: BulkWriter> Dispatcher<W> {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Batch>) {
        let mut seq: u64 = 0;
        while let Some(batch) = rx.recv().await {
            seq += 1;

            let permit = match self.bulkhead.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(batch = seq, docs = batch.len(), error = %e, "Cannot dispatch batch");
                    self.state.record_dispatched();
                    self.state.record_failed(batch.len());
                    self.finish_one();
                    continue;
                }
            };
            self.limiter.acquire().await;
            self.state.record_dispatched();

            let task = WriteTask {
                writer: Arc::clone(&self.writer),
                state: Arc::clone(&self.state),
                limiter: Arc::clone(&self.limiter),
                retry: self.retry.clone(),
                depth: Arc::clone(&self.depth),
                docs: batch.len(),
                preserve: batch.has_revision_markers(),
                settled: false,
            };
            let span = info_span!("bulk_write", batch = seq, docs = batch.len());
            tokio::spawn(
                async move {
                    let _permit = permit;
                    task.write(batch).await;
                }
                .instrument(span),
            );
        }
        debug!("Dispatch queue closed");
    }

    fn finish_one(&self) {
        self.depth.send_modify(|d| *d = d.saturating_sub(1));
        metrics::set_queue_depth(*self.depth.borrow());
    }
}

struct WriteTask<W: BulkWriter> {
    writer: Arc<W>,
    state: Arc<PipelineState>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    depth: Arc<watch::Sender<usize>>,
    docs: usize,
    preserve: bool,
    /// Set once the outcome has been recorded.
    settled: bool,
}

impl<W: BulkWriter> WriteTask<W> {
    async fn write(mut self, batch: Batch) {
        let docs = self.docs;
        let preserve = self.preserve;
        let mut request = BulkWriteRequest::from(batch);
        let start = Instant::now();
        let mut attempt = 0usize;

        let outcome = loop {
            attempt += 1;
            let retry_allowed = self.retry.should_retry(attempt);
            // only the last allowed attempt may consume the documents
            let attempt_request = if retry_allowed {
                request.clone()
            } else {
                BulkWriteRequest {
                    docs: std::mem::take(&mut request.docs),
                    preserve_revisions: preserve,
                }
            };

            match self.writer.bulk_write(attempt_request).await {
                Ok(report) => break Ok(report),
                Err(e) if retry_allowed && e.is_retryable() => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Bulk write failed, retrying"
                    );
                    metrics::record_write_retry(attempt as u32);
                    tokio::time::sleep(delay).await;
                    self.limiter.acquire().await;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(report) => {
                let rejected = report.rejected.len().min(docs);
                let written = docs - rejected;
                for doc in &report.rejected {
                    warn!(id = %doc.id, error = %doc.error, reason = %doc.reason, "Target rejected document");
                }
                metrics::record_batch_written(written, rejected, preserve, start.elapsed());
                debug!(
                    written,
                    rejected,
                    preserve_revisions = preserve,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Bulk write complete"
                );
                self.state.record_written(written);
                if rejected > 0 {
                    self.state.record_rejected(rejected);
                }
            }
            Err(e) => {
                error!(
                    docs,
                    attempts = attempt,
                    preserve_revisions = preserve,
                    error = %e,
                    "Bulk write failed, batch dropped"
                );
                metrics::record_batch_failed(docs, preserve);
                self.state.record_failed(docs);
            }
        }
        self.settled = true;
    }
}

impl<W: BulkWriter> Drop for WriteTask<W> {
    fn drop(&mut self) {
        if !self.settled {
            error!(
                docs = self.docs,
                preserve_revisions = self.preserve,
                "Bulk write aborted, batch dropped"
            );
            metrics::record_batch_failed(self.docs, self.preserve);
            self.state.record_failed(self.docs);
        }
        self.depth.send_modify(|d| *d = d.saturating_sub(1));
        metrics::set_queue_depth(*self.depth.borrow());
    }
}
