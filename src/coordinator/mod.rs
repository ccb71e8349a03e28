// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication coordinator.
//!
//! The main orchestrator that ties together:
//! - The change feed via [`crate::store::ChangeFeed`]
//! - Filtering via [`crate::filter::ChangeFilter`]
//! - Batching via [`crate::batch::SharedAccumulator`]
//! - Bounded writes via [`crate::dispatch::DispatchQueue`]
//! - Source pacing via [`crate::backpressure::BackpressureGovernor`]
//! - The idle flush timer and the progress reporter
//!
//! # Lifecycle
//!
//! 1. Starts the dispatch queue, idle flush task and progress reporter
//! 2. Runs the event loop until the feed ends
//! 3. Stops the idle flush task, force-flushes trailing documents
//! 4. Waits for the dispatch queue to drain
//! 5. Declares completion once and returns a [`RunSummary`]

mod completion;
mod event_loop;
mod types;

pub use completion::CompletionCoordinator;
pub use event_loop::{run_event_loop, EventLoopStats};
pub use types::{CompletionState, RunSummary};

use crate::backpressure::BackpressureGovernor;
use crate::batch::SharedAccumulator;
use crate::config::{FirehoseConfig, IdleFlushConfig};
use crate::dispatch::{DispatchConfig, DispatchQueue};
use crate::error::{FirehoseError, Result};
use crate::filter::{ChangeFilter, Transform};
use crate::idle;
use crate::metrics;
use crate::state::PipelineState;
use crate::store::{BulkWriter, ChangeFeed};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// One replication run from a change feed to a bulk writer.
///
/// `run()` consumes the firehose; counters and the completion state can be
/// watched from outside through [`state()`](Self::state) and
/// [`completion_receiver()`](Self::completion_receiver) obtained beforehand.
pub struct Firehose<F: ChangeFeed, W: BulkWriter> {
    feed: F,
    writer: Arc<W>,
    filter: ChangeFilter,
    batch_size: usize,
    dispatch: DispatchConfig,
    governor: BackpressureGovernor,
    idle_flush: IdleFlushConfig,
    progress_interval: Option<Duration>,
    state: Arc<PipelineState>,
    completion: Arc<CompletionCoordinator>,
}

impl<F: ChangeFeed, W: BulkWriter> Firehose<F, W> {
    /// Build a firehose from a validated configuration.
    ///
    /// The configuration's filter flags are applied; attach a transform with
    /// [`with_transform()`](Self::with_transform).
    pub fn new(config: &FirehoseConfig, feed: F, writer: Arc<W>) -> Self {
        Self {
            feed,
            writer,
            filter: ChangeFilter::new(config.filter_options()),
            batch_size: config.batch_size,
            dispatch: DispatchConfig::from_config(config),
            governor: BackpressureGovernor::from_config(config),
            idle_flush: config.settings.idle_flush.clone(),
            progress_interval: config.settings.progress_interval,
            state: Arc::new(PipelineState::new()),
            completion: Arc::new(CompletionCoordinator::new()),
        }
    }

    /// Apply `transform` to every document after the built-in filters.
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.filter = self.filter.with_transform(transform);
        self
    }

    /// Replace the filter chain entirely.
    pub fn with_filter(mut self, filter: ChangeFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Shared counters for this run.
    pub fn state(&self) -> Arc<PipelineState> {
        Arc::clone(&self.state)
    }

    /// Get a receiver to watch completion state changes.
    pub fn completion_receiver(&self) -> watch::Receiver<CompletionState> {
        self.completion.subscribe()
    }

    /// Run until the feed ends and every write has been acknowledged.
    ///
    /// Returns an error if the feed fails; documents still buffered at that
    /// point are not flushed. Write failures do not end the run: they are
    /// logged and counted in [`RunSummary::total_failed`].
    #[instrument(skip_all, name = "firehose")]
    pub async fn run(mut self) -> Result<RunSummary> {
        info!(
            batch_size = self.batch_size,
            concurrency = self.dispatch.concurrency,
            max_writes_per_second = self.dispatch.max_writes_per_second,
            high_water = self.governor.high_water(),
            "Starting firehose"
        );

        let queue = Arc::new(DispatchQueue::start(
            Arc::clone(&self.writer),
            Arc::clone(&self.state),
            self.dispatch.clone(),
        ));
        let accumulator = Arc::new(SharedAccumulator::new(self.batch_size, Arc::clone(&queue)));
        let mut depth_rx = queue.subscribe_depth();

        let (idle_stop_tx, idle_stop_rx) = watch::channel(false);
        let idle_handle =
            idle::spawn_idle_flush(Arc::clone(&accumulator), self.idle_flush.clone(), idle_stop_rx);

        let (progress_stop_tx, progress_stop_rx) = watch::channel(false);
        let progress_handle = self.spawn_progress_task(progress_stop_rx);

        let loop_result = run_event_loop(
            &mut self.feed,
            &self.filter,
            &accumulator,
            &self.governor,
            &self.state,
            &mut depth_rx,
        )
        .await;

        // The idle flusher stops with the source in every case.
        let _ = idle_stop_tx.send(true);
        join_task(idle_handle, "idle flush").await;

        let stats = match loop_result {
            Ok(stats) => stats,
            Err(e) => {
                let _ = progress_stop_tx.send(true);
                join_task(progress_handle, "progress").await;
                let buffered = accumulator.len().await;
                warn!(
                    buffered,
                    queued = queue.depth(),
                    "Firehose stopped before the source ended"
                );
                return Err(e);
            }
        };

        self.state.mark_source_ended();
        self.completion.source_ended()?;

        let flushed = accumulator.force_flush().await?;
        metrics::record_final_flush(flushed.batches, flushed.docs);
        info!(
            batches = flushed.batches,
            docs = flushed.docs,
            paused_ms = stats.paused.as_millis() as u64,
            "Source exhausted, trailing documents flushed"
        );

        self.completion.begin_draining()?;
        self.await_drain(&mut depth_rx).await?;

        let _ = progress_stop_tx.send(true);
        join_task(progress_handle, "progress").await;

        let snapshot = self.state.snapshot();
        let summary = RunSummary {
            total_seen: snapshot.total_seen,
            total_written: snapshot.total_written,
            total_failed: snapshot.total_failed,
            batches_dispatched: snapshot.batches_dispatched,
            elapsed: snapshot.elapsed,
        };
        info!(
            written = summary.total_written,
            seen = summary.total_seen,
            failed = summary.total_failed,
            batches = summary.batches_dispatched,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Firehose complete"
        );
        Ok(summary)
    }

    /// Feed depth observations to the completion coordinator until it
    /// declares completion.
    async fn await_drain(&self, depth_rx: &mut watch::Receiver<usize>) -> Result<()> {
        loop {
            let depth = *depth_rx.borrow_and_update();
            if self.completion.observe_depth(depth) {
                return Ok(());
            }
            debug!(depth, "Waiting for dispatch queue to drain");
            if depth_rx.changed().await.is_err() {
                return Err(FirehoseError::Internal(
                    "dispatch queue closed while draining".to_string(),
                ));
            }
        }
    }

    /// Spawn the progress reporter.
    ///
    /// Periodically rewrites the `{elapsed}s {written}/{seen}` status line on
    /// stdout. Returns `None` when progress output is disabled.
    fn spawn_progress_task(&self, mut stop_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let interval = self.progress_interval?;
        let state = Arc::clone(&self.state);

        Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let mut stdout = std::io::stdout().lock();
                        let _ = write!(stdout, "{}      \r", state.snapshot());
                        let _ = stdout.flush();
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            debug!("Progress task stopping");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

async fn join_task(handle: Option<JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }
}
