//! Event loop: pull from the change feed, filter, accumulate.
//!
//! One task runs this loop for the lifetime of a replication. Per chunk:
//!
//! 1. Ask the feed for the next chunk (this also acknowledges the last one)
//!    and restart the idle clock if it carried any events
//! 2. Run every event through the [`ChangeFilter`]
//! 3. Append survivors to the shared accumulator, which submits full batches
//! 4. Wait for the backpressure governor before asking for more
//!
//! The loop returns when the feed reports end-of-stream, or with the first
//! feed or accumulator error.

use crate::backpressure::BackpressureGovernor;
use crate::batch::{BatchSink, SharedAccumulator};
use crate::error::Result;
use crate::filter::ChangeFilter;
use crate::metrics;
use crate::state::PipelineState;
use crate::store::ChangeFeed;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

/// Totals for one pass of the event loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventLoopStats {
    /// Chunks returned by the feed.
    pub chunks: u64,
    /// Raw events read.
    pub events: u64,
    /// Events that passed the filter.
    pub accepted: u64,
    /// Events dropped by the filter.
    pub filtered: u64,
    /// Total time the governor held the source back.
    pub paused: Duration,
}

/// Run the event loop until the feed ends.
pub async fn run_event_loop<F, S>(
    feed: &mut F,
    filter: &ChangeFilter,
    accumulator: &SharedAccumulator<S>,
    governor: &BackpressureGovernor,
    state: &PipelineState,
    depth_rx: &mut watch::Receiver<usize>,
) -> Result<EventLoopStats>
where
    F: ChangeFeed,
    S: BatchSink,
{
    let span = tracing::info_span!("event_loop");

    async move {
        info!(high_water = governor.high_water(), "Starting event loop");
        let mut stats = EventLoopStats::default();

        loop {
            let read_start = Instant::now();
            let chunk = match feed.next_batch().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    info!(
                        chunks = stats.chunks,
                        events = stats.events,
                        accepted = stats.accepted,
                        filtered = stats.filtered,
                        "Change feed ended"
                    );
                    return Ok(stats);
                }
                Err(e) => {
                    error!(error = %e, "Change feed failed");
                    return Err(e);
                }
            };

            stats.chunks += 1;
            stats.events += chunk.len() as u64;
            metrics::record_events_read(chunk.len());
            if !chunk.is_empty() {
                accumulator.touch().await;
            }

            let mut accepted = 0usize;
            for event in chunk {
                match filter.apply(event) {
                    Ok(doc) => {
                        // counted before append so written can never overtake seen
                        state.record_seen();
                        accepted += 1;
                        accumulator.append(doc).await?;
                    }
                    Err(reason) => {
                        stats.filtered += 1;
                        metrics::record_event_filtered(reason.as_str());
                    }
                }
            }
            stats.accepted += accepted as u64;
            metrics::record_docs_accepted(accepted);

            debug!(
                accepted,
                seen = state.total_seen(),
                written = state.total_written(),
                read_ms = read_start.elapsed().as_millis() as u64,
                "Processed chunk"
            );

            stats.paused += governor.wait_for_capacity(depth_rx).await;
        }
    }
    .instrument(span)
    .await
}
