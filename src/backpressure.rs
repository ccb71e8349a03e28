//! Backpressure governor.
//!
//! Gates how fast the event loop asks the source for its next chunk. While
//! the dispatch queue holds `concurrency * factor` batches or more, the
//! governor does not return. It wakes on every depth change and also
//! re-checks on a fixed poll interval in case a notification is coalesced.

use crate::config::FirehoseConfig;
use crate::metrics;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Pauses the source while the dispatch queue is too deep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackpressureGovernor {
    high_water: usize,
    poll_interval: Duration,
}

impl BackpressureGovernor {
    /// Pause while depth >= `high_water`. Both values are clamped to be non-zero.
    pub fn new(high_water: usize, poll_interval: Duration) -> Self {
        Self {
            high_water: high_water.max(1),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(config: &FirehoseConfig) -> Self {
        Self::new(
            config.backpressure_high_water(),
            config.settings.backpressure.poll_interval,
        )
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether a queue at `depth` should hold the source back.
    pub fn should_pause(&self, depth: usize) -> bool {
        depth >= self.high_water
    }

    /// Wait until queue depth drops below the high-water mark.
    ///
    /// Returns how long the caller was held back (zero if there was room).
    /// If the depth channel closes the wait ends, since nothing can drain
    /// the queue any more.
    pub async fn wait_for_capacity(&self, depth: &mut watch::Receiver<usize>) -> Duration {
        let current = *depth.borrow_and_update();
        if !self.should_pause(current) {
            return Duration::ZERO;
        }

        let start = Instant::now();
        debug!(depth = current, high_water = self.high_water, "Queue full, pausing source");

        loop {
            tokio::select! {
                changed = depth.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if !self.should_pause(*depth.borrow_and_update()) {
                break;
            }
        }

        let waited = start.elapsed();
        metrics::record_backpressure_wait(waited);
        debug!(
            depth = *depth.borrow(),
            waited_ms = waited.as_millis() as u64,
            "Queue has room, resuming source"
        );
        waited
    }
}
