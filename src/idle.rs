//! Idle flush timer.
//!
//! A quiet source that never ends (continuous mode) would otherwise leave up
//! to `batch_size - 1` documents sitting in the accumulator forever. This task
//! checks the accumulator on a fixed interval and flushes one chunk once no
//! event has arrived for the quiet period.
//!
//! It stops as soon as the source ends; the end-of-stream flush takes over
//! from there.

use crate::batch::{BatchSink, SharedAccumulator};
use crate::config::IdleFlushConfig;
use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

/// Spawn the idle flush task, or return `None` if it is disabled.
///
/// The task exits when `stop_rx` becomes `true` or its sender is dropped.
pub fn spawn_idle_flush<S: BatchSink>(
    accumulator: Arc<SharedAccumulator<S>>,
    config: IdleFlushConfig,
    stop_rx: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        debug!("Idle flush disabled");
        return None;
    }
    let span = tracing::info_span!("idle_flush");
    Some(tokio::spawn(
        run_idle_flush(accumulator, config, stop_rx).instrument(span),
    ))
}

/// Idle flush loop.
pub async fn run_idle_flush<S: BatchSink>(
    accumulator: Arc<SharedAccumulator<S>>,
    config: IdleFlushConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(config.check_interval.max(Duration::from_millis(1)));
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        check_interval_ms = config.check_interval.as_millis() as u64,
        quiet_ms = config.quiet_period.as_millis() as u64,
        "Starting idle flush task"
    );

    loop {
        if *stop_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = timer.tick() => {
                match accumulator.flush_if_idle(config.quiet_period).await {
                    Ok(0) => {}
                    Ok(docs) => {
                        info!(docs, "Source idle, flushed partial batch");
                        metrics::record_idle_flush(docs);
                    }
                    Err(e) => {
                        warn!(error = %e, "Idle flush failed, stopping idle flush task");
                        break;
                    }
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Idle flush task stopping");
}
