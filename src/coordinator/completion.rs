// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Completion coordinator.
//!
//! Decides when a run is really over: the source reported end-of-stream,
//! the trailing documents were flushed, and the dispatch queue drained. The
//! state lives in a `watch` channel so other tasks (idle flush, progress
//! reporter) can follow it.

use super::types::CompletionState;
use crate::error::{FirehoseError, Result};
use crate::metrics;
use tokio::sync::watch;
use tracing::{debug, info};

/// Tracks the four-state completion machine.
#[derive(Debug)]
pub struct CompletionCoordinator {
    state_tx: watch::Sender<CompletionState>,
}

impl Default for CompletionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionCoordinator {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(CompletionState::Running);
        metrics::set_pipeline_state("Running");
        Self { state_tx }
    }

    /// Current state.
    pub fn state(&self) -> CompletionState {
        *self.state_tx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<CompletionState> {
        self.state_tx.subscribe()
    }

    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    /// The source reported end-of-stream. Running → SourceDone.
    pub fn source_ended(&self) -> Result<()> {
        self.transition(CompletionState::Running, CompletionState::SourceDone)
    }

    /// The trailing flush has been pushed. SourceDone → Draining.
    pub fn begin_draining(&self) -> Result<()> {
        self.transition(CompletionState::SourceDone, CompletionState::Draining)
    }

    /// Feed a dispatch queue depth observation.
    ///
    /// Returns `true` exactly once: the first time depth zero is seen while
    /// draining. Zero depth in any earlier state is ignored.
    pub fn observe_depth(&self, depth: usize) -> bool {
        let completed = self.state_tx.send_if_modified(|state| {
            if *state == CompletionState::Draining && depth == 0 {
                *state = CompletionState::Complete;
                true
            } else {
                false
            }
        });
        if completed {
            metrics::set_pipeline_state("Complete");
            info!("Replication complete");
        }
        completed
    }

    fn transition(&self, from: CompletionState, to: CompletionState) -> Result<()> {
        let mut actual = from;
        let moved = self.state_tx.send_if_modified(|state| {
            actual = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(FirehoseError::InvalidState {
                expected: from.to_string(),
                actual: actual.to_string(),
            });
        }
        metrics::set_pipeline_state(&to.to_string());
        debug!(from = %from, to = %to, "Completion state changed");
        Ok(())
    }
}
