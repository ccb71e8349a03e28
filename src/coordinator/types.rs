//! Pipeline state types.
//!
//! Defines the completion state machine and the final run summary.
//!
//! # State Transitions
//!
//! ```text
//!            source_ended()          begin_draining()        observe_depth(0)
//! Running ─────────────────▶ SourceDone ───────────────▶ Draining ───────────────▶ Complete
//!    │                                                                          (terminal)
//!    └── never ends in continuous mode
//! ```
//!
//! # State Descriptions
//!
//! - **Running**: Events are flowing from the source.
//! - **SourceDone**: The source reported end-of-stream. Trailing documents
//!   are being force-flushed.
//! - **Draining**: Everything has been pushed to the dispatch queue; waiting
//!   for the last writes to be acknowledged.
//! - **Complete**: Source exhausted, accumulator empty, queue drained.

use std::time::Duration;

/// Completion state of a replication run.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    /// Events are flowing from the source.
    Running,

    /// The source reported end-of-stream.
    ///
    /// Remaining buffered documents are flushed in this state.
    SourceDone,

    /// Waiting for queued and in-flight writes to finish.
    Draining,

    /// Terminal. Final counters have been reported.
    Complete,
}

impl CompletionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CompletionState::Complete)
    }
}

impl std::fmt::Display for CompletionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionState::Running => write!(f, "Running"),
            CompletionState::SourceDone => write!(f, "SourceDone"),
            CompletionState::Draining => write!(f, "Draining"),
            CompletionState::Complete => write!(f, "Complete"),
        }
    }
}

/// Final counters for a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Documents that passed the filter.
    pub total_seen: u64,
    /// Documents acknowledged by the target.
    pub total_written: u64,
    /// Documents in failed batches or rejected individually.
    pub total_failed: u64,
    /// Bulk writes issued.
    pub batches_dispatched: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    /// Every document that was seen was written.
    pub fn is_complete_copy(&self) -> bool {
        self.total_failed == 0 && self.total_written == self.total_seen
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Written {} documents to the target database in {}s",
            self.total_written,
            self.elapsed.as_millis() as f64 / 1000.0
        )?;
        if self.total_failed > 0 {
            write!(f, " ({} failed)", self.total_failed)?;
        }
        Ok(())
    }
}
