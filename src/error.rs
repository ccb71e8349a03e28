// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the firehose.
//!
//! Errors are categorized by where they originate (configuration, the source
//! changes feed, the target bulk writer) and carry enough context to be
//! printed directly to an operator.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Fatal | Description |
//! |------------|-----------|-------|-------------|
//! | `Config` | No | Yes, before start | Invalid URL, missing database, non-positive limits |
//! | `Source` | Yes | Yes | Changes feed transport failure |
//! | `Write` | Yes | No | Target rejected or unreachable for one batch |
//! | `Http` | Yes | Depends on caller | Raw transport error from `reqwest` |
//! | `Json` | No | Yes, before start | Malformed transform file |
//! | `Io` | No | Yes, before start | Transform file cannot be read |
//! | `InvalidState` | No | Yes | Completion state machine violation |
//! | `Internal` | No | Yes | Unexpected internal error |
//!
//! A `Write` error never stops the pipeline: the batch is logged and counted
//! as failed. A `Source` error ends the run; buffered documents are not
//! guaranteed to be flushed.

use thiserror::Error;

/// Result type alias for firehose operations.
pub type Result<T> = std::result::Result<T, FirehoseError>;

/// Errors that can occur while replicating.
#[derive(Error, Debug)]
pub enum FirehoseError {
    /// Invalid or missing configuration.
    ///
    /// Raised during startup validation. The pipeline never starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The changes feed failed.
    ///
    /// Pipeline-fatal: the run ends and buffered documents may not be written.
    #[error("Source error ({operation}): {message}")]
    Source { operation: String, message: String },

    /// The target rejected a bulk write or could not be reached.
    ///
    /// The batch is logged and counted as failed. It is not requeued.
    #[error("Write error ({docs} docs): {message}")]
    Write { docs: usize, message: String },

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O error (reading transform files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Completion state machine violation.
    ///
    /// Occurs when a transition is requested from the wrong state
    /// (e.g., draining before the source has ended).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FirehoseError {
    /// Create a source error for a named feed operation.
    pub fn source(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a write error for a batch of `docs` documents.
    pub fn write(docs: usize, message: impl Into<String>) -> Self {
        Self::Write {
            docs,
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source { .. } => true,
            Self::Write { .. } => true,
            Self::Http(_) => true,
            Self::Config(_) => false,
            Self::Json(_) => false,
            Self::Io(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must stop the pipeline.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Write { .. })
    }
}

impl From<url::ParseError> for FirehoseError {
    fn from(e: url::ParseError) -> Self {
        Self::Config(format!("invalid URL: {e}"))
    }
}
