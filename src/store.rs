// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source and target store traits.
//!
//! The pipeline talks to the outside world through two seams:
//!
//! - [`ChangeFeed`]: a pull-style change stream. Each call to
//!   [`next_batch()`](ChangeFeed::next_batch) returns the next chunk of
//!   events; calling it again is the acknowledgement that the previous chunk
//!   has been taken in. `None` means end-of-stream.
//! - [`BulkWriter`]: writes one batch to the target.
//!
//! The CouchDB HTTP implementations live in [`crate::couchdb`]. In-memory
//! implementations ([`VecFeed`], [`NoOpWriter`]) are provided for tests and
//! dry runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use couch_firehose::store::{BoxFuture, BulkWriter, BulkWriteRequest, WriteReport};
//!
//! struct StdoutWriter;
//!
//! impl BulkWriter for StdoutWriter {
//!     fn bulk_write(&self, request: BulkWriteRequest) -> BoxFuture<'_, WriteReport> {
//!         Box::pin(async move {
//!             for doc in &request.docs {
//!                 println!("{}", serde_json::to_string(doc)?);
//!             }
//!             Ok(WriteReport::accepted(request.docs.len()))
//!         })
//!     }
//! }
//! ```

use crate::document::{Batch, ChangeEvent, Document};
use crate::error::Result;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Pull-style change stream from the source store.
pub trait ChangeFeed: Send + 'static {
    /// Fetch the next chunk of change events.
    ///
    /// Returns `Ok(None)` once the source is exhausted. An empty chunk is
    /// allowed and simply means "nothing yet".
    fn next_batch(&mut self) -> BoxFuture<'_, Option<Vec<ChangeEvent>>>;
}

/// One bulk write against the target store.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteRequest {
    pub docs: Vec<Document>,
    /// Keep the documents' existing `_rev` values instead of letting the
    /// target assign new ones.
    pub preserve_revisions: bool,
}

impl From<Batch> for BulkWriteRequest {
    fn from(batch: Batch) -> Self {
        let preserve_revisions = batch.has_revision_markers();
        Self {
            docs: batch.into_docs(),
            preserve_revisions,
        }
    }
}

/// A single document the target refused inside an otherwise successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDoc {
    pub id: String,
    pub error: String,
    pub reason: String,
}

/// Result of a bulk write the target accepted as a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Documents stored.
    pub written: usize,
    /// Documents refused individually (conflicts, validation failures).
    pub rejected: Vec<RejectedDoc>,
}

impl WriteReport {
    /// Every document in a request of `docs` documents was stored.
    pub fn accepted(docs: usize) -> Self {
        Self {
            written: docs,
            rejected: Vec::new(),
        }
    }
}

/// Target store writer.
///
/// Implementations must be safe to call from several tasks at once; the
/// dispatch queue runs up to `concurrency` writes in parallel.
pub trait BulkWriter: Send + Sync + 'static {
    /// Write one batch.
    ///
    /// `Err` means the whole request failed (transport error, non-2xx).
    fn bulk_write(&self, request: BulkWriteRequest) -> BoxFuture<'_, WriteReport>;
}

impl<W: BulkWriter + ?Sized> BulkWriter for std::sync::Arc<W> {
    fn bulk_write(&self, request: BulkWriteRequest) -> BoxFuture<'_, WriteReport> {
        (**self).bulk_write(request)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory implementations
// ═══════════════════════════════════════════════════════════════════════════════

/// A change feed over a fixed list of chunks.
#[derive(Debug, Default)]
pub struct VecFeed {
    chunks: VecDeque<Vec<ChangeEvent>>,
}

impl VecFeed {
    /// Feed that yields each chunk in turn, then ends.
    pub fn new(chunks: Vec<Vec<ChangeEvent>>) -> Self {
        Self {
            chunks: chunks.into(),
        }
    }

    /// Split `events` into chunks of `chunk_size` (at least 1).
    pub fn chunked(events: Vec<ChangeEvent>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::new();
        let mut iter = events.into_iter().peekable();
        while iter.peek().is_some() {
            chunks.push_back(iter.by_ref().take(chunk_size).collect());
        }
        Self { chunks }
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

impl ChangeFeed for VecFeed {
    fn next_batch(&mut self) -> BoxFuture<'_, Option<Vec<ChangeEvent>>> {
        let next = self.chunks.pop_front();
        Box::pin(async move { Ok(next) })
    }
}

/// Writer that accepts everything and stores nothing.
///
/// Records request sizes so dry runs can report what would have been written.
#[derive(Debug, Default)]
pub struct NoOpWriter {
    requests: Mutex<Vec<(usize, bool)>>,
}

impl NoOpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(docs, preserve_revisions)` for every request seen, in call order.
    pub fn requests(&self) -> Vec<(usize, bool)> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl BulkWriter for NoOpWriter {
    fn bulk_write(&self, request: BulkWriteRequest) -> BoxFuture<'_, WriteReport> {
        let docs = request.docs.len();
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((docs, request.preserve_revisions));
        }
        Box::pin(async move { Ok(WriteReport::accepted(docs)) })
    }
}
