//! # Couch Firehose
//!
//! Bulk replication of a CouchDB-style changes feed into a target database,
//! with bounded memory, a concurrency cap and a write-rate cap.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────────┐
//! │                              couch-firehose                                │
//! │                                                                            │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────────┐   ┌───────────┐  │
//! │  │ ChangeFeed │──►│ ChangeFilter │──►│ BatchAccumulator │──►│ Dispatch  │──┼──► BulkWriter
//! │  │ (_changes) │   │ + Transform  │   │ (batch_size)     │   │ Queue     │  │   (_bulk_docs)
//! │  └────────────┘   └──────────────┘   └──────────────────┘   │ C, R/sec  │  │
//! │        ▲                                      ▲             └─────┬─────┘  │
//! │        │ next chunk                           │ idle flush        │ depth  │
//! │  ┌─────┴──────────────┐              ┌────────┴───────┐           │        │
//! │  │ BackpressureGovernor│◄─────────────┼────────────────┼───────────┤        │
//! │  └────────────────────┘              │ IdleFlushTimer │           ▼        │
//! │                                      └────────────────┘   CompletionCoordinator
//! └────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use couch_firehose::couchdb::{CouchBulkWriter, CouchChangesFeed};
//! use couch_firehose::{DatabaseUrl, Firehose, FirehoseConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> couch_firehose::Result<()> {
//!     let config = FirehoseConfig::new(
//!         DatabaseUrl::parse("http://admin:pw@localhost:5984/source")?,
//!         DatabaseUrl::parse("http://admin:pw@localhost:5984/target")?,
//!     );
//!     config.validate()?;
//!
//!     let feed = CouchChangesFeed::from_config(&config)?;
//!     let writer = Arc::new(CouchBulkWriter::from_config(&config)?);
//!     let summary = Firehose::new(&config, feed, writer).run().await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod batch;
pub mod config;
pub mod coordinator;
pub mod couchdb;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod filter;
pub mod idle;
pub mod metrics;
pub mod resilience;
pub mod state;
pub mod store;

// Re-exports for convenience
pub use backpressure::BackpressureGovernor;
pub use batch::{BatchAccumulator, BatchSink, SharedAccumulator};
pub use config::{DatabaseUrl, FirehoseConfig, PipelineSettings};
pub use coordinator::{CompletionCoordinator, CompletionState, Firehose, RunSummary};
pub use dispatch::{DispatchConfig, DispatchQueue};
pub use document::{Batch, ChangeEvent, Document};
pub use error::{FirehoseError, Result};
pub use filter::{ChangeFilter, FieldTransform, FilterOptions, Transform};
pub use state::{PipelineState, ProgressSnapshot};
pub use store::{BulkWriteRequest, BulkWriter, ChangeFeed, WriteReport};
