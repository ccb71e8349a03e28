//! Shared test utilities for pipeline tests.
//!
//! This module provides:
//! - Scripted change feeds (chunks, pauses, failures)
//! - A recording bulk writer with configurable latency and failures
//! - Change event helpers

pub mod mock_store;

pub use mock_store::*;

use couch_firehose::{ChangeEvent, DatabaseUrl, Document, FirehoseConfig};
use serde_json::json;

/// Config pointing at two placeholder databases with fast test timings.
pub fn test_config() -> FirehoseConfig {
    FirehoseConfig::for_testing(
        DatabaseUrl::parse("http://localhost:5984/source").unwrap(),
        DatabaseUrl::parse("http://localhost:5984/target").unwrap(),
    )
}

/// Update event for `doc-{n}` without a revision.
pub fn event(n: usize) -> ChangeEvent {
    let doc = Document::from_value(json!({"_id": format!("doc-{n}"), "n": n})).unwrap();
    ChangeEvent::update(n.to_string(), doc)
}

/// Update event for `doc-{n}` carrying `_rev`.
pub fn event_with_rev(n: usize) -> ChangeEvent {
    let doc = Document::from_value(json!({
        "_id": format!("doc-{n}"),
        "_rev": format!("1-{n:04x}"),
        "n": n,
    }))
    .unwrap();
    ChangeEvent::update(n.to_string(), doc)
}

/// `count` update events numbered from 0.
pub fn events(count: usize) -> Vec<ChangeEvent> {
    (0..count).map(event).collect()
}
