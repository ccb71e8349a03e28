// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pipeline tests: feed → filter → accumulator → dispatch → writer.
//!
//! All collaborators are in-memory, so these run without a database.
//!
//! # Running Tests
//! ```bash
//! cargo test --test pipeline
//! ```
//!
//! # Test Organization
//! - `batching_*` - batch boundaries and ordering
//! - `filter_*` - deletions, design docs, revisions
//! - `limits_*` - concurrency, write rate, backpressure
//! - `completion_*` - end-of-stream, failures, state transitions

mod common;

use common::{event, event_with_rev, events, test_config, RecordingWriter, ScriptedFeed, Step};
use couch_firehose::{ChangeEvent, CompletionState, Document, Firehose, FirehoseError};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Batching
// =============================================================================

#[tokio::test]
async fn batching_1050_events_into_500_500_50() {
    let mut config = test_config();
    config.batch_size = 500;
    config.concurrency = 2;
    config.max_writes_per_second = 1000;

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::chunked(events(1050), 300);

    let summary = Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    let mut sizes = writer.batch_sizes();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![50, 500, 500]);
    assert_eq!(summary.total_seen, 1050);
    assert_eq!(summary.total_written, 1050);
    assert_eq!(summary.batches_dispatched, 3);
    assert!(summary.is_complete_copy());
}

#[tokio::test]
async fn batching_preserves_order_with_single_writer() {
    let mut config = test_config();
    config.batch_size = 7;
    config.concurrency = 1;

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::chunked(events(100), 13);

    Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    let expected: Vec<String> = (0..100).map(|n| format!("doc-{n}")).collect();
    assert_eq!(writer.written_ids(), expected);
    let sizes = writer.batch_sizes();
    assert_eq!(sizes.len(), 15);
    assert!(sizes[..14].iter().all(|&s| s == 7));
    assert_eq!(sizes[14], 2);
}

#[tokio::test]
async fn batching_no_partial_batch_before_end() {
    let mut config = test_config();
    config.batch_size = 10;
    config.settings.idle_flush.enabled = false;

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::chunked(events(25), 3);

    Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    let sizes = writer.batch_sizes();
    assert_eq!(sizes.iter().filter(|&&s| s < 10).count(), 1);
    assert_eq!(sizes.iter().sum::<usize>(), 25);
}

#[tokio::test]
async fn batching_empty_chunks_are_harmless() {
    let config = test_config();
    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(vec![
        Step::Chunk(vec![]),
        Step::Chunk(events(3)),
        Step::Chunk(vec![]),
    ]);

    let summary = Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.total_written, 3);
    assert_eq!(writer.batch_sizes(), vec![3]);
}

// =============================================================================
// Filtering and revision handling
// =============================================================================

#[tokio::test]
async fn filter_deletions_never_reach_writer() {
    let mut config = test_config();
    config.filter_deletions = true;

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(vec![Step::Chunk(vec![
        event(1),
        ChangeEvent::deletion("2", "doc-2", "2-dead"),
        event(3),
    ])]);

    let summary = Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.total_seen, 2);
    assert_eq!(writer.written_ids(), vec!["doc-1", "doc-3"]);
}

#[tokio::test]
async fn filter_deletions_replicated_when_not_filtered() {
    let config = test_config();
    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(vec![Step::Chunk(vec![ChangeEvent::deletion(
        "1", "gone", "3-abc",
    )])]);

    Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    let calls = writer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].ids, vec!["gone"]);
    assert!(calls[0].preserve_revisions);
}

#[tokio::test]
async fn filter_design_docs() {
    let mut config = test_config();
    config.filter_design_docs = true;

    let design = Document::from_value(json!({"_id": "_design/views", "views": {}})).unwrap();
    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(vec![Step::Chunk(vec![
        ChangeEvent::update("1", design),
        event(2),
    ])]);

    let summary = Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();
    assert_eq!(summary.total_seen, 1);
    assert_eq!(writer.written_ids(), vec!["doc-2"]);
}

#[tokio::test]
async fn filter_revisions_select_write_mode() {
    let mut config = test_config();
    config.batch_size = 5;
    config.concurrency = 1;

    let writer = Arc::new(RecordingWriter::new());
    let mut input: Vec<ChangeEvent> = (0..5).map(event_with_rev).collect();
    input.extend((5..10).map(event));
    let feed = ScriptedFeed::chunked(input, 10);

    Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    let calls = writer.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].preserve_revisions);
    assert!(calls[0].had_revs);
    assert!(!calls[1].preserve_revisions);
}

#[tokio::test]
async fn filter_reset_rev_writes_in_standard_mode() {
    let mut config = test_config();
    config.reset_rev = true;

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(vec![Step::Chunk((0..4).map(event_with_rev).collect())]);

    Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    let calls = writer.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].preserve_revisions);
    assert!(!calls[0].had_revs);
}

#[tokio::test]
async fn filter_transform_drops_documents() {
    let config = test_config();
    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::chunked(events(20), 20);

    let summary = Firehose::new(&config, feed, Arc::clone(&writer))
        .with_transform(Arc::new(|doc: Document| {
            let keep = doc.get("n").and_then(|n| n.as_u64()).is_some_and(|n| n < 5);
            keep.then_some(doc)
        }))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.total_seen, 5);
    assert_eq!(summary.total_written, 5);
}

// =============================================================================
// Limits
// =============================================================================

#[tokio::test]
async fn limits_concurrency_never_exceeded() {
    let mut config = test_config();
    config.batch_size = 5;
    config.concurrency = 3;

    let writer = Arc::new(RecordingWriter::slow(Duration::from_millis(15)));
    let feed = ScriptedFeed::chunked(events(200), 50);

    let summary = Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.total_written, 200);
    assert!(writer.max_in_flight() <= 3, "max in flight {}", writer.max_in_flight());
    assert!(writer.max_in_flight() >= 2);
}

#[tokio::test]
async fn limits_write_rate_spaces_out_writes() {
    let mut config = test_config();
    config.batch_size = 2;
    config.concurrency = 4;
    config.max_writes_per_second = 20;

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::chunked(events(10), 10);

    let start = Instant::now();
    Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    // Five writes at 20/s: the first is immediate, the rest 50ms apart.
    assert_eq!(writer.batch_sizes().len(), 5);
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn limits_backpressure_bounds_outstanding_documents() {
    let mut config = test_config();
    config.batch_size = 10;
    config.concurrency = 1;
    config.settings.backpressure.factor = 2;
    let high_water = config.backpressure_high_water();

    let writer = Arc::new(RecordingWriter::slow(Duration::from_millis(10)));
    let feed = ScriptedFeed::chunked(events(200), 10);
    let observer = feed.observer();
    let outstanding = feed.outstanding();

    let firehose = Firehose::new(&config, feed, Arc::clone(&writer));
    let state = firehose.state();
    observer.set(Arc::clone(&state)).unwrap();
    let summary = firehose.run().await.unwrap();

    assert_eq!(summary.total_written, 200);
    assert_eq!(state.total_written(), 200);
    let samples = outstanding.lock().unwrap().clone();
    assert!(!samples.is_empty());
    let max = samples.into_iter().max().unwrap_or(0);
    assert!(
        max <= (high_water * config.batch_size) as u64,
        "outstanding {max} exceeds {} batches of {}",
        high_water,
        config.batch_size
    );
}

// =============================================================================
// Completion
// =============================================================================

#[tokio::test]
async fn completion_empty_source() {
    let config = test_config();
    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(vec![]);
    let calls = feed.calls();

    let firehose = Firehose::new(&config, feed, Arc::clone(&writer));
    let completion = firehose.completion_receiver();
    let summary = firehose.run().await.unwrap();

    assert_eq!(summary.total_written, 0);
    assert_eq!(summary.total_seen, 0);
    assert!(writer.calls().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*completion.borrow(), CompletionState::Complete);
}

#[tokio::test]
async fn completion_waits_for_slow_writes() {
    let mut config = test_config();
    config.batch_size = 10;

    let writer = Arc::new(RecordingWriter::slow(Duration::from_millis(50)));
    let feed = ScriptedFeed::chunked(events(30), 30);

    let summary = Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    // Every write was acknowledged before run() returned.
    assert_eq!(summary.total_written, 30);
    assert_eq!(writer.batch_sizes().len(), 3);
}

#[tokio::test]
async fn completion_states_advance_in_order() {
    let mut config = test_config();
    config.batch_size = 10;

    let writer = Arc::new(RecordingWriter::slow(Duration::from_millis(5)));
    let feed = ScriptedFeed::chunked(events(55), 10);
    let firehose = Firehose::new(&config, feed, Arc::clone(&writer));

    let mut rx = firehose.completion_receiver();
    let watcher = tokio::spawn(async move {
        let mut seen = vec![*rx.borrow_and_update()];
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            seen.push(state);
            if state.is_terminal() {
                break;
            }
        }
        seen
    });

    firehose.run().await.unwrap();
    let seen = watcher.await.unwrap();

    assert_eq!(seen.last(), Some(&CompletionState::Complete));
    assert_eq!(
        seen.iter().filter(|s| **s == CompletionState::Complete).count(),
        1
    );
    let rank = |s: &CompletionState| match s {
        CompletionState::Running => 0,
        CompletionState::SourceDone => 1,
        CompletionState::Draining => 2,
        CompletionState::Complete => 3,
    };
    assert!(seen.windows(2).all(|w| rank(&w[0]) < rank(&w[1])));
}

#[tokio::test]
async fn completion_write_failures_are_counted_not_fatal() {
    let mut config = test_config();
    config.batch_size = 10;

    let writer = Arc::new(RecordingWriter::failing());
    let feed = ScriptedFeed::chunked(events(25), 25);

    let summary = Firehose::new(&config, feed, Arc::clone(&writer))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.total_seen, 25);
    assert_eq!(summary.total_written, 0);
    assert_eq!(summary.total_failed, 25);
    assert!(!summary.is_complete_copy());
    assert!(summary.to_string().contains("(25 failed)"));
}

#[tokio::test]
async fn completion_source_error_ends_run() {
    let mut config = test_config();
    config.batch_size = 10;

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(vec![
        Step::Chunk(events(10)),
        Step::Fail("connection reset".to_string()),
        Step::Chunk(events(10)),
    ]);
    let firehose = Firehose::new(&config, feed, Arc::clone(&writer));
    let completion = firehose.completion_receiver();

    let err = firehose.run().await.unwrap_err();
    assert!(matches!(err, FirehoseError::Source { .. }));
    assert!(err.to_string().contains("connection reset"));
    assert_ne!(*completion.borrow(), CompletionState::Complete);
}

#[tokio::test]
async fn completion_idle_flush_writes_partial_batch_while_source_is_quiet() {
    let mut config = test_config();
    config.batch_size = 100;

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(vec![
        Step::Chunk(events(5)),
        Step::Pause(Duration::from_millis(400)),
        Step::Chunk((5..8).map(event).collect()),
    ]);

    let run = tokio::spawn(Firehose::new(&config, feed, Arc::clone(&writer)).run());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(writer.batch_sizes(), vec![5]);

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.total_written, 8);
    assert_eq!(writer.batch_sizes(), vec![5, 3]);
}

#[tokio::test]
async fn completion_filtered_events_keep_idle_flush_away() {
    let mut config = test_config();
    config.batch_size = 100;
    config.filter_deletions = true;

    let mut steps = vec![Step::Chunk(events(5))];
    for n in 5..20 {
        steps.push(Step::Pause(Duration::from_millis(15)));
        steps.push(Step::Chunk(vec![ChangeEvent::deletion(
            n.to_string(),
            format!("gone-{n}"),
            "2-x",
        )]));
    }

    let writer = Arc::new(RecordingWriter::new());
    let feed = ScriptedFeed::new(steps);
    let run = tokio::spawn(Firehose::new(&config, feed, Arc::clone(&writer)).run());

    // deletions arrive every 15ms, well inside the 50ms quiet period
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(writer.batch_sizes().is_empty());

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.total_written, 5);
    assert_eq!(writer.batch_sizes(), vec![5]);
}
