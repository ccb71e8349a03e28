//! Fuzz target for batch accumulation.
//!
//! Any batch size and any sequence of appends and flushes must emit every
//! document exactly once, in order, in batches no larger than the batch size.

#![no_main]

use couch_firehose::{BatchAccumulator, Document};
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

fuzz_target!(|data: (u8, Vec<bool>)| {
    let (batch_size, ops) = data;
    let batch_size = usize::from(batch_size).max(1);
    let mut acc = BatchAccumulator::new(batch_size);
    let mut emitted = Vec::new();
    let mut appended = 0usize;

    for flush in ops {
        if flush {
            emitted.extend(acc.flush_if_idle(Duration::ZERO));
        } else {
            let doc = Document::from_value(serde_json::json!({"_id": appended.to_string()}));
            appended += 1;
            if let Some(doc) = doc {
                emitted.extend(acc.append(doc));
            }
        }
    }
    emitted.extend(acc.force_flush());

    assert!(emitted.iter().all(|b| !b.is_empty() && b.len() <= batch_size));
    let ids: Vec<String> = emitted
        .iter()
        .flat_map(|b| b.docs().iter().filter_map(|d| d.id().map(str::to_string)))
        .collect();
    let expected: Vec<String> = (0..appended).map(|n| n.to_string()).collect();
    assert_eq!(ids, expected);
});
