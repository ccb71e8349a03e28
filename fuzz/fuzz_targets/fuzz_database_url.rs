//! Fuzz target for database URL parsing.
//!
//! `DatabaseUrl::parse` must never panic, and an accepted URL must never
//! print its password.

#![no_main]

use couch_firehose::DatabaseUrl;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|raw: &str| {
    if let Ok(url) = DatabaseUrl::parse(raw) {
        assert!(!url.database().is_empty());
        if let Some((_, Some(password))) = url.credentials() {
            if password.len() >= 4 {
                assert!(!format!("{url}").contains(password));
            }
        }
        let _ = url.endpoint("_changes");
    }
});
