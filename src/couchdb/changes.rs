//! Changes feed reader.
//!
//! Reads the source database's change log from `since` in pages of `limit`
//! rows with documents included. Each page advances `since` to the page's
//! `last_seq`.
//!
//! The feed ends when the server reports `pending: 0`. A filtered feed may
//! return short or empty pages while changes are still pending, so page
//! length only decides the end for servers that omit `pending`. A page that
//! does not move `last_seq` also ends the feed.

use super::{seq_to_string, CouchClient};
use crate::config::FirehoseConfig;
use crate::document::{ChangeEvent, Document};
use crate::error::{FirehoseError, Result};
use crate::metrics;
use crate::store::{BoxFuture, ChangeFeed};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Selector used to drop deletions at the source when none was given.
fn skip_deletions_selector() -> Value {
    json!({"_deleted": {"$exists": false}})
}

#[derive(Debug, Deserialize)]
struct ChangesPage {
    #[serde(default)]
    results: Vec<ChangeRow>,
    #[serde(default)]
    last_seq: Value,
    #[serde(default)]
    pending: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: String,
    #[serde(default)]
    seq: Value,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    doc: Option<Value>,
}

impl ChangeRow {
    fn into_event(self) -> ChangeEvent {
        ChangeEvent {
            doc: self.doc.and_then(Document::from_value),
            id: self.id,
            deleted: self.deleted,
            seq: seq_to_string(&self.seq),
        }
    }
}

/// Paged reader over `{db}/_changes`.
#[derive(Debug)]
pub struct CouchChangesFeed {
    client: CouchClient,
    since: String,
    limit: usize,
    selector: Option<Value>,
    finished: bool,
}

impl CouchChangesFeed {
    pub fn new(client: CouchClient, since: impl Into<String>, limit: usize) -> Self {
        Self {
            client,
            since: since.into(),
            limit: limit.max(1),
            selector: None,
            finished: false,
        }
    }

    /// Filter at the source with a Mango selector.
    pub fn with_selector(mut self, selector: Value) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Build a feed for `config.source`.
    ///
    /// An explicit selector wins; otherwise deletion filtering is pushed down
    /// to the source as a selector.
    pub fn from_config(config: &FirehoseConfig) -> Result<Self> {
        let client = CouchClient::new(config.source.clone())?;
        let feed = Self::new(client, config.feed.since.clone(), config.feed_page_size());
        let selector = match &config.feed.selector {
            Some(selector) => Some(selector.clone()),
            None if config.filter_deletions => Some(skip_deletions_selector()),
            None => None,
        };
        Ok(match selector {
            Some(selector) => feed.with_selector(selector),
            None => feed,
        })
    }

    /// Sequence token the next request starts from.
    pub fn since(&self) -> &str {
        &self.since
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[instrument(skip(self), fields(since = %self.since, limit = self.limit))]
    async fn fetch_page(&mut self) -> Result<Option<Vec<ChangeEvent>>> {
        if self.finished {
            return Ok(None);
        }

        let since = self.since.clone();
        let limit = self.limit.to_string();
        let mut query = vec![
            ("since", since.as_str()),
            ("include_docs", "true"),
            ("limit", limit.as_str()),
            ("seq_interval", limit.as_str()),
        ];
        let body = match &self.selector {
            Some(selector) => {
                query.push(("filter", "_selector"));
                json!({ "selector": selector })
            }
            None => json!({}),
        };

        let start = Instant::now();
        let resp = self
            .client
            .post("_changes")
            .query(&query)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                metrics::record_feed_request(false, start.elapsed());
                FirehoseError::source("_changes", e.to_string())
            })?;

        let status = resp.status();
        if !status.is_success() {
            metrics::record_feed_request(false, start.elapsed());
            let text = resp.text().await.unwrap_or_default();
            return Err(FirehoseError::source("_changes", format!("{status}: {text}")));
        }

        let page: ChangesPage = resp.json().await.map_err(|e| {
            metrics::record_feed_request(false, start.elapsed());
            FirehoseError::source("_changes", format!("invalid response: {e}"))
        })?;
        metrics::record_feed_request(true, start.elapsed());

        let rows = page.results.len();
        let more_pending = match page.pending {
            Some(pending) => pending > 0,
            None => rows >= self.limit,
        };

        let last_seq = seq_to_string(&page.last_seq);
        if last_seq.is_empty() || last_seq == self.since {
            if more_pending {
                warn!(
                    pending = page.pending,
                    "Changes page did not advance last_seq, treating it as the final page"
                );
            }
            self.finished = true;
        } else {
            self.since = last_seq;
            self.finished = !more_pending;
        }

        if rows == 0 && self.finished {
            return Ok(None);
        }

        debug!(
            rows,
            pending = page.pending,
            next_since = %self.since,
            finished = self.finished,
            "Fetched changes page"
        );
        Ok(Some(page.results.into_iter().map(ChangeRow::into_event).collect()))
    }
}

impl ChangeFeed for CouchChangesFeed {
    fn next_batch(&mut self) -> BoxFuture<'_, Option<Vec<ChangeEvent>>> {
        Box::pin(self.fetch_page())
    }
}
