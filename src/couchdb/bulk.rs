//! Bulk document writer.

use super::CouchClient;
use crate::config::FirehoseConfig;
use crate::document::Document;
use crate::error::{FirehoseError, Result};
use crate::store::{BoxFuture, BulkWriteRequest, BulkWriter, RejectedDoc, WriteReport};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

#[derive(Serialize)]
struct BulkDocsBody<'a> {
    docs: &'a [Document],
    #[serde(skip_serializing_if = "Option::is_none")]
    new_edits: Option<bool>,
}

/// One row of a `_bulk_docs` response.
#[derive(Debug, Deserialize)]
struct BulkDocsRow {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Writes batches with `POST {db}/_bulk_docs`.
///
/// Batches with revision markers are sent with `"new_edits": false` so the
/// target stores the given revisions as-is.
#[derive(Debug, Clone)]
pub struct CouchBulkWriter {
    client: CouchClient,
}

impl CouchBulkWriter {
    pub fn new(client: CouchClient) -> Self {
        Self { client }
    }

    /// Build a writer for `config.target`.
    pub fn from_config(config: &FirehoseConfig) -> Result<Self> {
        Ok(Self::new(CouchClient::new(config.target.clone())?))
    }

    #[instrument(skip_all, fields(docs = request.docs.len(), preserve_revisions = request.preserve_revisions))]
    async fn write(&self, request: BulkWriteRequest) -> Result<WriteReport> {
        let docs = request.docs.len();
        let body = BulkDocsBody {
            docs: &request.docs,
            new_edits: request.preserve_revisions.then_some(false),
        };

        let resp = self
            .client
            .post("_bulk_docs")
            .json(&body)
            .send()
            .await
            .map_err(|e| FirehoseError::write(docs, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FirehoseError::write(docs, format!("{status}: {text}")));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| FirehoseError::write(docs, e.to_string()))?;
        Ok(parse_report(docs, &text))
    }
}

/// Turn a successful `_bulk_docs` body into a report.
///
/// Rows with an `error` are individual rejections. An unreadable body on a
/// 2xx is logged and the whole batch is taken as written.
fn parse_report(docs: usize, body: &str) -> WriteReport {
    if body.trim().is_empty() {
        return WriteReport::accepted(docs);
    }
    let rows: Vec<BulkDocsRow> = match serde_json::from_str(body) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "Unreadable _bulk_docs response, assuming all documents written");
            return WriteReport::accepted(docs);
        }
    };

    let rejected: Vec<RejectedDoc> = rows
        .into_iter()
        .filter_map(|row| {
            row.error.map(|error| RejectedDoc {
                id: row.id.unwrap_or_default(),
                error,
                reason: row.reason.unwrap_or_default(),
            })
        })
        .collect();

    WriteReport {
        written: docs.saturating_sub(rejected.len()),
        rejected,
    }
}

impl BulkWriter for CouchBulkWriter {
    fn bulk_write(&self, request: BulkWriteRequest) -> BoxFuture<'_, WriteReport> {
        Box::pin(self.write(request))
    }
}
