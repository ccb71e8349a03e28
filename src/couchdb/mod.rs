//! CouchDB-compatible HTTP implementations of the store traits.
//!
//! - [`CouchChangesFeed`]: reads `POST {db}/_changes` page by page
//! - [`CouchBulkWriter`]: writes through `POST {db}/_bulk_docs`
//!
//! Both share a [`CouchClient`], which applies basic-auth credentials taken
//! from the database URL to every request.

mod bulk;
mod changes;

pub use bulk::CouchBulkWriter;
pub use changes::CouchChangesFeed;

use crate::config::DatabaseUrl;
use crate::error::Result;
use reqwest::RequestBuilder;

/// HTTP client bound to one database.
#[derive(Debug, Clone)]
pub struct CouchClient {
    http: reqwest::Client,
    database: DatabaseUrl,
}

impl CouchClient {
    /// Create a client with a fresh connection pool.
    pub fn new(database: DatabaseUrl) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("couch-firehose/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_http_client(http, database))
    }

    /// Create a client sharing an existing connection pool.
    pub fn with_http_client(http: reqwest::Client, database: DatabaseUrl) -> Self {
        Self { http, database }
    }

    pub fn database(&self) -> &DatabaseUrl {
        &self.database
    }

    /// `POST {db}/{path}` with credentials applied.
    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        let req = self.http.post(self.database.endpoint(path));
        match self.database.credentials() {
            Some((user, password)) => req.basic_auth(user, password),
            None => req,
        }
    }
}

/// Render a sequence token as a string whatever its JSON type.
///
/// CouchDB 2+ uses opaque strings, 1.x uses integers, and `seq_interval`
/// makes most rows carry `null`.
pub(crate) fn seq_to_string(seq: &serde_json::Value) -> String {
    match seq {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
