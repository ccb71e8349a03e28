//! Configuration for the firehose.
//!
//! Configuration is built by the CLI (flags + environment) or programmatically,
//! then checked with [`FirehoseConfig::validate()`] before anything starts.
//! An invalid configuration is fatal.
//!
//! # Quick Start
//!
//! ```rust
//! use couch_firehose::config::{DatabaseUrl, FirehoseConfig};
//!
//! let config = FirehoseConfig {
//!     batch_size: 500,
//!     concurrency: 2,
//!     ..FirehoseConfig::new(
//!         DatabaseUrl::parse("http://localhost:5984/source").unwrap(),
//!         DatabaseUrl::parse("http://localhost:5984/target").unwrap(),
//!     )
//! };
//! config.validate().unwrap();
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! FirehoseConfig
//! ├── source / target: DatabaseUrl   # server URL + database name
//! ├── filters: deletions, design docs, reset _rev
//! ├── batch_size / concurrency / max_writes_per_second
//! ├── transform: Option<PathBuf>     # FieldTransform JSON file
//! ├── feed: FeedConfig               # since, selector, page size
//! └── settings: PipelineSettings
//!     ├── backpressure: BackpressureConfig
//!     ├── idle_flush: IdleFlushConfig
//!     ├── write_retry: RetryConfig
//!     └── progress_interval
//! ```

use crate::error::{FirehoseError, Result};
use crate::filter::FilterOptions;
use crate::resilience::{duration_serde, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

// ═══════════════════════════════════════════════════════════════════════════════
// DatabaseUrl: server URL with the database name in its path
// ═══════════════════════════════════════════════════════════════════════════════

/// A document store URL of the form `http(s)://[user:pass@]host[:port]/database`.
///
/// The database name is split out of the path and any credentials are
/// removed from the server URL and kept for basic auth.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatabaseUrl {
    original: String,
    server: Url,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

impl DatabaseUrl {
    /// Parse and validate a database URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut url = Url::parse(raw)
            .map_err(|e| FirehoseError::Config(format!("invalid URL {}: {e}", redact(raw))))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(FirehoseError::Config(format!(
                "unsupported URL scheme '{}' (expected http or https)",
                url.scheme()
            )));
        }

        let database = url.path().trim_start_matches('/').trim_end_matches('/').to_string();
        if database.is_empty() {
            return Err(FirehoseError::Config(format!(
                "URL {} is missing a database name",
                redact(raw)
            )));
        }

        let username = (!url.username().is_empty()).then(|| url.username().to_string());
        let password = url.password().map(str::to_string);
        // set_username/set_password only fail for cannot-be-a-base URLs, excluded above
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);

        Ok(Self {
            original: raw.to_string(),
            server: url,
            database,
            username,
            password,
        })
    }

    /// Server root without credentials or trailing slash.
    pub fn server_url(&self) -> String {
        self.server.as_str().trim_end_matches('/').to_string()
    }

    /// Database name (as it appears in the URL path).
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Full URL for a database-relative endpoint such as `_changes`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.server_url(), self.database, path.trim_start_matches('/'))
    }

    /// Basic-auth credentials taken from the URL.
    pub fn credentials(&self) -> Option<(&str, Option<&str>)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref()))
    }
}

impl std::fmt::Debug for DatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseUrl")
            .field("server", &self.server_url())
            .field("database", &self.database)
            .field("username", &self.username)
            .finish()
    }
}

impl std::fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.server_url(), self.database)
    }
}

impl std::str::FromStr for DatabaseUrl {
    type Err = FirehoseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DatabaseUrl {
    type Error = FirehoseError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<DatabaseUrl> for String {
    fn from(value: DatabaseUrl) -> Self {
        value.original
    }
}

/// Hide the password part of a URL for error messages.
fn redact(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to run one replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirehoseConfig {
    /// Change-feed origin.
    pub source: DatabaseUrl,

    /// Write destination.
    pub target: DatabaseUrl,

    /// Exclude deletion events from the stream.
    #[serde(default)]
    pub filter_deletions: bool,

    /// Exclude design documents.
    #[serde(default)]
    pub filter_design_docs: bool,

    /// Strip `_rev` before writing so the target assigns new revisions.
    #[serde(default)]
    pub reset_rev: bool,

    /// Documents per bulk write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Bulk writes in flight at one time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum bulk writes started per second.
    #[serde(default = "default_max_writes_per_second")]
    pub max_writes_per_second: u32,

    /// Optional path to a [`FieldTransform`](crate::filter::FieldTransform) JSON file.
    #[serde(default)]
    pub transform: Option<PathBuf>,

    /// Changes feed options.
    #[serde(default)]
    pub feed: FeedConfig,

    /// Pipeline tuning.
    #[serde(default)]
    pub settings: PipelineSettings,
}

fn default_batch_size() -> usize {
    500
}

fn default_concurrency() -> usize {
    2
}

fn default_max_writes_per_second() -> u32 {
    50
}

impl FirehoseConfig {
    /// Config with defaults for everything except the endpoints.
    pub fn new(source: DatabaseUrl, target: DatabaseUrl) -> Self {
        Self {
            source,
            target,
            filter_deletions: false,
            filter_design_docs: false,
            reset_rev: false,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_writes_per_second: default_max_writes_per_second(),
            transform: None,
            feed: FeedConfig::default(),
            settings: PipelineSettings::default(),
        }
    }

    /// Small batches and fast timings against the given endpoints.
    pub fn for_testing(source: DatabaseUrl, target: DatabaseUrl) -> Self {
        Self {
            batch_size: 10,
            concurrency: 2,
            max_writes_per_second: 1000,
            settings: PipelineSettings::testing(),
            ..Self::new(source, target)
        }
    }

    /// Check every limit. Any error here aborts startup.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size < 1 {
            return Err(FirehoseError::Config("BATCH_SIZE must be a number >= 1".to_string()));
        }
        if self.concurrency < 1 {
            return Err(FirehoseError::Config("CONCURRENCY must be a number >= 1".to_string()));
        }
        if self.max_writes_per_second < 1 {
            return Err(FirehoseError::Config(
                "MAX_WRITES_PER_SECOND must be a number >= 1".to_string(),
            ));
        }
        if self.source == self.target {
            return Err(FirehoseError::Config(
                "SOURCE_URL and TARGET_URL point at the same database".to_string(),
            ));
        }
        if self.feed.page_multiplier < 1 {
            return Err(FirehoseError::Config("feed page multiplier must be >= 1".to_string()));
        }
        if let Some(selector) = &self.feed.selector {
            if !selector.is_object() {
                return Err(FirehoseError::Config("SELECTOR must be a JSON object".to_string()));
            }
        }
        self.settings.validate()
    }

    /// Filter flags as a [`FilterOptions`].
    pub fn filter_options(&self) -> FilterOptions {
        FilterOptions {
            filter_deletions: self.filter_deletions,
            filter_design_docs: self.filter_design_docs,
            reset_rev: self.reset_rev,
        }
    }

    /// Changes requested per feed page.
    pub fn feed_page_size(&self) -> usize {
        self.batch_size.saturating_mul(self.feed.page_multiplier)
    }

    /// Queue depth at which the source is paused.
    pub fn backpressure_high_water(&self) -> usize {
        self.concurrency.saturating_mul(self.settings.backpressure.factor)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FeedConfig: changes feed options
// ═══════════════════════════════════════════════════════════════════════════════

/// Options passed to the changes feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Sequence token to start from.
    #[serde(default = "default_since")]
    pub since: String,

    /// Mango selector applied at the source.
    #[serde(default)]
    pub selector: Option<serde_json::Value>,

    /// Changes per page = `batch_size * page_multiplier`.
    #[serde(default = "default_page_multiplier")]
    pub page_multiplier: usize,
}

fn default_since() -> String {
    "0".to_string()
}

fn default_page_multiplier() -> usize {
    20
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            since: default_since(),
            selector: None,
            page_multiplier: default_page_multiplier(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PipelineSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// Tuning knobs for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub backpressure: BackpressureConfig,

    #[serde(default)]
    pub idle_flush: IdleFlushConfig,

    #[serde(default)]
    pub write_retry: RetryConfig,

    /// How often the progress line is printed. `None` disables it.
    #[serde(default = "default_progress_interval", with = "optional_duration")]
    pub progress_interval: Option<Duration>,
}

fn default_progress_interval() -> Option<Duration> {
    Some(Duration::from_secs(1))
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            backpressure: BackpressureConfig::default(),
            idle_flush: IdleFlushConfig::default(),
            write_retry: RetryConfig::default(),
            progress_interval: default_progress_interval(),
        }
    }
}

impl PipelineSettings {
    /// Fast timings and no progress output.
    pub fn testing() -> Self {
        Self {
            backpressure: BackpressureConfig {
                factor: 10,
                poll_interval: Duration::from_millis(10),
            },
            idle_flush: IdleFlushConfig {
                enabled: true,
                check_interval: Duration::from_millis(10),
                quiet_period: Duration::from_millis(50),
            },
            write_retry: RetryConfig::default(),
            progress_interval: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.backpressure.factor < 1 {
            return Err(FirehoseError::Config("backpressure factor must be >= 1".to_string()));
        }
        if self.backpressure.poll_interval.is_zero() {
            return Err(FirehoseError::Config(
                "backpressure poll interval must be non-zero".to_string(),
            ));
        }
        if self.idle_flush.enabled && self.idle_flush.check_interval.is_zero() {
            return Err(FirehoseError::Config(
                "idle flush check interval must be non-zero".to_string(),
            ));
        }
        if self.write_retry.max_attempts < 1 {
            return Err(FirehoseError::Config("write retry attempts must be >= 1".to_string()));
        }
        if self.progress_interval.is_some_and(|d| d.is_zero()) {
            return Err(FirehoseError::Config("progress interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Backpressure governor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// The source is paused while queue depth >= `concurrency * factor`.
    #[serde(default = "default_backpressure_factor")]
    pub factor: usize,

    /// Safety re-check interval while paused.
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,
}

fn default_backpressure_factor() -> usize {
    10
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            factor: default_backpressure_factor(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Idle flush timer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleFlushConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the accumulator is checked.
    #[serde(default = "default_check_interval", with = "duration_serde")]
    pub check_interval: Duration,

    /// Flush after this long without a new event.
    #[serde(default = "default_quiet_period", with = "duration_serde")]
    pub quiet_period: Duration,
}

fn default_true() -> bool {
    true
}

fn default_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_quiet_period() -> Duration {
    Duration::from_secs(5)
}

impl Default for IdleFlushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: default_check_interval(),
            quiet_period: default_quiet_period(),
        }
    }
}

mod optional_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
