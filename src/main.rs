//! `couch-firehose` command line entry point.
//!
//! Runs one replication from `SOURCE_URL` to `TARGET_URL` and exits once every
//! write has been acknowledged. Progress goes to stdout, logs to stderr.

use clap::Parser;
use couch_firehose::couchdb::{CouchBulkWriter, CouchChangesFeed};
use couch_firehose::resilience::RetryConfig;
use couch_firehose::{
    DatabaseUrl, FieldTransform, Firehose, FirehoseConfig, FirehoseError, Result, RunSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "couch-firehose", version, about)]
struct Cli {
    /// Source database URL, including the database name
    #[clap(short = 's', long = "source", env = "SOURCE_URL")]
    source: String,

    /// Target database URL, including the database name
    #[clap(short = 't', long = "target", env = "TARGET_URL")]
    target: String,

    /// Skip deleted documents
    #[clap(long = "filter-deletions", env = "FILTER_DELETIONS", default_value_t = false)]
    filter_deletions: bool,

    /// Skip design documents (`_design/...`)
    #[clap(long = "filter-design-docs", env = "FILTER_DESIGN_DOCS", default_value_t = false)]
    filter_design_docs: bool,

    /// Strip `_rev` so the target assigns fresh revisions
    #[clap(short = 'r', long = "reset-rev", env = "RESET_REV", default_value_t = false)]
    reset_rev: bool,

    /// Documents per bulk write
    #[clap(short = 'b', long = "batch-size", env = "BATCH_SIZE", default_value_t = 500)]
    batch_size: usize,

    /// Bulk writes in flight at one time
    #[clap(short = 'c', long = "concurrency", env = "CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Maximum bulk writes started per second
    #[clap(
        short = 'm',
        long = "max-writes",
        env = "MAX_WRITES_PER_SECOND",
        default_value_t = 50
    )]
    max_writes_per_second: u32,

    /// JSON file describing a field transform applied to every document
    #[clap(long = "transform", env = "TRANSFORM")]
    transform: Option<PathBuf>,

    /// Mango selector (JSON) evaluated by the source
    #[clap(long = "selector", env = "SELECTOR")]
    selector: Option<String>,

    /// Sequence token to start reading from
    #[clap(long = "since", env = "SINCE", default_value = "0")]
    since: String,

    /// Disable the flush of partial batches when the source goes quiet
    #[clap(long = "no-idle-flush", default_value_t = false)]
    no_idle_flush: bool,

    /// Extra attempts for a failed bulk write
    #[clap(long = "write-retries", env = "WRITE_RETRIES", default_value_t = 0)]
    write_retries: usize,
}

impl Cli {
    fn into_config(self) -> Result<FirehoseConfig> {
        let source = DatabaseUrl::parse(&self.source)
            .map_err(|e| FirehoseError::Config(format!("SOURCE_URL: {e}")))?;
        let target = DatabaseUrl::parse(&self.target)
            .map_err(|e| FirehoseError::Config(format!("TARGET_URL: {e}")))?;

        let mut config = FirehoseConfig::new(source, target);
        config.filter_deletions = self.filter_deletions;
        config.filter_design_docs = self.filter_design_docs;
        config.reset_rev = self.reset_rev;
        config.batch_size = self.batch_size;
        config.concurrency = self.concurrency;
        config.max_writes_per_second = self.max_writes_per_second;
        config.transform = self.transform;
        config.feed.since = self.since;
        config.feed.selector = self
            .selector
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| FirehoseError::Config(format!("SELECTOR is not valid JSON: {e}")))
            })
            .transpose()?;
        config.settings.idle_flush.enabled = !self.no_idle_flush;
        config.settings.write_retry = RetryConfig::with_retries(self.write_retries);

        config.validate()?;
        Ok(config)
    }
}

async fn replicate(config: FirehoseConfig) -> Result<RunSummary> {
    let transform = config
        .transform
        .as_ref()
        .map(FieldTransform::from_file)
        .transpose()?;

    let feed = CouchChangesFeed::from_config(&config)?;
    let writer = Arc::new(CouchBulkWriter::from_config(&config)?);

    info!(
        source = %config.source,
        target = %config.target,
        batch_size = config.batch_size,
        concurrency = config.concurrency,
        max_writes_per_second = config.max_writes_per_second,
        "Starting replication"
    );

    let mut firehose = Firehose::new(&config, feed, writer);
    if let Some(transform) = transform {
        firehose = firehose.with_transform(Arc::new(transform));
    }
    firehose.run().await
}

/// Errors in startup input exit with 2.
fn exit_code(err: &FirehoseError) -> ExitCode {
    if is_usage_error(err) {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn is_usage_error(err: &FirehoseError) -> bool {
    matches!(
        err,
        FirehoseError::Config(_) | FirehoseError::Io(_) | FirehoseError::Json(_)
    )
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return exit_code(&e);
        }
    };

    match replicate(config).await {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Replication failed");
            exit_code(&e)
        }
    }
}
