// feed_ingestor/src/cli.rs
// Command Line Interface (CLI) specific logic for feed_ingestor.

use std::path::PathBuf;

use clap::Parser;

/// Command Line Interface for the feed_ingestor crate.
#[derive(Parser, Debug,)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// The document store to ingest the feed into.
    #[clap(subcommand)]
    pub command: Commands,

    /// Exit with an error when any document of the run was rejected.
    #[clap(long)]
    pub strict: bool,

    /// Write the run summary as JSON to this path.
    #[clap(long)]
    pub report: Option<PathBuf,>,
}

#[derive(Parser, Debug,)]
pub enum Commands {
    /// Ingest a job feed into MongoDB
    Mongo(MongoArgs,),
}

#[derive(Parser, Debug,)]
pub struct FeedArgs {
    /// URL (http, https or file) or local path of the XML feed; `.gz` feeds are inflated
    #[clap(long, env = "FEED_URL")]
    pub feed_url: String,

    /// Client identifier attached to every ingested job
    #[clap(long, env = "CLIENT_ID")]
    pub client_id: String,

    /// Field mappings from feed tag to stored field (e.g., --map title:job_title,id:job_id)
    #[clap(long, value_parser = parse_key_val, value_delimiter = ',', required = true)]
    pub map: Vec<(String, String,),>,

    /// Do not add the default `id:job_id` mapping when no identifier is mapped
    #[clap(long)]
    pub no_default_id_mapping: bool,

    /// Element name that delimits one job record
    #[clap(long, default_value = crate::DEFAULT_JOB_TAG)]
    pub job_tag: String,

    /// Number of documents per bulk insert
    #[clap(long, default_value_t = crate::DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Number of persistence workers
    #[clap(short, long, default_value_t = crate::DEFAULT_WORKER_COUNT)]
    pub workers: usize,

    /// Queue poll interval for idle workers, in milliseconds
    #[clap(long, default_value_t = crate::DEFAULT_POLL_TIMEOUT_MS)]
    pub poll_timeout_ms: u64,

    /// Timeout for downloading the feed, in seconds
    #[clap(long, default_value_t = 600)]
    pub fetch_timeout_secs: u64,
}

/// Parse a single key-value pair
fn parse_key_val(s: &str,) -> Result<(String, String,), String,> {
    let pos = s
        .find(':',)
        .ok_or_else(|| format!("invalid KEY:VALUE: no `:` found in `{}`", s),)?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string(),),)
}

#[derive(Parser, Debug,)]
pub struct MongoArgs {
    /// Connection string for MongoDB
    #[clap(long, env = "MONGO_URI")]
    pub uri: String,

    /// Database holding the job collection
    #[clap(long, default_value = crate::DEFAULT_DATABASE_NAME)]
    pub database: String,

    /// Collection the jobs are inserted into
    #[clap(long, default_value = crate::DEFAULT_COLLECTION_NAME)]
    pub collection: String,

    /// Create the unique (feed_id, mapped_fields.job_id) index before ingesting
    #[clap(long)]
    pub ensure_index: bool,

    #[clap(flatten)]
    pub feed: FeedArgs,
}
