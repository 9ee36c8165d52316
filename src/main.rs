// feed_ingestor/src/main.rs
// Main entry point for the feed-ingestor CLI application.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use feed_ingestor::cli::{Cli, Commands, FeedArgs, MongoArgs};
use feed_ingestor::error::{IngestorError, Result};
use feed_ingestor::feed::HttpFeedSource;
use feed_ingestor::ingestor::{IngestorConfig, RunSummary, ingest_feed};
use feed_ingestor::mapping::FieldMapper;
use feed_ingestor::mongo::MongoStore;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(),> {
    // Initialize tracing
    let file_appender = tracing_appender::rolling::never(".", "feed_ingestor.log",);
    let (non_blocking, _guard,) = tracing_appender::non_blocking(file_appender,);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info",),),)
        .with(fmt::layer().with_writer(std::io::stderr,),)
        .with(fmt::layer().with_writer(non_blocking,).with_ansi(false,),)
        .init();

    let cli = Cli::parse();

    let summary = match &cli.command {
        Commands::Mongo(args,) => handle_mongo(args,).await,
    }
    .inspect_err(|e| error!("Ingestion failed: {}", e),)?;

    let json = serde_json::to_string_pretty(&summary,).map_err(|e| {
        IngestorError::Other(format!("Failed to serialize run summary: {}", e),)
    },)?;
    println!("{}", json);

    if let Some(path,) = &cli.report {
        save_report(path, &json,)?;
    }

    if cli.strict && summary.failed > 0 {
        return Err(IngestorError::Other(format!(
            "Strict mode enabled. {} of {} documents failed",
            summary.failed, summary.total_processed
        ),),);
    }
    Ok((),)
}

async fn handle_mongo(args: &MongoArgs,) -> Result<RunSummary,> {
    let (config, mapper,) = run_settings(&args.feed,)?;
    let source = HttpFeedSource::new(Duration::from_secs(args.feed.fetch_timeout_secs,),)?;

    let store = MongoStore::connect(&args.uri, &args.database, &args.collection,).await?;
    if args.ensure_index {
        store.ensure_indexes().await?;
        info!("Ensured unique job index on '{}.{}'", args.database, args.collection);
    }

    ingest_feed(&config, mapper, &source, &args.feed.feed_url, Arc::new(store,),).await
}

fn run_settings(args: &FeedArgs,) -> Result<(IngestorConfig, Arc<FieldMapper,>,),> {
    let mut mapper = FieldMapper::from_pairs(args.map.iter().cloned(),)?;
    if !args.no_default_id_mapping {
        mapper = mapper.with_default_job_id();
    }
    info!("Using {} field mappings", mapper.len());

    let config = IngestorConfig {
        client_id:    args.client_id.clone(),
        job_tag:      args.job_tag.clone(),
        batch_size:   args.batch_size,
        worker_count: args.workers,
        poll_timeout: Duration::from_millis(args.poll_timeout_ms,),
    };
    config.validate()?;

    Ok((config, Arc::new(mapper,),),)
}

fn save_report(path: &Path, json: &str,) -> Result<(),> {
    std::fs::write(path, json,).map_err(|e| {
        IngestorError::Other(format!("Failed to write {}: {}", path.display(), e),)
    },)?;
    info!("Run summary saved to {}", path.display());
    Ok((),)
}
