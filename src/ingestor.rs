// feed_ingestor/src/ingestor.rs
// Run orchestration: parser -> queue -> worker pool -> store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{Instrument, Span, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{IngestorError, Result};
use crate::feed::{FeedSource, load_feed};
use crate::mapping::FieldMapper;
use crate::parser::{ParseStats, StreamingRecordParser};
use crate::queue::RecordQueue;
use crate::store::DocumentStore;
use crate::worker::{BatchPersistenceWorker, RunCounters};

/// Configuration for one ingestion run.
#[derive(Debug, Clone,)]
pub struct IngestorConfig {
    /// Attached verbatim to every record of the run.
    pub client_id:    String,
    /// Element name that delimits one job record.
    pub job_tag:      String,
    pub batch_size:   usize,
    pub worker_count: usize,
    /// How long a worker waits on an empty queue before polling again.
    pub poll_timeout: Duration,
}

impl IngestorConfig {
    pub fn new(client_id: impl Into<String,>,) -> Self {
        Self {
            client_id:    client_id.into(),
            job_tag:      crate::DEFAULT_JOB_TAG.to_string(),
            batch_size:   crate::DEFAULT_BATCH_SIZE,
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_timeout: Duration::from_millis(crate::DEFAULT_POLL_TIMEOUT_MS,),
        }
    }

    pub fn validate(&self,) -> Result<(),> {
        if self.client_id.trim().is_empty() {
            return Err(IngestorError::ConfigurationError("A client id is required".to_string(),),);
        }
        if self.job_tag.trim().is_empty() {
            return Err(IngestorError::ConfigurationError(
                "The job element tag must not be empty".to_string(),
            ),);
        }
        if self.batch_size == 0 || self.worker_count == 0 || self.poll_timeout.is_zero() {
            return Err(IngestorError::ConfigurationError(format!(
                "Batch size, worker count and poll timeout must be positive (got {}, {}, {:?})",
                self.batch_size, self.worker_count, self.poll_timeout
            ),),);
        }
        Ok((),)
    }
}

/// Totals reported at the end of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize,)]
pub struct RunSummary {
    pub run_id:          String,
    #[serde(rename = "totalProcessed")]
    pub total_processed: u64,
    pub inserted:        u64,
    pub failed:          u64,
    /// Job elements without any mapped field.
    pub skipped:         u64,
    pub duration_s:      f64,
}

/// Fetches `location` through `source`, inflates it if needed and ingests it.
pub async fn ingest_feed(
    config: &IngestorConfig,
    mapper: Arc<FieldMapper,>,
    source: &dyn FeedSource,
    location: &str,
    store: Arc<dyn DocumentStore,>,
) -> Result<RunSummary,> {
    let started = Instant::now();
    validate(config, &mapper,)?;

    let content = load_feed(source, location,).await?;
    run(config, mapper, content, store, started,).await
}

/// Ingests an already fetched and decompressed document.
pub async fn ingest_content(
    config: &IngestorConfig,
    mapper: Arc<FieldMapper,>,
    content: Bytes,
    store: Arc<dyn DocumentStore,>,
) -> Result<RunSummary,> {
    let started = Instant::now();
    validate(config, &mapper,)?;
    run(config, mapper, content, store, started,).await
}

fn validate(config: &IngestorConfig, mapper: &FieldMapper,) -> Result<(),> {
    config.validate()?;
    if mapper.is_empty() {
        return Err(IngestorError::ConfigurationError(
            "No valid field mapping found for client".to_string(),
        ),);
    }
    Ok((),)
}

async fn run(
    config: &IngestorConfig,
    mapper: Arc<FieldMapper,>,
    content: Bytes,
    store: Arc<dyn DocumentStore,>,
    started: Instant,
) -> Result<RunSummary,> {
    let run_id = Uuid::new_v4();
    let span = info_span!("ingest", %run_id, client_id = %config.client_id);

    async move {
        info!(
            bytes = content.len(),
            workers = config.worker_count,
            batch_size = config.batch_size,
            "Starting ingestion run"
        );

        let queue = Arc::new(RecordQueue::new(),);
        let counters = Arc::new(RunCounters::new(),);

        // Workers come up before the first record is parsed so the queue drains as it fills.
        let mut workers = JoinSet::new();
        for id in 0..config.worker_count {
            let worker = BatchPersistenceWorker::new(
                id,
                Arc::clone(&queue,),
                Arc::clone(&store,),
                Arc::clone(&counters,),
                config.batch_size,
                config.poll_timeout,
            );
            workers.spawn(worker.run().instrument(info_span!("worker", id = id),),);
        }

        let parsed = {
            let queue = Arc::clone(&queue,);
            let job_tag = config.job_tag.clone();
            let client_id: Arc<str,> = Arc::from(config.client_id.as_str(),);
            let span = Span::current();
            tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                StreamingRecordParser::new(job_tag, mapper, client_id, |record| queue.push(record,),)
                    .parse(&content,)
            },)
            .await
        };

        // Success or not, close the queue and wait for every worker so that records already
        // handed off are flushed and no lease outlives the run.
        queue.signal_done();
        while let Some(joined,) = workers.join_next().await {
            if let Err(e,) = joined {
                error!("Worker task failed: {}", e);
            }
        }

        let stats: ParseStats = match parsed {
            Ok(Ok(stats,),) => stats,
            Ok(Err(e,),) => {
                error!(
                    inserted = counters.inserted(),
                    failed = counters.failed(),
                    "Aborting run: {}",
                    e
                );
                return Err(e,);
            },
            Err(e,) => {
                return Err(IngestorError::Other(format!("Parser task failed: {}", e),),);
            },
        };

        // Records lost with a failed worker task were never stored.
        let inserted = counters.inserted();
        let mut failed = counters.failed();
        let accounted = inserted + failed;
        if accounted < stats.records {
            warn!(
                parsed = stats.records,
                accounted,
                "Counting records lost by the worker pool as failed"
            );
            failed += stats.records - accounted;
        } else if accounted > stats.records {
            warn!(
                parsed = stats.records,
                accounted, "Worker pool accounted for more records than were parsed"
            );
        }
        let total_processed = inserted + failed;

        let summary = RunSummary {
            run_id: run_id.to_string(),
            total_processed,
            inserted,
            failed,
            skipped: stats.skipped,
            duration_s: started.elapsed().as_secs_f64(),
        };
        info!(
            total = summary.total_processed,
            inserted = summary.inserted,
            failed = summary.failed,
            skipped = summary.skipped,
            "Ingestion finished in {:.3}s",
            summary.duration_s
        );
        Ok(summary,)
    }
    .instrument(span,)
    .await
}
