// feed_ingestor/src/worker.rs
// Batch persistence workers and the shared run counters.

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::error::{IngestorError, Result};
use crate::queue::{Pop, RecordQueue};
use crate::record::NormalizedRecord;
use crate::store::{BulkWriteOutcome, DocumentStore, StoreSession};

/// Insert/failure totals shared by every worker of a run.
#[derive(Debug, Default,)]
pub struct RunCounters {
    inserted: AtomicU64,
    failed:   AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tally: FlushTally,) {
        self.inserted.fetch_add(tally.inserted, Ordering::Relaxed,);
        self.failed.fetch_add(tally.failed, Ordering::Relaxed,);
    }

    pub fn inserted(&self,) -> u64 {
        self.inserted.load(Ordering::Relaxed,)
    }

    pub fn failed(&self,) -> u64 {
        self.failed.load(Ordering::Relaxed,)
    }
}

/// Accounting for one flush. `inserted + failed` always equals the batch length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq,)]
pub struct FlushTally {
    pub inserted: u64,
    pub failed:   u64,
}

impl FlushTally {
    fn all_failed(batch_len: u64,) -> Self {
        Self { inserted: 0, failed: batch_len, }
    }
}

/// Turns a bulk insert result into counts for a batch of `batch_len` documents.
///
/// Backend counts are trusted when they are consistent with the batch; whatever they leave
/// unaccounted for is counted as failed. A report that claims more than the batch holds, and
/// any error, fails the whole batch.
pub fn reconcile(batch_len: usize, result: &Result<BulkWriteOutcome,>,) -> FlushTally {
    let len = batch_len as u64;
    match result {
        Ok(BulkWriteOutcome::Complete { inserted, },) => {
            let inserted = (*inserted).min(len,);
            FlushTally { inserted, failed: len - inserted, }
        },
        Ok(BulkWriteOutcome::Partial(report,),) => {
            if report.total != batch_len || report.failed_indices.iter().any(|&i| i >= batch_len,) {
                return FlushTally::all_failed(len,);
            }
            let failed: BTreeSet<usize,> = report.failed_indices.iter().copied().collect();
            if report.inserted + failed.len() as u64 > len {
                return FlushTally::all_failed(len,);
            }
            FlushTally {
                inserted: report.inserted,
                failed:   len - report.inserted,
            }
        },
        Err(_,) => FlushTally::all_failed(len,),
    }
}

/// One member of the persistence pool. Pulls records off the shared queue, groups them into
/// batches of `batch_size` and flushes each batch with an unordered bulk insert.
pub struct BatchPersistenceWorker {
    id:           usize,
    queue:        Arc<RecordQueue,>,
    store:        Arc<dyn DocumentStore,>,
    counters:     Arc<RunCounters,>,
    batch_size:   usize,
    poll_timeout: Duration,
}

impl BatchPersistenceWorker {
    pub fn new(
        id: usize,
        queue: Arc<RecordQueue,>,
        store: Arc<dyn DocumentStore,>,
        counters: Arc<RunCounters,>,
        batch_size: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            counters,
            batch_size: batch_size.max(1,),
            poll_timeout,
        }
    }

    /// Runs until the queue is closed and drained. Backend failures only move counters.
    pub async fn run(self,) {
        let session = match self.store.acquire().await {
            Ok(session,) => Some(session,),
            Err(e,) => {
                // Keep draining so the records this worker takes are still accounted for.
                error!(worker = self.id, "Failed to acquire a store session: {}", e);
                None
            },
        };

        let mut batch: Vec<NormalizedRecord,> = Vec::with_capacity(self.batch_size,);
        loop {
            match self.queue.try_pop(self.poll_timeout,).await {
                Pop::Record(record,) => {
                    batch.push(record,);
                    if batch.len() >= self.batch_size {
                        self.flush(session.as_deref(), &mut batch,).await;
                    }
                },
                Pop::Empty => trace!(worker = self.id, "Queue idle"),
                Pop::Exhausted => break,
            }
        }

        self.flush(session.as_deref(), &mut batch,).await;
        debug!(worker = self.id, "Worker finished");
    }

    async fn flush(&self, session: Option<&dyn StoreSession,>, batch: &mut Vec<NormalizedRecord,>,) {
        if batch.is_empty() {
            return;
        }

        let result = match session {
            // A panic in the backend fails only this batch.
            Some(session,) => AssertUnwindSafe(session.insert_unordered(batch,),)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(IngestorError::DatabaseError(format!(
                        "Bulk insert panicked: {}",
                        panic_message(panic.as_ref(),)
                    ),),)
                },),
            None => Err(IngestorError::ConnectionError(
                "no store session available".to_string(),
            ),),
        };
        let tally = reconcile(batch.len(), &result,);

        match &result {
            Ok(BulkWriteOutcome::Complete { .. },) if tally.failed == 0 => {
                debug!(worker = self.id, inserted = tally.inserted, "Flushed batch");
            },
            Ok(_,) => {
                warn!(
                    worker = self.id,
                    inserted = tally.inserted,
                    failed = tally.failed,
                    "Batch partially rejected by the store"
                );
            },
            Err(e,) => {
                error!(
                    worker = self.id,
                    failed = tally.failed,
                    "Bulk insert failed, counting the whole batch as failed: {}",
                    e
                );
            },
        }

        self.counters.record(tally,);
        batch.clear();
    }
}

fn panic_message(panic: &(dyn Any + Send),) -> &str {
    panic
        .downcast_ref::<&str,>()
        .copied()
        .or_else(|| panic.downcast_ref::<String,>().map(String::as_str,),)
        .unwrap_or("unknown panic",)
}
