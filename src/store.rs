// feed_ingestor/src/store.rs
// Persistence backend seam used by the batch workers.

use async_trait::async_trait;

use crate::error::Result;
use crate::record::NormalizedRecord;

/// Backend report for a batch where some documents were rejected.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub struct PartialFailure {
    /// Documents the backend says it stored.
    pub inserted:       u64,
    /// Positions, within the submitted batch, of the rejected documents.
    pub failed_indices: Vec<usize,>,
    /// Batch size the report refers to.
    pub total:          usize,
}

/// Result of one unordered bulk insert. Anything the backend cannot describe in these terms
/// is returned as an `Err` and counted as a whole-batch failure.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub enum BulkWriteOutcome {
    Complete { inserted: u64, },
    Partial(PartialFailure,),
}

/// A shared document store, typically wrapping a connection pool.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Leases a session for one worker. The lease is held for the worker's lifetime and
    /// released on drop.
    async fn acquire(&self,) -> Result<Box<dyn StoreSession,>,>;
}

#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Submits `batch` as a single unordered bulk insert: the backend keeps going after a
    /// document is rejected.
    async fn insert_unordered(&self, batch: &[NormalizedRecord],) -> Result<BulkWriteOutcome,>;
}
