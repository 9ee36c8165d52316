// feed_ingestor/src/lib.rs
// Public API for the feed_ingestor crate: streaming XML job feeds into a document store.

pub mod cli;
pub mod error;
pub mod feed;
pub mod ingestor;
pub mod mapping;
pub mod mongo;
pub mod parser;
pub mod queue;
pub mod record;
pub mod retry;
pub mod store;
pub mod worker;

pub const DEFAULT_JOB_TAG: &str = "job";
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 200;
pub const DEFAULT_DATABASE_NAME: &str = "job-distribution";
pub const DEFAULT_COLLECTION_NAME: &str = "jobs";
