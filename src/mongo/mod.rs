// feed_ingestor/src/mongo/mod.rs
// MongoDB document store.

use std::collections::BTreeSet;

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::{BulkWriteError, ErrorKind};
use mongodb::options::{ClientOptions, IndexOptions, InsertManyOptions};
use mongodb::results::InsertManyResult;
use mongodb::{Client, Collection, IndexModel};
use tracing::{info, warn};

use crate::error::{IngestorError, Result};
use crate::record::NormalizedRecord;
use crate::retry::{execute_with_retry, wrap_error};
use crate::store::{BulkWriteOutcome, DocumentStore, PartialFailure, StoreSession};

/// Field holding the client identifier on every stored job.
pub const FEED_ID_FIELD: &str = "feed_id";
/// Sub-document holding the mapped feed fields.
pub const MAPPED_FIELDS_FIELD: &str = "mapped_fields";

/// Job collection backed by the driver's connection pool. Each worker leases a handle to the
/// collection; connections are checked out of the pool per bulk insert.
pub struct MongoStore {
    client:          Client,
    database_name:   String,
    collection_name: String,
}

impl MongoStore {
    pub async fn connect(uri: &str, database_name: &str, collection_name: &str,) -> Result<Self,> {
        let client_options = ClientOptions::parse(uri,).await.map_err(|e| {
            IngestorError::ConfigurationError(format!("Failed to parse MongoDB URI: {}", e),)
        },)?;
        let client = Client::with_options(client_options,).map_err(|e| {
            IngestorError::ConnectionError(format!("Failed to create MongoDB client: {}", e),)
        },)?;

        execute_with_retry(|| async {
            client
                .database("admin",)
                .run_command(doc! {"ping": 1}, None,)
                .await
                .map(|_| (),)
                .map_err(|e| {
                    wrap_error(IngestorError::ConnectionError(format!(
                        "Failed to connect to MongoDB: {}",
                        e
                    ),),)
                },)
        },)
        .await?;

        info!(
            "Connected to MongoDB, writing to '{}.{}'",
            database_name, collection_name
        );
        Ok(MongoStore {
            client,
            database_name: database_name.to_string(),
            collection_name: collection_name.to_string(),
        },)
    }

    fn collection(&self,) -> Collection<Document,> {
        self.client
            .database(&self.database_name,)
            .collection(&self.collection_name,)
    }

    /// Creates the unique `(feed_id, mapped_fields.job_id)` index jobs are keyed by.
    pub async fn ensure_indexes(&self,) -> Result<(),> {
        let keys = doc! {
            FEED_ID_FIELD: 1,
            format!("{}.{}", MAPPED_FIELDS_FIELD, crate::mapping::JOB_ID_FIELD): 1,
        };
        let index = IndexModel::builder()
            .keys(keys,)
            .options(IndexOptions::builder().unique(true,).build(),)
            .build();

        self.collection()
            .create_index(index, None,)
            .await
            .map_err(|e| IngestorError::DatabaseError(format!("Failed to create index: {}", e),),)?;
        Ok((),)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn acquire(&self,) -> Result<Box<dyn StoreSession,>,> {
        Ok(Box::new(MongoSession { collection: self.collection(), },),)
    }
}

struct MongoSession {
    collection: Collection<Document,>,
}

#[async_trait]
impl StoreSession for MongoSession {
    async fn insert_unordered(&self, batch: &[NormalizedRecord],) -> Result<BulkWriteOutcome,> {
        let documents: Vec<Document,> = batch.iter().map(to_document,).collect();
        let options = InsertManyOptions::builder().ordered(false,).build();
        let result = self.collection.insert_many(documents, options,).await;
        bulk_outcome(batch.len(), result,)
    }
}

/// `{ feed_id, mapped_fields: { .. } }`. The client id is stored as an ObjectId when it is one.
pub fn to_document(record: &NormalizedRecord,) -> Document {
    let feed_id = match ObjectId::parse_str(record.client_id(),) {
        Ok(oid,) => Bson::ObjectId(oid,),
        Err(_,) => Bson::String(record.client_id().to_string(),),
    };

    let mut mapped = Document::new();
    for (field, value,) in record.fields() {
        mapped.insert(field.clone(), value.clone(),);
    }

    doc! {
        FEED_ID_FIELD: feed_id,
        MAPPED_FIELDS_FIELD: mapped,
    }
}

fn bulk_outcome(
    total: usize,
    result: mongodb::error::Result<InsertManyResult,>,
) -> Result<BulkWriteOutcome,> {
    let err = match result {
        Ok(inserted,) => {
            return Ok(BulkWriteOutcome::Complete {
                inserted: inserted.inserted_ids.len() as u64,
            },);
        },
        Err(err,) => err,
    };

    // Only per-document write errors give a trustworthy picture of the batch. A write concern
    // error leaves the stored state unknown.
    if let ErrorKind::BulkWrite(failure,) = err.kind.as_ref() {
        if let (Some(write_errors,), None,) = (&failure.write_errors, &failure.write_concern_error,) {
            if let Some(first,) = write_errors.first() {
                warn!(
                    rejected = write_errors.len(),
                    code = first.code,
                    "Bulk insert rejected documents, first error: {}",
                    first.message
                );
                return Ok(BulkWriteOutcome::Partial(partial_failure(total, write_errors,),),);
            }
        }
    }

    Err(IngestorError::DatabaseError(format!("Bulk insert failed: {}", err),),)
}

/// Every document of an unordered insert without a write error was stored.
fn partial_failure(total: usize, write_errors: &[BulkWriteError],) -> PartialFailure {
    let failed_indices: Vec<usize,> = write_errors.iter().map(|e| e.index,).collect();
    let distinct = failed_indices.iter().collect::<BTreeSet<_,>>().len();
    PartialFailure {
        inserted: total.saturating_sub(distinct,) as u64,
        failed_indices,
        total,
    }
}
