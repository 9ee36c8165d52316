// feed_ingestor/src/mapping.rs
// Source-tag to destination-field translation table.

use std::collections::HashMap;

use crate::error::{IngestorError, Result};

/// Destination field the default identifier mapping targets.
pub const JOB_ID_FIELD: &str = "job_id";

/// Immutable lookup from a feed's source tag name to the destination field name.
///
/// Built once per run and shared read-only (behind an `Arc`) by the parser and every worker.
#[derive(Debug, Clone, Default, PartialEq, Eq,)]
pub struct FieldMapper {
    fields: HashMap<String, String,>,
}

impl FieldMapper {
    /// Builds a mapper from `(source, destination)` pairs. Order is irrelevant; when a source
    /// name repeats, the last pair wins.
    pub fn from_pairs<I, S, D,>(pairs: I,) -> Result<Self,>
    where
        I: IntoIterator<Item = (S, D,),>,
        S: Into<String,>,
        D: Into<String,>,
    {
        let mut fields = HashMap::new();
        for (source, dest,) in pairs {
            let source = source.into();
            let dest = dest.into();
            if source.trim().is_empty() || dest.trim().is_empty() {
                return Err(IngestorError::ConfigurationError(format!(
                    "Field mapping entries need both a source and a destination, got '{}' -> '{}'",
                    source, dest
                ),),);
            }
            fields.insert(source, dest,);
        }
        Ok(Self { fields, },)
    }

    /// Adds `id -> job_id` unless some pair already targets `job_id` or some source name
    /// contains "id".
    pub fn with_default_job_id(mut self,) -> Self {
        let has_id = self.fields.iter().any(|(source, dest,)| {
            dest == JOB_ID_FIELD || source.to_lowercase().contains("id",)
        },);
        if !has_id {
            self.fields.insert("id".to_string(), JOB_ID_FIELD.to_string(),);
        }
        self
    }

    pub fn destination(&self, source: &str,) -> Option<&str,> {
        self.fields.get(source,).map(String::as_str,)
    }

    pub fn contains(&self, source: &str,) -> bool {
        self.fields.contains_key(source,)
    }

    pub fn len(&self,) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self,) -> bool {
        self.fields.is_empty()
    }
}
