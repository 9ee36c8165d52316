// feed_ingestor/src/record.rs
// Per-job record types produced by the parser.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::mapping::FieldMapper;

/// Text captured for one job element, keyed by source tag name. Sorted so that two sources
/// mapped onto the same destination resolve deterministically.
#[derive(Debug, Default,)]
pub struct RawRecord {
    fields: BTreeMap<String, String,>,
}

impl RawRecord {
    /// Stores `text` under `source`, replacing any earlier occurrence in the same job.
    pub fn commit(&mut self, source: String, text: String,) {
        self.fields.insert(source, text,);
    }

    pub fn clear(&mut self,) {
        self.fields.clear();
    }

    pub fn is_empty(&self,) -> bool {
        self.fields.is_empty()
    }

    /// Translates every captured field through `mapper` and drains `self`. Sources the mapper
    /// does not know are dropped. Returns `None` when nothing survives.
    pub fn take_normalized(
        &mut self,
        mapper: &FieldMapper,
        client_id: &Arc<str,>,
    ) -> Option<NormalizedRecord,> {
        let fields: BTreeMap<String, String,> = std::mem::take(&mut self.fields,)
            .into_iter()
            .filter_map(|(source, text,)| {
                mapper.destination(&source,).map(|dest| (dest.to_string(), text,),)
            },)
            .collect();

        if fields.is_empty() {
            return None;
        }

        Some(NormalizedRecord {
            client_id: Arc::clone(client_id,),
            fields,
        },)
    }
}

/// One destination document: the run's client identifier plus the mapped fields.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub struct NormalizedRecord {
    client_id: Arc<str,>,
    fields:    BTreeMap<String, String,>,
}

impl NormalizedRecord {
    pub fn new(client_id: Arc<str,>, fields: BTreeMap<String, String,>,) -> Self {
        Self { client_id, fields, }
    }

    pub fn client_id(&self,) -> &str {
        &self.client_id
    }

    pub fn fields(&self,) -> &BTreeMap<String, String,> {
        &self.fields
    }

    pub fn get(&self, dest: &str,) -> Option<&str,> {
        self.fields.get(dest,).map(String::as_str,)
    }
}
