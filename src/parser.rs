// feed_ingestor/src/parser.rs
// Single-pass job-record extraction over an XML document.
//
// `StreamingRecordParser` is a small state machine driven by element start/end and
// character-data callbacks. `parse` pulls tokens out of quick-xml one at a time and feeds
// them in, so the document tree is never materialised. Text is decoded with the encoding the
// document declares, and general entities declared in an internal DOCTYPE subset are expanded.

use std::collections::HashMap;
use std::sync::Arc;

use quick_xml::encoding::Decoder;
use quick_xml::escape::{resolve_predefined_entity, unescape_with};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::debug;

use crate::error::{IngestorError, Result};
use crate::mapping::FieldMapper;
use crate::record::{NormalizedRecord, RawRecord};

/// Counters reported once the document has been consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq,)]
pub struct ParseStats {
    /// Job elements that produced a record.
    pub records: u64,
    /// Job elements without any mapped field.
    pub skipped: u64,
}

pub struct StreamingRecordParser<F,> {
    job_tag:         String,
    mapper:          Arc<FieldMapper,>,
    client_id:       Arc<str,>,
    emit:            F,
    raw:             RawRecord,
    in_job:          bool,
    current_element: Option<String,>,
    current_text:    String,
    stats:           ParseStats,
}

impl<F,> StreamingRecordParser<F,>
where
    F: FnMut(NormalizedRecord,),
{
    /// `emit` receives each finished record by value; the parser keeps no reference to it.
    pub fn new(
        job_tag: impl Into<String,>,
        mapper: Arc<FieldMapper,>,
        client_id: Arc<str,>,
        emit: F,
    ) -> Self {
        Self {
            job_tag: job_tag.into(),
            mapper,
            client_id,
            emit,
            raw: RawRecord::default(),
            in_job: false,
            current_element: None,
            current_text: String::new(),
            stats: ParseStats::default(),
        }
    }

    pub fn start_element(&mut self, name: &str,) {
        if name == self.job_tag {
            self.in_job = true;
            self.raw.clear();
        } else if self.in_job {
            self.current_element = Some(name.to_string(),);
            self.current_text.clear();
        }
    }

    /// May be called several times per element; text accumulates.
    pub fn characters(&mut self, text: &str,) {
        if self.current_element.is_some() {
            self.current_text.push_str(text,);
        }
    }

    pub fn end_element(&mut self, name: &str,) {
        if name == self.job_tag {
            self.finish_job();
        } else if self.in_job
            && self.current_element.as_deref() == Some(name,)
            && self.mapper.contains(name,)
        {
            self.raw
                .commit(name.to_string(), std::mem::take(&mut self.current_text,),);
        }
        self.current_element = None;
    }

    fn finish_job(&mut self,) {
        match self.raw.take_normalized(&self.mapper, &self.client_id,) {
            Some(record,) => {
                self.stats.records += 1;
                (self.emit)(record,);
            },
            None => self.stats.skipped += 1,
        }
        self.in_job = false;
    }

    pub fn stats(&self,) -> ParseStats {
        self.stats
    }

    /// Consumes the whole document. Any tokenizer error, unbalanced tag or content outside the
    /// root element aborts with [`IngestorError::ParseError`]; records emitted before the error
    /// stay emitted.
    pub fn parse(mut self, content: &[u8],) -> Result<ParseStats,> {
        let mut reader = Reader::from_reader(content,);
        let mut open: Vec<String,> = Vec::new();
        let mut entities: HashMap<String, String,> = HashMap::new();
        let mut root_closed = false;

        loop {
            let event = reader.read_event().map_err(|e| {
                parse_error(content, reader.error_position() as usize, e.to_string(),)
            },)?;
            let position = reader.buffer_position() as usize;
            // Switches from the default once the XML declaration has been read.
            let decoder = reader.decoder();

            match event {
                Event::Start(start,) => {
                    let name = decode_name(decoder, start.local_name().as_ref(), content, position,)?;
                    if root_closed {
                        return Err(parse_error(content, position, "junk after document element",),);
                    }
                    self.start_element(&name,);
                    open.push(name,);
                },
                Event::Empty(start,) => {
                    let name = decode_name(decoder, start.local_name().as_ref(), content, position,)?;
                    if root_closed {
                        return Err(parse_error(content, position, "junk after document element",),);
                    }
                    self.start_element(&name,);
                    self.end_element(&name,);
                    if open.is_empty() {
                        root_closed = true;
                    }
                },
                Event::End(end,) => {
                    let name = decode_name(decoder, end.local_name().as_ref(), content, position,)?;
                    match open.pop() {
                        Some(expected,) if expected == name => {},
                        Some(expected,) => {
                            return Err(parse_error(
                                content,
                                position,
                                format!("mismatched tag: expected </{}>, found </{}>", expected, name),
                            ),);
                        },
                        None => {
                            return Err(parse_error(
                                content,
                                position,
                                format!("unexpected closing tag </{}>", name),
                            ),);
                        },
                    }
                    self.end_element(&name,);
                    if open.is_empty() {
                        root_closed = true;
                    }
                },
                Event::Text(text,) => {
                    let text = text
                        .unescape_with(|entity| resolve_entity(&entities, entity,),)
                        .map_err(|e| parse_error(content, position, e.to_string(),),)?;
                    if open.is_empty() {
                        if !text.trim().is_empty() {
                            return Err(parse_error(
                                content,
                                position,
                                "text outside of the document element",
                            ),);
                        }
                    } else {
                        self.characters(&text,);
                    }
                },
                Event::CData(cdata,) => {
                    if open.is_empty() {
                        return Err(parse_error(
                            content,
                            position,
                            "CDATA outside of the document element",
                        ),);
                    }
                    let text = decoder
                        .decode(&cdata,)
                        .map_err(|e| parse_error(content, position, e.to_string(),),)?;
                    self.characters(&text,);
                },
                Event::DocType(doctype,) => {
                    let subset = decoder
                        .decode(&doctype,)
                        .map_err(|e| parse_error(content, position, e.to_string(),),)?;
                    declare_entities(&subset, &mut entities,);
                },
                Event::Eof => break,
                // Declarations, comments and processing instructions carry no data.
                _ => {},
            }
        }

        let end = reader.buffer_position() as usize;
        if let Some(unclosed,) = open.last() {
            return Err(parse_error(
                content,
                end,
                format!("unexpected end of input: <{}> is not closed", unclosed),
            ),);
        }
        if !root_closed {
            return Err(parse_error(content, end, "no element found",),);
        }

        debug!(
            records = self.stats.records,
            skipped = self.stats.skipped,
            "Finished parsing feed"
        );
        Ok(self.stats,)
    }
}

fn decode_name(decoder: Decoder, raw: &[u8], content: &[u8], position: usize,) -> Result<String,> {
    decoder
        .decode(raw,)
        .map(|name| name.into_owned(),)
        .map_err(|e| parse_error(content, position, format!("invalid element name: {}", e),),)
}

fn resolve_entity<'a,>(entities: &'a HashMap<String, String,>, name: &str,) -> Option<&'a str,> {
    entities
        .get(name,)
        .map(String::as_str,)
        .or_else(|| resolve_predefined_entity(name,),)
}

/// Collects internal general entities (`<!ENTITY name "value">`) from a DOCTYPE. Parameter and
/// external entities are not expanded. The first declaration of a name is binding.
fn declare_entities(subset: &str, entities: &mut HashMap<String, String,>,) {
    let mut rest = subset;
    while let Some(start,) = rest.find("<!ENTITY",) {
        rest = rest[start + "<!ENTITY".len()..].trim_start();
        if rest.starts_with('%',) {
            continue;
        }

        let name_end = rest.find(|c: char| c.is_whitespace(),).unwrap_or(rest.len(),);
        let name = &rest[..name_end];
        rest = rest[name_end..].trim_start();

        let Some(quote,) = rest.chars().next().filter(|c| *c == '"' || *c == '\'',) else {
            continue;
        };
        let Some(len,) = rest[1..].find(quote,) else {
            break;
        };
        let raw = &rest[1..1 + len];
        rest = &rest[1 + len + 1..];

        if name.is_empty() || entities.contains_key(name,) {
            continue;
        }
        let value = unescape_with(raw, |entity| resolve_entity(entities, entity,),)
            .map(|value| value.into_owned(),)
            .unwrap_or_else(|_| raw.to_string(),);
        entities.insert(name.to_string(), value,);
    }
}

fn parse_error(content: &[u8], position: usize, reason: impl Into<String,>,) -> IngestorError {
    IngestorError::ParseError {
        line:   line_at(content, position,),
        reason: reason.into(),
    }
}

/// 1-based line number of byte offset `position`.
fn line_at(content: &[u8], position: usize,) -> u64 {
    let end = position.min(content.len(),);
    content[..end].iter().filter(|&&b| b == b'\n',).count() as u64 + 1
}
