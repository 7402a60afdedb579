//! Feed decoding, streaming record parsing, and field mapping.
//!
//! Everything here is synchronous and works on `BufRead`; the pipeline runs
//! it on a blocking thread fed by the network stream.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;

use flate2::bufread::MultiGzDecoder;
use jobfeed_core::{
    CanonicalRecord, Compression, RawRecord, ResolvedMapping, GENERIC_ID_CANDIDATE,
    RESERVED_FIELD_MARKER,
};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jobfeed-adapters";

pub const DEFAULT_MAX_RECORD_BYTES: usize = 1 << 20;

const READ_BUFFER_BYTES: usize = 64 * 1024;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("feed body is not gzip data")]
    NotGzip,
    #[error("corrupt compressed stream: {0}")]
    Corrupt(String),
    #[error("reading feed body: {0}")]
    Read(#[source] io::Error),
}

pub type DecodedStream = Box<dyn BufRead + Send>;

/// Wraps a raw feed body with the decompression the feed calls for.
pub fn decode_stream<R>(reader: R, compression: Compression) -> Result<DecodedStream, DecodeError>
where
    R: Read + Send + 'static,
{
    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, reader);
    let gzipped = match compression {
        Compression::None => false,
        Compression::Auto => starts_with_gzip_magic(&mut reader)?,
        Compression::Gzip => {
            if !starts_with_gzip_magic(&mut reader)? {
                return Err(DecodeError::NotGzip);
            }
            true
        }
    };

    if gzipped {
        Ok(Box::new(BufReader::with_capacity(
            READ_BUFFER_BYTES,
            MultiGzDecoder::new(reader),
        )))
    } else {
        Ok(Box::new(reader))
    }
}

fn starts_with_gzip_magic(reader: &mut impl BufRead) -> Result<bool, DecodeError> {
    let head = reader.fill_buf().map_err(DecodeError::Read)?;
    Ok(match head {
        [a, b, ..] => [*a, *b] == GZIP_MAGIC,
        [a] => *a == GZIP_MAGIC[0],
        [] => false,
    })
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed markup near byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("reading decoded stream: {0}")]
    Io(Arc<io::Error>),
}

impl ParseError {
    fn from_xml(err: quick_xml::Error, position: u64) -> Self {
        match err {
            quick_xml::Error::Io(io) => ParseError::Io(io),
            other => ParseError::Malformed {
                position,
                message: other.to_string(),
            },
        }
    }

    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            ParseError::Io(err) => Some(err),
            ParseError::Malformed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Record elements emitted.
    pub records: u64,
    /// Record elements abandoned for exceeding the size ceiling.
    pub oversized: u64,
}

/// Pull parser that yields one [`RawRecord`] per record element.
///
/// Child elements become fields named by their path below the record
/// (`location.city`); attributes of the record element become `$name`
/// metadata fields. Only one record is held at a time.
pub struct RecordParser<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    record_tag: Vec<u8>,
    max_record_bytes: usize,
    stats: ParserStats,
    done: bool,
}

impl<R: BufRead> RecordParser<R> {
    pub fn new(source: R, record_tag: &str) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            record_tag: record_tag.as_bytes().to_vec(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            stats: ParserStats::default(),
            done: false,
        }
    }

    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes.max(1);
        self
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Capacity of the event scratch buffer; tracks the largest single event,
    /// not the document.
    pub fn scratch_capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn next_record(&mut self) -> Result<Option<RawRecord>, ParseError> {
        if self.done {
            return Ok(None);
        }
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(err) => {
                    self.done = true;
                    return Err(ParseError::from_xml(err, self.reader.buffer_position() as u64));
                }
            };

            let opened = match event {
                Event::Start(ref e) if is_record_tag(&self.record_tag, e) => {
                    Some((record_attributes(e, self.reader.buffer_position() as u64)?, false))
                }
                Event::Empty(ref e) if is_record_tag(&self.record_tag, e) => {
                    Some((record_attributes(e, self.reader.buffer_position() as u64)?, true))
                }
                Event::Eof => {
                    self.done = true;
                    return Ok(None);
                }
                _ => None,
            };

            match opened {
                Some((record, true)) => {
                    self.stats.records += 1;
                    return Ok(Some(record));
                }
                Some((record, false)) => {
                    if let Some(record) = self.read_record_body(record)? {
                        self.stats.records += 1;
                        return Ok(Some(record));
                    }
                }
                None => {}
            }
        }
    }

    /// Consumes events up to the record's end tag. Returns `None` when the
    /// record outgrew the size ceiling.
    fn read_record_body(&mut self, mut record: RawRecord) -> Result<Option<RawRecord>, ParseError> {
        // (element name, saw child elements)
        let mut path: Vec<(String, bool)> = Vec::new();
        let mut text = String::new();
        let mut size: usize = record.iter().map(|(k, v)| k.len() + v.len()).sum();
        let mut oversized = false;

        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(err) => {
                    self.done = true;
                    return Err(ParseError::from_xml(err, self.reader.buffer_position() as u64));
                }
            };

            match event {
                Event::Start(e) => {
                    if let Some(parent) = path.last_mut() {
                        parent.1 = true;
                    }
                    path.push((element_name(&e), false));
                    text.clear();
                }
                Event::Empty(e) => {
                    if let Some(parent) = path.last_mut() {
                        parent.1 = true;
                    }
                    if !oversized {
                        let field = field_path(&path, Some(&element_name(&e)));
                        size += field.len();
                        record.insert(field, String::new());
                    }
                }
                Event::Text(t) => {
                    if !path.is_empty() && !oversized {
                        let value = t
                            .unescape()
                            .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned().into());
                        size += value.len();
                        text.push_str(&value);
                    }
                }
                Event::CData(c) => {
                    if !path.is_empty() && !oversized {
                        let value = String::from_utf8_lossy(&c);
                        size += value.len();
                        text.push_str(&value);
                    }
                }
                Event::End(_) => {
                    let Some((_, had_children)) = path.last() else {
                        break;
                    };
                    if !had_children && !oversized {
                        let field = field_path(&path, None);
                        size += field.len();
                        record.insert(field, text.trim());
                    }
                    path.pop();
                    text.clear();
                }
                Event::Eof => {
                    self.done = true;
                    return Err(ParseError::Malformed {
                        position: self.reader.buffer_position() as u64,
                        message: "document ended inside a record element".to_string(),
                    });
                }
                _ => {}
            }

            if !oversized && size > self.max_record_bytes {
                oversized = true;
                text = String::new();
                warn!(
                    limit = self.max_record_bytes,
                    position = self.reader.buffer_position() as u64,
                    "record exceeds size ceiling; skipping it"
                );
            }
        }

        if oversized {
            self.stats.oversized += 1;
            return Ok(None);
        }
        Ok(Some(record))
    }
}

impl<R: BufRead> Iterator for RecordParser<R> {
    type Item = Result<RawRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn is_record_tag(tag: &[u8], e: &BytesStart<'_>) -> bool {
    e.name().as_ref() == tag || e.local_name().as_ref() == tag
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn field_path(path: &[(String, bool)], leaf: Option<&str>) -> String {
    let mut out = String::new();
    for name in path.iter().map(|(n, _)| n.as_str()).chain(leaf) {
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(name);
    }
    out
}

fn record_attributes(e: &BytesStart<'_>, position: u64) -> Result<RawRecord, ParseError> {
    let mut record = RawRecord::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ParseError::Malformed {
            position,
            message: err.to_string(),
        })?;
        let value: Cow<'_, str> = match attr.unescape_value() {
            Ok(value) => value,
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned().into(),
        };
        record.insert(
            format!("{RESERVED_FIELD_MARKER}{}", String::from_utf8_lossy(attr.key.as_ref())),
            value.into_owned(),
        );
    }
    Ok(record)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("record has none of the {tried} job id candidate fields")]
    MissingJobId { tried: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRecord {
    pub record: CanonicalRecord,
    /// Source field the job id was taken from.
    pub job_id_source: String,
}

impl MappedRecord {
    pub fn used_generic_id(&self) -> bool {
        self.job_id_source == GENERIC_ID_CANDIDATE
    }
}

/// Translates raw records of one feed into canonical records.
#[derive(Debug, Clone)]
pub struct RecordMapper {
    feed_id: String,
    mapping: ResolvedMapping,
}

impl RecordMapper {
    pub fn new(feed_id: impl Into<String>, mapping: ResolvedMapping) -> Self {
        Self {
            feed_id: feed_id.into(),
            mapping,
        }
    }

    pub fn map(&self, raw: &RawRecord) -> Result<MappedRecord, MappingError> {
        let (job_id, job_id_source) = self.derive_job_id(raw)?;

        let mut fields = BTreeMap::new();
        for rule in &self.mapping.rules {
            if let Some(value) = raw.data_field(&rule.source_field) {
                fields.insert(rule.canonical_field.clone(), value.to_string());
            }
        }

        Ok(MappedRecord {
            record: CanonicalRecord {
                feed_id: self.feed_id.clone(),
                job_id,
                fields,
            },
            job_id_source: job_id_source.to_string(),
        })
    }

    /// First present, non-blank candidate value, in priority order.
    pub fn derive_job_id<'m>(&'m self, raw: &RawRecord) -> Result<(String, &'m str), MappingError> {
        let candidates = self.mapping.job_id.candidates();
        candidates
            .iter()
            .find_map(|name| {
                raw.data_field(name)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(|v| (v.to_string(), name.as_str()))
            })
            .ok_or(MappingError::MissingJobId {
                tried: candidates.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression as GzLevel;
    use jobfeed_core::{JobIdRule, MappingRule, MappingSource};
    use std::io::{Cursor, Write};

    fn parse_all(xml: &str, tag: &str) -> Vec<RawRecord> {
        RecordParser::new(Cursor::new(xml.as_bytes().to_vec()), tag)
            .collect::<Result<Vec<_>, _>>()
            .expect("parse")
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), GzLevel::default());
        enc.write_all(bytes).unwrap();
        enc.finish().unwrap()
    }

    fn mapping(pairs: &[(&str, &str)], explicit: Option<&str>) -> ResolvedMapping {
        ResolvedMapping {
            source: MappingSource::Feed,
            rules: pairs.iter().map(|(s, c)| MappingRule::new(*s, *c)).collect(),
            job_id: JobIdRule::with_explicit(explicit.map(String::from)),
        }
    }

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        let mut r = RawRecord::new();
        for (k, v) in pairs {
            r.insert(*k, *v);
        }
        r
    }

    #[test]
    fn finds_records_at_any_depth_and_skips_other_elements() {
        let xml = r#"<?xml version="1.0"?>
            <source>
              <publisher>Acme</publisher>
              <job><id>1</id><title>Welder</title></job>
              <section><jobs>
                <job id="attr-2"><id>2</id><title><![CDATA[Painter & Co]]></title></job>
              </jobs></section>
              <footer>done</footer>
            </source>"#;
        let records = parse_all(xml, "job");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("title"), Some("Welder"));
        assert_eq!(records[1].get("title"), Some("Painter & Co"));
        assert_eq!(records[1].get("$id"), Some("attr-2"));
        assert_eq!(records[1].get("id"), Some("2"));
    }

    #[test]
    fn nested_fields_flatten_with_dotted_paths() {
        let xml = "<jobs><job><id>7</id><location><city>Austin</city><state>TX</state></location>\
                   <salary/><desc>Fish &amp; chips</desc></job></jobs>";
        let records = parse_all(xml, "job");
        let r = &records[0];
        assert_eq!(r.get("location.city"), Some("Austin"));
        assert_eq!(r.get("location.state"), Some("TX"));
        assert_eq!(r.get("location"), None);
        assert_eq!(r.get("salary"), Some(""));
        assert_eq!(r.get("desc"), Some("Fish & chips"));
    }

    #[test]
    fn custom_record_tag() {
        let xml = "<feed><listing><ref>a</ref></listing><job><ref>b</ref></job></feed>";
        let records = parse_all(xml, "listing");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("ref"), Some("a"));
    }

    #[test]
    fn malformed_markup_is_a_parse_error() {
        let xml = "<jobs><job><id>1</id></job><job><id>2</title></job></jobs>";
        let mut parser = RecordParser::new(Cursor::new(xml.as_bytes().to_vec()), "job");
        assert!(parser.next().expect("first").is_ok());
        let err = parser.next().expect("second").unwrap_err();
        assert!(matches!(err, ParseError::Malformed { .. }));
        assert!(parser.next().is_none());
    }

    #[test]
    fn truncated_document_inside_record_is_a_parse_error() {
        let xml = "<jobs><job><id>1</id>";
        let result: Result<Vec<_>, _> =
            RecordParser::new(Cursor::new(xml.as_bytes().to_vec()), "job").collect();
        assert!(result.is_err());
    }

    #[test]
    fn oversized_records_are_skipped_and_counted() {
        let big = "x".repeat(4096);
        let xml = format!("<jobs><job><id>1</id></job><job><id>2</id><d>{big}</d></job><job><id>3</id></job></jobs>");
        let mut parser =
            RecordParser::new(Cursor::new(xml.into_bytes()), "job").with_max_record_bytes(1024);
        let ids: Vec<String> = parser
            .by_ref()
            .map(|r| r.expect("record").get("id").unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(parser.stats().oversized, 1);
        assert_eq!(parser.stats().records, 2);
    }

    /// Generates a feed on the fly so the document never exists in memory.
    struct SyntheticFeed {
        total: usize,
        emitted: usize,
        opened: bool,
        closed: bool,
        pending: Vec<u8>,
        pos: usize,
    }

    impl SyntheticFeed {
        fn new(total: usize) -> Self {
            Self {
                total,
                emitted: 0,
                opened: false,
                closed: false,
                pending: Vec::new(),
                pos: 0,
            }
        }

        fn refill(&mut self) -> bool {
            self.pending.clear();
            self.pos = 0;
            if !self.opened {
                self.opened = true;
                self.pending.extend_from_slice(b"<?xml version=\"1.0\"?><source><jobs>");
            } else if self.emitted < self.total {
                let n = self.emitted;
                write!(
                    self.pending,
                    "<job><id>{n}</id><title>Title {n}</title><description>{}</description></job>",
                    "lorem ipsum ".repeat(20)
                )
                .unwrap();
                self.emitted += 1;
            } else if !self.closed {
                self.closed = true;
                self.pending.extend_from_slice(b"</jobs></source>");
            } else {
                return false;
            }
            true
        }
    }

    impl Read for SyntheticFeed {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.pending.len() && !self.refill() {
                return Ok(0);
            }
            let n = out.len().min(self.pending.len() - self.pos);
            out[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn parser_memory_is_bounded_by_record_not_document() {
        let total = 50_000;
        let decoded = decode_stream(SyntheticFeed::new(total), Compression::None).expect("decode");
        let mut parser = RecordParser::new(decoded, "job");
        let mut count = 0;
        let mut peak = 0;
        while let Some(record) = parser.next_record().expect("record") {
            assert!(record.get("id").is_some());
            count += 1;
            peak = peak.max(parser.scratch_capacity());
        }
        // ~16 MB of markup went through; the scratch buffer stays at event size.
        assert_eq!(count, total);
        assert!(peak < 16 * 1024, "scratch buffer grew to {peak}");
    }

    #[test]
    fn gzip_feed_decodes_and_parses() {
        let xml = b"<jobs><job><id>1</id></job><job><id>2</id></job></jobs>";
        let decoded = decode_stream(Cursor::new(gzip(xml)), Compression::Gzip).expect("decode");
        let records: Vec<_> = RecordParser::new(decoded, "job")
            .collect::<Result<_, _>>()
            .expect("parse");
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn plain_body_is_rejected_when_gzip_expected_but_accepted_in_auto_mode() {
        let xml = b"<jobs><job><id>1</id></job></jobs>".to_vec();
        assert!(matches!(
            decode_stream(Cursor::new(xml.clone()), Compression::Gzip),
            Err(DecodeError::NotGzip)
        ));
        let decoded = decode_stream(Cursor::new(xml), Compression::Auto).expect("decode");
        assert_eq!(RecordParser::new(decoded, "job").count(), 1);

        let gz = gzip(b"<jobs><job><id>1</id></job></jobs>");
        let decoded = decode_stream(Cursor::new(gz), Compression::Auto).expect("decode");
        assert_eq!(RecordParser::new(decoded, "job").count(), 1);
    }

    #[test]
    fn corrupt_gzip_surfaces_as_an_error_not_a_panic() {
        let mut body = gzip(&b"<jobs><job><id>1</id><title>Welder</title></job></jobs>".repeat(200));
        body.truncate(body.len() / 2);
        let decoded = decode_stream(Cursor::new(body), Compression::Gzip).expect("header ok");
        let result: Result<Vec<_>, _> = RecordParser::new(decoded, "job").collect();
        assert!(result.is_err());
    }

    #[test]
    fn maps_present_fields_only_and_ignores_reserved_sources() {
        let mapper = RecordMapper::new(
            "c1",
            mapping(&[("title", "title"), ("city", "location"), ("$id", "meta")], None),
        );
        let mapped = mapper
            .map(&raw(&[("id", "9"), ("title", "Welder"), ("$id", "x"), ("extra", "y")]))
            .expect("mapped");
        assert_eq!(mapped.record.feed_id, "c1");
        assert_eq!(mapped.record.job_id, "9");
        assert_eq!(
            mapped.record.fields,
            BTreeMap::from([("title".to_string(), "Welder".to_string())])
        );
        assert!(mapped.used_generic_id());
    }

    #[test]
    fn explicit_job_id_beats_generic_id() {
        let mapper = RecordMapper::new("c1", mapping(&[("title", "title")], None));
        let mapped = mapper
            .map(&raw(&[("id", "generic"), ("job_id", "explicit")]))
            .expect("mapped");
        assert_eq!(mapped.record.job_id, "explicit");
        assert!(!mapped.used_generic_id());

        let mapper = RecordMapper::new("c1", mapping(&[("title", "title")], Some("ref")));
        let mapped = mapper
            .map(&raw(&[("ref", "R-1"), ("job_id", "explicit")]))
            .expect("mapped");
        assert_eq!(mapped.record.job_id, "R-1");
        assert_eq!(mapped.job_id_source, "ref");
    }

    #[test]
    fn blank_candidates_fall_through_and_missing_id_is_an_error() {
        let mapper = RecordMapper::new("c1", mapping(&[("title", "title")], None));
        let mapped = mapper
            .map(&raw(&[("job_id", "  "), ("url", "https://jobs.example.com/1")]))
            .expect("mapped");
        assert_eq!(mapped.record.job_id, "https://jobs.example.com/1");

        let err = mapper.map(&raw(&[("title", "Welder")])).unwrap_err();
        assert!(matches!(err, MappingError::MissingJobId { .. }));
    }
}
