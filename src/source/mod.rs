//! Dump source: decoding, CSV parsing and header tolerance.
//!
//! The dump is a `;`-separated file encoded in windows-1251. The first field
//! holds `|`-separated IPs and CIDRs, the second an optional domain. The very
//! first line of the upstream file is an `Updated: ...` banner without any
//! separator, which is why exactly one short record is allowed before data.

mod decode;
pub mod remote;

pub use decode::DecodeReader;

use encoding_rs::Encoding;
use flate2::read::GzDecoder;
use std::io::{BufRead, BufReader, Read};

use crate::{Error, Result};

/// Default text encoding of the upstream dump.
pub static DEFAULT_ENCODING: &Encoding = &encoding_rs::WINDOWS_1251_INIT;

/// One row of the dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    ips: String,
    domain: Option<String>,
}

impl Record {
    pub fn new(ips: impl Into<String>, domain: Option<String>) -> Self {
        let domain = domain.filter(|d| !d.is_empty());
        Self {
            ips: ips.into(),
            domain,
        }
    }

    /// Build a record from CSV fields. Returns `None` for short rows.
    pub fn from_fields(record: &csv::StringRecord) -> Option<Self> {
        if record.len() < 2 {
            return None;
        }
        Some(Self::new(&record[0], Some(record[1].trim().to_string())))
    }

    /// Raw `|`-separated IP field.
    pub fn ips(&self) -> &str {
        &self.ips
    }

    /// Non-empty domain token, possibly `*.`-prefixed.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }
}

/// Wrap raw dump bytes: transparently gunzip, then transcode to UTF-8.
pub fn open_dump<R: Read + 'static>(
    input: R,
    encoding: &'static Encoding,
) -> Result<DecodeReader<Box<dyn Read>>> {
    let mut buffered = BufReader::new(input);
    let head = buffered.fill_buf()?;
    let inner: Box<dyn Read> = if is_gzip(head) {
        log::debug!("Dump is gzip compressed");
        Box::new(GzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    };
    Ok(DecodeReader::new(inner, encoding))
}

fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Iterator over the records of a decoded dump.
///
/// A short row (fewer than 2 fields) is a header only when it is the first
/// short row and no valid record has been seen yet; every other short row is
/// a fatal [`Error::MalformedDump`]. Blank lines never reach this check.
/// Quotes carry no meaning, so every physical line is one row.
pub struct DumpReader<R: Read> {
    reader: csv::Reader<R>,
    record: csv::StringRecord,
    header_skipped: bool,
    records_read: u64,
}

impl<R: Read> DumpReader<R> {
    pub fn new(input: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .quoting(false)
            .has_headers(false)
            .flexible(true)
            .from_reader(input);
        Self {
            reader,
            record: csv::StringRecord::new(),
            header_skipped: false,
            records_read: 0,
        }
    }

    /// Number of valid records yielded so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if !self.reader.read_record(&mut self.record)? {
                return Ok(None);
            }

            match Record::from_fields(&self.record) {
                Some(record) => {
                    self.records_read += 1;
                    return Ok(Some(record));
                }
                None if !self.header_skipped && self.records_read == 0 => {
                    self.header_skipped = true;
                    log::debug!("Skipping dump header: {:?}", self.record.get(0));
                }
                None => {
                    let line = self.record.position().map(|p| p.line()).unwrap_or(0);
                    return Err(Error::MalformedDump { line });
                }
            }
        }
    }
}

impl<R: Read> Iterator for DumpReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
