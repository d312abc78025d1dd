//! sing-geosite database format.
//!
//! ```text
//! u8        version (0)
//! uvarint   code count
//! repeated  vstring code, uvarint byte offset into items, uvarint item count
//! repeated  u8 item type, vstring value
//! ```
//!
//! Codes are written in sorted order; offsets are relative to the start of the
//! item section.

mod reader;
mod writer;

pub use reader::GeositeReader;
pub use writer::GeositeWriter;

use std::io::{Read, Write};

use crate::{Error, Result};

/// Only known sing-geosite version.
pub const GEOSITE_VERSION: u8 = 0;

/// Maximum accepted string length when reading (10 MB).
const MAX_VSTRING_LENGTH: usize = 10 * 1024 * 1024;

pub(crate) fn write_uvarint<W: Write + ?Sized>(writer: &mut W, mut value: u64) -> std::io::Result<()> {
    let mut buf = [0u8; 10];
    let mut len = 0;
    while value >= 0x80 {
        buf[len] = (value as u8) | 0x80;
        value >>= 7;
        len += 1;
    }
    buf[len] = value as u8;
    writer.write_all(&buf[..=len])
}

pub(crate) fn write_vstring<W: Write + ?Sized>(writer: &mut W, value: &str) -> std::io::Result<()> {
    write_uvarint(writer, value.len() as u64)?;
    writer.write_all(value.as_bytes())
}

pub(crate) fn read_byte<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader
        .read_exact(&mut buf)
        .map_err(|e| Error::GeoSite(format!("failed to read byte: {}", e)))?;
    Ok(buf[0])
}

pub(crate) fn read_uvarint<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = read_byte(reader)?;
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::GeoSite("varint overflow".to_string()));
        }
    }
}

pub(crate) fn read_vstring<R: Read>(reader: &mut R) -> Result<String> {
    let length = read_uvarint(reader)? as usize;
    if length > MAX_VSTRING_LENGTH {
        return Err(Error::GeoSite(format!(
            "string length {} exceeds limit of {} bytes",
            length, MAX_VSTRING_LENGTH
        )));
    }
    let mut buf = vec![0u8; length];
    reader
        .read_exact(&mut buf)
        .map_err(|e| Error::GeoSite(format!("failed to read string: {}", e)))?;
    String::from_utf8(buf).map_err(|e| Error::GeoSite(format!("invalid UTF-8 string: {}", e)))
}
