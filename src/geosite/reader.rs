//! sing-geosite database reader.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

use super::{read_byte, read_uvarint, read_vstring, GEOSITE_VERSION};
use crate::classify::RuleItem;
use crate::{Error, Result};

/// In-memory reader over a sing-geosite database.
pub struct GeositeReader {
    data: Cursor<Vec<u8>>,
    items_start: u64,
    codes: Vec<String>,
    index: HashMap<String, (u64, usize)>,
}

impl GeositeReader {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let mut data = Cursor::new(data);

        let version = read_byte(&mut data)?;
        if version != GEOSITE_VERSION {
            return Err(Error::GeoSite(format!("unknown geosite version: {}", version)));
        }

        let count = read_uvarint(&mut data)? as usize;
        let mut codes = Vec::with_capacity(count);
        let mut index = HashMap::with_capacity(count);
        for _ in 0..count {
            let code = read_vstring(&mut data)?;
            let offset = read_uvarint(&mut data)?;
            let length = read_uvarint(&mut data)? as usize;
            index.insert(code.clone(), (offset, length));
            codes.push(code);
        }

        let items_start = data.position();
        Ok(Self {
            data,
            items_start,
            codes,
            index,
        })
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Codes in file order.
    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    /// Read all items stored under `code`.
    pub fn read(&mut self, code: &str) -> Result<Vec<RuleItem>> {
        let (offset, length) = *self
            .index
            .get(code)
            .ok_or_else(|| Error::GeoSite(format!("code not found: {}", code)))?;

        self.data
            .seek(SeekFrom::Start(self.items_start + offset))
            .map_err(|e| Error::GeoSite(format!("failed to seek: {}", e)))?;

        let mut items = Vec::with_capacity(length);
        for _ in 0..length {
            items.push(read_item(&mut self.data)?);
        }
        Ok(items)
    }
}

fn read_item<R: Read>(reader: &mut R) -> Result<RuleItem> {
    let kind = read_byte(reader)?;
    let value = read_vstring(reader)?;
    RuleItem::from_type_byte(kind, value)
        .ok_or_else(|| Error::GeoSite(format!("unknown item type: {}", kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geosite::GeositeWriter;

    fn build(entries: &[(&str, RuleItem)]) -> Vec<u8> {
        let mut writer = GeositeWriter::new();
        for (code, item) in entries {
            writer.push(code, item.clone());
        }
        let mut out = Vec::new();
        writer.write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn test_read_written_codes() {
        let data = build(&[
            ("antizapret", RuleItem::Domain("example.com".to_string())),
            ("antizapret", RuleItem::DomainSuffix(".example.com".to_string())),
            ("other", RuleItem::DomainKeyword("casino".to_string())),
        ]);

        let mut reader = GeositeReader::from_bytes(data).unwrap();
        assert_eq!(reader.codes(), ["antizapret", "other"]);

        let items = reader.read("other").unwrap();
        assert_eq!(items, vec![RuleItem::DomainKeyword("casino".to_string())]);

        let items = reader.read("antizapret").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], RuleItem::DomainSuffix(".example.com".to_string()));
    }

    #[test]
    fn test_rejects_unknown_version() {
        assert!(GeositeReader::from_bytes(vec![1, 0]).is_err());
    }

    #[test]
    fn test_missing_code() {
        let mut reader = GeositeReader::from_bytes(build(&[])).unwrap();
        assert!(reader.codes().is_empty());
        assert!(reader.read("antizapret").is_err());
    }

    #[test]
    fn test_rejects_unknown_item_type() {
        // one code "a" at offset 0 with a single item of type 9
        let data = vec![0, 1, 1, b'a', 0, 1, 9, 1, b'x'];
        let mut reader = GeositeReader::from_bytes(data).unwrap();
        assert!(reader.read("a").is_err());
    }
}
