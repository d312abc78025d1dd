//! sing-geosite database writer.

use std::collections::BTreeMap;
use std::io::Write;

use super::{write_uvarint, write_vstring, GEOSITE_VERSION};
use crate::classify::RuleItem;
use crate::Result;

/// Buffers rule items per code and serializes them in one pass.
#[derive(Debug, Default)]
pub struct GeositeWriter {
    codes: BTreeMap<String, Vec<RuleItem>>,
}

impl GeositeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item under `code`. Duplicates are kept as given.
    pub fn push(&mut self, code: &str, item: RuleItem) {
        self.codes.entry(code.to_string()).or_default().push(item);
    }

    /// Number of items buffered under `code`.
    pub fn item_count(&self, code: &str) -> usize {
        self.codes.get(code).map_or(0, Vec::len)
    }

    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let mut content = Vec::new();
        let mut offsets = Vec::with_capacity(self.codes.len());
        for items in self.codes.values() {
            offsets.push(content.len());
            for item in items {
                content.push(item.type_byte());
                write_vstring(&mut content, item.value())?;
            }
        }

        writer.write_all(&[GEOSITE_VERSION])?;
        write_uvarint(writer, self.codes.len() as u64)?;
        for ((code, items), offset) in self.codes.iter().zip(&offsets) {
            write_vstring(writer, code)?;
            write_uvarint(writer, *offset as u64)?;
            write_uvarint(writer, items.len() as u64)?;
        }
        writer.write_all(&content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_layout() {
        let mut writer = GeositeWriter::new();
        writer.push("ab", RuleItem::Domain("x.io".to_string()));
        writer.push("ab", RuleItem::DomainSuffix(".x.io".to_string()));

        let mut out = Vec::new();
        writer.write_to(&mut out).unwrap();

        let expected: Vec<u8> = [
            &[0u8, 1][..],                           // version, code count
            &[2, b'a', b'b', 0, 2][..],              // code "ab", offset 0, 2 items
            &[0, 4, b'x', b'.', b'i', b'o'][..],     // domain
            &[1, 5, b'.', b'x', b'.', b'i', b'o'][..], // suffix
        ]
        .concat();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_codes_sorted_with_offsets() {
        let mut writer = GeositeWriter::new();
        writer.push("zz", RuleItem::Domain("b".to_string()));
        writer.push("aa", RuleItem::Domain("a".to_string()));
        assert_eq!(writer.item_count("aa"), 1);
        assert_eq!(writer.item_count("missing"), 0);

        let mut out = Vec::new();
        writer.write_to(&mut out).unwrap();
        // header: version, count, "aa" off 0 len 1, "zz" off 3 len 1
        assert_eq!(&out[..12], &[0, 2, 2, b'a', b'a', 0, 1, 2, b'z', b'z', 3, 1]);
    }
}
