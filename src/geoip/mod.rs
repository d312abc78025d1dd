//! sing-box `geoip.db` generation.
//!
//! The database is a standard MaxMind DB whose data records are plain strings
//! (the country code, here the list label). IPv4 networks are stored in the
//! IPv4-compatible `::/96` subtree without the usual `::ffff:0:0/96` and
//! `2002::/16` aliases.

mod encode;
mod writer;

pub use writer::MmdbWriter;

/// `database_type` expected by sing-box.
pub const DATABASE_TYPE: &str = "sing-geoip";

/// Separates the data section from the metadata map.
pub(crate) const METADATA_MARKER: &[u8] = b"\xAB\xCD\xEFMaxMind.com";
