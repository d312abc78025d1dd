//! Compiled ruleset binary format.
//!
//! File structure:
//! ```text
//! +--------------------+
//! |  HEADER (64 bytes) |  Magic "AZRULES1", version, slice_count, fallback, timestamp, checksum
//! +--------------------+
//! |  SLICE INDEX       |  Array of SliceEntry (type, target, offset, size, count)
//! +--------------------+
//! |  SLICE 0 DATA      |  FST or sorted array
//! +--------------------+
//! |      ...           |
//! +--------------------+
//! ```
//!
//! All integers in the header and index are little-endian. The checksum is
//! the first 16 bytes of the SHA-256 of everything after the header.

use crate::{Error, Result, Target};

/// Magic bytes of a compiled ruleset
pub const MAGIC: [u8; 8] = *b"AZRULES1";

/// Current format version
pub const FORMAT_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Slice index entry size in bytes
pub const ENTRY_SIZE: usize = 16;

/// Bytes per IPv4 CIDR: network (4, BE) + prefix_len (1) + padding (3)
pub const CIDR_V4_SIZE: usize = 8;

/// Bytes per IPv6 CIDR: network (16) + prefix_len (1) + padding (7)
pub const CIDR_V6_SIZE: usize = 24;

/// Slice type identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    /// FST of reversed domain suffixes
    FstSuffix = 0x01,
    /// FST of exact domains
    FstExact = 0x02,
    /// IPv4 CIDR ranges
    CidrV4 = 0x03,
    /// IPv6 CIDR ranges
    CidrV6 = 0x04,
}

impl SliceType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::FstSuffix),
            0x02 => Some(Self::FstExact),
            0x03 => Some(Self::CidrV4),
            0x04 => Some(Self::CidrV6),
            _ => None,
        }
    }
}

/// File header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub slice_count: u32,
    /// Target when no slice matches
    pub fallback_target: u8,
    /// Unix timestamp of the build
    pub timestamp: i64,
    /// SHA-256 of the body (first 16 bytes)
    pub checksum: [u8; 16],
}

impl SliceHeader {
    pub fn new(fallback: Target) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            slice_count: 0,
            fallback_target: fallback.as_u8(),
            timestamp: 0,
            checksum: [0; 16],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..8].copy_from_slice(&self.magic);
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..16].copy_from_slice(&self.slice_count.to_le_bytes());
        out[16] = self.fallback_target;
        out[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
        out[32..48].copy_from_slice(&self.checksum);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidHeaderSize {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let mut header = Self::new(Target::Direct);
        header.magic.copy_from_slice(&data[0..8]);
        header.version = u32::from_le_bytes(le_array(&data[8..12]));
        header.slice_count = u32::from_le_bytes(le_array(&data[12..16]));
        header.fallback_target = data[16];
        header.timestamp = i64::from_le_bytes(le_array(&data[24..32]));
        header.checksum.copy_from_slice(&data[32..48]);
        Ok(header)
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        if self.version > FORMAT_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    pub fn fallback(&self) -> Target {
        Target::from_u8(self.fallback_target).unwrap_or(Target::Direct)
    }
}

/// Slice index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceEntry {
    pub slice_type: u8,
    pub target: u8,
    /// Offset to slice data (from file start)
    pub offset: u32,
    /// Size of slice data
    pub size: u32,
    /// Number of entries in this slice
    pub count: u32,
}

impl SliceEntry {
    pub fn new(slice_type: SliceType, target: Target) -> Self {
        Self {
            slice_type: slice_type as u8,
            target: target.as_u8(),
            offset: 0,
            size: 0,
            count: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0] = self.slice_type;
        out[1] = self.target;
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.size.to_le_bytes());
        out[12..16].copy_from_slice(&self.count.to_le_bytes());
        out
    }

    /// Parse an entry; `data` must hold at least `ENTRY_SIZE` bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            slice_type: data[0],
            target: data[1],
            offset: u32::from_le_bytes(le_array(&data[4..8])),
            size: u32::from_le_bytes(le_array(&data[8..12])),
            count: u32::from_le_bytes(le_array(&data[12..16])),
        }
    }

    pub fn get_type(&self) -> Option<SliceType> {
        SliceType::from_u8(self.slice_type)
    }

    pub fn get_target(&self) -> Target {
        Target::from_u8(self.target).unwrap_or(Target::Direct)
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
