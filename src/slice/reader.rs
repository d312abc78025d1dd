//! Compiled ruleset reader.

use fst::Set;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::path::Path;

use super::format::*;
use crate::{Error, Result, Target};

/// Reader for compiled ruleset files.
pub struct SliceReader {
    data: Vec<u8>,
    header: SliceHeader,
    entries: Vec<SliceEntry>,
}

impl SliceReader {
    /// Load from bytes, validating header, checksum and slice bounds.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = SliceHeader::from_bytes(data)?;
        header.validate()?;

        if Sha256::digest(&data[HEADER_SIZE..])[..16] != header.checksum {
            return Err(Error::ChecksumMismatch);
        }

        let slice_count = header.slice_count as usize;
        let entries_end = HEADER_SIZE + slice_count * ENTRY_SIZE;
        if data.len() < entries_end {
            return Err(Error::Config("slice index truncated".to_string()));
        }

        let mut entries = Vec::with_capacity(slice_count);
        for i in 0..slice_count {
            let offset = HEADER_SIZE + i * ENTRY_SIZE;
            let entry = SliceEntry::from_bytes(&data[offset..offset + ENTRY_SIZE]);
            if entry.offset as usize + entry.size as usize > data.len() {
                return Err(Error::Config(format!("slice {} out of bounds", i)));
            }
            entries.push(entry);
        }

        Ok(Self {
            data: data.to_vec(),
            header,
            entries,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn fallback(&self) -> Target {
        self.header.fallback()
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn slice_count(&self) -> usize {
        self.entries.len()
    }

    /// Total entry count over all slices of `slice_type`.
    pub fn entry_count(&self, slice_type: SliceType) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.get_type() == Some(slice_type))
            .map(|e| u64::from(e.count))
            .sum()
    }

    /// Match a domain against all slices in order.
    ///
    /// Returns the target of the first matching slice; the caller should use
    /// `fallback()` when None is returned.
    pub fn match_domain(&self, domain: &str) -> Option<Target> {
        let normalized = domain.trim_end_matches('.').to_lowercase();

        for entry in &self.entries {
            let matched = match entry.get_type() {
                Some(SliceType::FstExact) => self
                    .fst(entry)
                    .is_some_and(|set| set.contains(&normalized)),
                Some(SliceType::FstSuffix) => self
                    .fst(entry)
                    .is_some_and(|set| suffix_match(&set, &normalized)),
                _ => false,
            };
            if matched {
                return Some(entry.get_target());
            }
        }

        None
    }

    /// Match an IP address against all slices in order.
    pub fn match_ip(&self, ip: IpAddr) -> Option<Target> {
        for entry in &self.entries {
            let matched = match (entry.get_type(), ip) {
                (Some(SliceType::CidrV4), IpAddr::V4(v4)) => {
                    self.match_cidr_v4_in_slice(entry, v4.into())
                }
                (Some(SliceType::CidrV6), IpAddr::V6(v6)) => {
                    self.match_cidr_v6_in_slice(entry, v6.octets())
                }
                _ => false,
            };
            if matched {
                return Some(entry.get_target());
            }
        }

        None
    }

    fn slice_data(&self, entry: &SliceEntry) -> &[u8] {
        let offset = entry.offset as usize;
        &self.data[offset..offset + entry.size as usize]
    }

    fn fst(&self, entry: &SliceEntry) -> Option<Set<&[u8]>> {
        Set::new(self.slice_data(entry)).ok()
    }

    fn match_cidr_v4_in_slice(&self, entry: &SliceEntry, ip: u32) -> bool {
        let data = self.slice_data(entry);
        let network_at = |i: usize| {
            let at = i * CIDR_V4_SIZE;
            u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
        };
        // arrays are sorted and disjoint: only the last network <= ip can match
        let Some(i) = last_at_or_below(data.len() / CIDR_V4_SIZE, |i| network_at(i) <= ip) else {
            return false;
        };
        let prefix_len = data[i * CIDR_V4_SIZE + 4];
        let mask = match prefix_len {
            0 => 0,
            1..=31 => !0u32 << (32 - prefix_len),
            _ => !0u32,
        };
        ip & mask == network_at(i) & mask
    }

    fn match_cidr_v6_in_slice(&self, entry: &SliceEntry, ip: [u8; 16]) -> bool {
        let data = self.slice_data(entry);
        let chunk = |i: usize| &data[i * CIDR_V6_SIZE..(i + 1) * CIDR_V6_SIZE];
        let Some(i) = last_at_or_below(data.len() / CIDR_V6_SIZE, |i| chunk(i)[..16] <= ip[..]) else {
            return false;
        };
        matches_ipv6_cidr(&ip, &chunk(i)[..16], chunk(i)[16])
    }
}

/// Index of the last element for which `at_or_below` holds, over a
/// partitioned range of `len` elements.
fn last_at_or_below(len: usize, at_or_below: impl Fn(usize) -> bool) -> Option<usize> {
    let (mut lo, mut hi) = (0, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if at_or_below(mid) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo.checked_sub(1)
}

/// Check every proper suffix of `domain` that starts at a label boundary.
fn suffix_match(set: &Set<&[u8]>, domain: &str) -> bool {
    domain.match_indices('.').any(|(i, _)| {
        let reversed: String = domain[i..].chars().rev().collect();
        set.contains(reversed)
    })
}

fn matches_ipv6_cidr(ip: &[u8; 16], network: &[u8], prefix_len: u8) -> bool {
    let prefix_len = usize::from(prefix_len.min(128));
    let full_bytes = prefix_len / 8;
    let remaining_bits = prefix_len % 8;

    if ip[..full_bytes] != network[..full_bytes] {
        return false;
    }

    if remaining_bits > 0 {
        let mask = 0xFFu8 << (8 - remaining_bits);
        if (ip[full_bytes] & mask) != (network[full_bytes] & mask) {
            return false;
        }
    }

    true
}
