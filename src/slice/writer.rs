//! Compiled ruleset writer.

use fst::Set;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use sha2::{Digest, Sha256};

use super::format::*;
use crate::{Error, Result, Target};

/// Builder for compiled ruleset files.
///
/// Slices are matched in the order they are added; empty inputs add no slice.
pub struct SliceWriter {
    fallback: Target,
    slices: Vec<SliceData>,
}

struct SliceData {
    entry: SliceEntry,
    data: Vec<u8>,
}

impl SliceWriter {
    pub fn new(fallback: Target) -> Self {
        Self {
            fallback,
            slices: Vec::new(),
        }
    }

    /// Add a domain suffix slice.
    ///
    /// Suffixes are stored reversed so that `.example.com` becomes
    /// `moc.elpmaxe.`; a leading dot restricts the match to subdomains.
    pub fn add_suffix_slice<S: AsRef<str>>(&mut self, suffixes: &[S], target: Target) -> Result<()> {
        let reversed = suffixes
            .iter()
            .map(|s| s.as_ref().to_lowercase().chars().rev().collect::<String>());
        self.add_fst_slice(SliceType::FstSuffix, reversed.collect(), target)
    }

    /// Add an exact domain slice.
    pub fn add_exact_slice<S: AsRef<str>>(&mut self, domains: &[S], target: Target) -> Result<()> {
        let lowered = domains.iter().map(|d| d.as_ref().to_lowercase());
        self.add_fst_slice(SliceType::FstExact, lowered.collect(), target)
    }

    fn add_fst_slice(&mut self, slice_type: SliceType, mut keys: Vec<String>, target: Target) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        keys.sort();
        keys.dedup();

        let set = Set::from_iter(keys.iter().map(String::as_str))
            .map_err(|e| Error::Encode(format!("failed to build FST: {}", e)))?;

        let mut entry = SliceEntry::new(slice_type, target);
        entry.count = keys.len() as u32;
        self.slices.push(SliceData {
            entry,
            data: set.as_fst().as_bytes().to_vec(),
        });
        Ok(())
    }

    /// Add CIDR slices, one per address family present in `networks`.
    ///
    /// Host bits are masked off. Duplicates and networks inside another listed
    /// network are dropped, so each array is sorted and disjoint.
    pub fn add_cidr_slices(&mut self, networks: &[IpNet], target: Target) -> Result<()> {
        let mut v4: Vec<Ipv4Net> = Vec::new();
        let mut v6: Vec<Ipv6Net> = Vec::new();
        for net in networks {
            match net.trunc() {
                IpNet::V4(n) => v4.push(n),
                IpNet::V6(n) => v6.push(n),
            }
        }
        v4.sort_unstable();
        v4.dedup_by(|n, kept| kept.contains(&*n));
        v6.sort_unstable();
        v6.dedup_by(|n, kept| kept.contains(&*n));

        if !v4.is_empty() {
            let mut data = Vec::with_capacity(v4.len() * CIDR_V4_SIZE);
            for net in &v4 {
                data.extend_from_slice(&net.network().octets());
                data.push(net.prefix_len());
                data.extend_from_slice(&[0u8; 3]);
            }
            self.push_array(SliceType::CidrV4, v4.len(), data, target);
        }

        if !v6.is_empty() {
            let mut data = Vec::with_capacity(v6.len() * CIDR_V6_SIZE);
            for net in &v6 {
                data.extend_from_slice(&net.network().octets());
                data.push(net.prefix_len());
                data.extend_from_slice(&[0u8; 7]);
            }
            self.push_array(SliceType::CidrV6, v6.len(), data, target);
        }
        Ok(())
    }

    fn push_array(&mut self, slice_type: SliceType, count: usize, data: Vec<u8>, target: Target) {
        let mut entry = SliceEntry::new(slice_type, target);
        entry.count = count as u32;
        self.slices.push(SliceData { entry, data });
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    /// Build the final binary data.
    pub fn build(&mut self) -> Result<Vec<u8>> {
        let slice_count = self.slices.len();
        let data_start = HEADER_SIZE + slice_count * ENTRY_SIZE;

        let mut current_offset = data_start;
        for slice in &mut self.slices {
            slice.entry.offset = u32::try_from(current_offset)
                .map_err(|_| Error::Encode("ruleset exceeds 4 GiB".to_string()))?;
            slice.entry.size = slice.data.len() as u32;
            current_offset += slice.data.len();
        }

        let mut output = Vec::with_capacity(current_offset);
        output.resize(HEADER_SIZE, 0);
        for slice in &self.slices {
            output.extend_from_slice(&slice.entry.to_bytes());
        }
        for slice in &self.slices {
            output.extend_from_slice(&slice.data);
        }

        let mut header = SliceHeader::new(self.fallback);
        header.slice_count = slice_count as u32;
        header.timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        header
            .checksum
            .copy_from_slice(&Sha256::digest(&output[HEADER_SIZE..])[..16]);
        output[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice_count(data: &[u8]) -> u32 {
        u32::from_le_bytes(data[12..16].try_into().unwrap())
    }

    #[test]
    fn test_write_empty() {
        let mut writer = SliceWriter::new(Target::Direct);
        writer.add_exact_slice::<&str>(&[], Target::Proxy).unwrap();
        writer.add_cidr_slices(&[], Target::Proxy).unwrap();
        let data = writer.build().unwrap();

        assert_eq!(data.len(), HEADER_SIZE);
        assert_eq!(&data[0..8], b"AZRULES1");
        assert_eq!(slice_count(&data), 0);
    }

    #[test]
    fn test_cidrs_split_by_family() {
        let networks: Vec<IpNet> = ["10.0.0.1/8", "10.0.0.0/8", "2001:db8::/32"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let mut writer = SliceWriter::new(Target::Direct);
        writer.add_cidr_slices(&networks, Target::Proxy).unwrap();
        assert_eq!(writer.slice_count(), 2);

        let data = writer.build().unwrap();
        let v4 = SliceEntry::from_bytes(&data[HEADER_SIZE..]);
        assert_eq!(v4.get_type(), Some(SliceType::CidrV4));
        // host bits masked, so both spellings of 10/8 collapse
        assert_eq!(v4.count, 1);
        assert_eq!(v4.size as usize, CIDR_V4_SIZE);
        assert_eq!(&data[v4.offset as usize..v4.offset as usize + 5], &[10, 0, 0, 0, 8]);
    }

    #[test]
    fn test_nested_cidrs_are_dropped() {
        let networks: Vec<IpNet> = ["10.1.2.0/24", "10.0.0.0/8", "10.200.0.0/16", "11.0.0.0/8"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let mut writer = SliceWriter::new(Target::Direct);
        writer.add_cidr_slices(&networks, Target::Proxy).unwrap();

        let data = writer.build().unwrap();
        let v4 = SliceEntry::from_bytes(&data[HEADER_SIZE..]);
        assert_eq!(v4.count, 2);
        let body = &data[v4.offset as usize..];
        assert_eq!(&body[..5], &[10, 0, 0, 0, 8]);
        assert_eq!(&body[CIDR_V4_SIZE..CIDR_V4_SIZE + 5], &[11, 0, 0, 0, 8]);
    }

    #[test]
    fn test_checksum_covers_body() {
        let mut writer = SliceWriter::new(Target::Direct);
        writer.add_exact_slice(&["example.com"], Target::Proxy).unwrap();
        let data = writer.build().unwrap();

        let digest = Sha256::digest(&data[HEADER_SIZE..]);
        assert_eq!(&data[32..48], &digest[..16]);
        assert_eq!(data[16], Target::Direct.as_u8());
    }
}
