//! MaxMind DB writer.

use ahash::AHashMap;
use ipnet::IpNet;
use std::collections::VecDeque;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use super::encode::Value;
use super::{DATABASE_TYPE, METADATA_MARKER};
use crate::{Error, Result};

/// Child link of a search tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Empty,
    Node(usize),
    Data(usize),
}

/// Builds a MaxMind DB (IPv6 tree, IPv4 under `::/96`) in memory.
///
/// Every network maps to a label string. Networks are inserted in any order;
/// a network already covered by a supernet with the same label is a no-op and
/// a supernet replaces whatever was below it.
pub struct MmdbWriter {
    database_type: String,
    languages: Vec<String>,
    description: String,
    nodes: Vec<[Link; 2]>,
    labels: Vec<String>,
    label_index: AHashMap<String, usize>,
    inserted: usize,
}

impl MmdbWriter {
    pub fn new(database_type: &str, languages: Vec<String>) -> Self {
        Self {
            database_type: database_type.to_string(),
            languages,
            description: String::new(),
            nodes: vec![[Link::Empty; 2]],
            labels: Vec::new(),
            label_index: AHashMap::new(),
            inserted: 0,
        }
    }

    /// Writer for a sing-box `geoip.db` with a single language `label`.
    pub fn sing_geoip(label: &str) -> Self {
        Self::new(DATABASE_TYPE, vec![label.to_string()])
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Number of `insert` calls so far.
    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn insert(&mut self, network: IpNet, label: &str) {
        self.inserted += 1;
        let data = self.label_slot(label);
        let (key, depth) = tree_key(&network);

        if depth == 0 {
            self.nodes[0] = [Link::Data(data); 2];
            return;
        }

        let mut node = 0;
        for i in 0..depth {
            let bit = ((key >> (127 - i)) & 1) as usize;
            if i + 1 == depth {
                self.nodes[node][bit] = Link::Data(data);
                return;
            }
            node = match self.nodes[node][bit] {
                Link::Node(next) => next,
                Link::Data(existing) if existing == data => return,
                Link::Data(existing) => self.push_node(node, bit, [Link::Data(existing); 2]),
                Link::Empty => self.push_node(node, bit, [Link::Empty; 2]),
            };
        }
    }

    fn label_slot(&mut self, label: &str) -> usize {
        if let Some(&idx) = self.label_index.get(label) {
            return idx;
        }
        let idx = self.labels.len();
        self.labels.push(label.to_string());
        self.label_index.insert(label.to_string(), idx);
        idx
    }

    fn push_node(&mut self, parent: usize, bit: usize, children: [Link; 2]) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(children);
        self.nodes[parent][bit] = Link::Node(idx);
        idx
    }

    /// Serialize the database.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        // Renumber reachable nodes breadth-first; replaced subtrees are dropped.
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut renumbered = vec![usize::MAX; self.nodes.len()];
        let mut queue = VecDeque::from([0usize]);
        renumbered[0] = 0;
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for link in self.nodes[node] {
                if let Link::Node(child) = link {
                    renumbered[child] = order.len() + queue.len();
                    queue.push_back(child);
                }
            }
        }
        let node_count = order.len();

        let mut data = Vec::new();
        let mut data_offsets = Vec::with_capacity(self.labels.len());
        for label in &self.labels {
            data_offsets.push(data.len());
            Value::Str(label).encode(&mut data);
        }

        let max_record = node_count + 16 + data.len();
        let record_size: u16 = if max_record < 1 << 24 {
            24
        } else if max_record < 1 << 28 {
            28
        } else if max_record <= u32::MAX as usize {
            32
        } else {
            return Err(Error::Encode(format!(
                "search tree too large: {} nodes",
                node_count
            )));
        };

        let resolve = |link: Link| -> u32 {
            match link {
                Link::Empty => node_count as u32,
                Link::Node(n) => renumbered[n] as u32,
                Link::Data(d) => (node_count + 16 + data_offsets[d]) as u32,
            }
        };

        let node_bytes = usize::from(record_size) / 4;
        let mut tree = Vec::with_capacity(node_count * node_bytes);
        for &node in &order {
            let [left, right] = self.nodes[node];
            write_node(&mut tree, record_size, resolve(left), resolve(right));
        }

        writer.write_all(&tree)?;
        writer.write_all(&[0u8; 16])?;
        writer.write_all(&data)?;
        writer.write_all(METADATA_MARKER)?;

        let mut metadata = Vec::new();
        self.metadata(node_count as u32, record_size).encode(&mut metadata);
        writer.write_all(&metadata)?;

        log::debug!(
            "MMDB written: {} nodes, record size {}, {} labels",
            node_count,
            record_size,
            self.labels.len()
        );
        Ok(())
    }

    fn metadata(&self, node_count: u32, record_size: u16) -> Value<'_> {
        let build_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut description = Vec::new();
        if !self.description.is_empty() {
            description.push(("en", Value::Str(&self.description)));
        }

        Value::Map(vec![
            ("binary_format_major_version", Value::U16(2)),
            ("binary_format_minor_version", Value::U16(0)),
            ("build_epoch", Value::U64(build_epoch)),
            ("database_type", Value::Str(&self.database_type)),
            ("description", Value::Map(description)),
            ("ip_version", Value::U16(6)),
            (
                "languages",
                Value::Array(self.languages.iter().map(|l| Value::Str(l)).collect()),
            ),
            ("node_count", Value::U32(node_count)),
            ("record_size", Value::U16(record_size)),
        ])
    }
}

/// 128-bit tree key and depth; IPv4 lives under the `::/96` subtree.
fn tree_key(network: &IpNet) -> (u128, usize) {
    match network {
        IpNet::V4(net) => (
            u128::from(u32::from(net.addr())),
            96 + usize::from(net.prefix_len()),
        ),
        IpNet::V6(net) => (u128::from(net.addr()), usize::from(net.prefix_len())),
    }
}

fn write_node(out: &mut Vec<u8>, record_size: u16, left: u32, right: u32) {
    match record_size {
        24 => {
            out.extend_from_slice(&left.to_be_bytes()[1..]);
            out.extend_from_slice(&right.to_be_bytes()[1..]);
        }
        28 => {
            out.extend_from_slice(&left.to_be_bytes()[1..]);
            out.push((((left >> 24) & 0x0F) << 4) as u8 | ((right >> 24) & 0x0F) as u8);
            out.extend_from_slice(&right.to_be_bytes()[1..]);
        }
        _ => {
            out.extend_from_slice(&left.to_be_bytes());
            out.extend_from_slice(&right.to_be_bytes());
        }
    }
}
