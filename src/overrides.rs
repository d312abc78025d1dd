//! Operator overrides: exclusion patterns, excluded IPs and forced-include hosts.
//!
//! The three lists are loaded once before the pipeline starts and shared
//! read-only by every classifier worker.

use ahash::AHashSet;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::IpAddr;
use std::path::Path;

use crate::{Error, Result};

/// Immutable override set consulted during classification.
#[derive(Debug, Default)]
pub struct OverrideSet {
    excluded_patterns: Vec<Regex>,
    excluded_ips: AHashSet<IpAddr>,
    included_domains: Vec<String>,
}

impl OverrideSet {
    /// Create an override set from already loaded parts.
    pub fn new(
        excluded_patterns: Vec<Regex>,
        excluded_ips: impl IntoIterator<Item = IpAddr>,
        included_domains: Vec<String>,
    ) -> Self {
        Self {
            excluded_patterns,
            excluded_ips: excluded_ips.into_iter().collect(),
            included_domains,
        }
    }

    /// Load all three lists.
    ///
    /// Pattern and inclusion lists are local files; the excluded IP list is any
    /// line-oriented reader (usually an HTTP body).
    pub fn load<R: BufRead>(excluded_path: &Path, included_path: &Path, excluded_ips: R) -> Result<Self> {
        let excluded_patterns = open(excluded_path)
            .and_then(load_patterns)
            .map_err(|e| e.in_stage("load exclusion patterns"))?;
        let included_domains = open(included_path)
            .and_then(load_included)
            .map_err(|e| e.in_stage("load included domains"))?;
        let excluded_ips =
            load_excluded_ips(excluded_ips).map_err(|e| e.in_stage("load excluded IPs"))?;

        let set = Self {
            excluded_patterns,
            excluded_ips,
            included_domains,
        };
        log::info!(
            "Overrides loaded: {} exclusion patterns, {} included domains, {} excluded IPs",
            set.excluded_patterns.len(),
            set.included_domains.len(),
            set.excluded_ips.len()
        );
        Ok(set)
    }

    /// Check whether a domain matches any exclusion pattern.
    pub fn is_domain_excluded(&self, domain: &str) -> bool {
        self.excluded_patterns.iter().any(|re| re.is_match(domain))
    }

    /// Check whether a bare address is excluded.
    pub fn is_ip_excluded(&self, ip: &IpAddr) -> bool {
        self.excluded_ips.contains(ip)
    }

    pub fn excluded_patterns(&self) -> &[Regex] {
        &self.excluded_patterns
    }

    pub fn excluded_ip_count(&self) -> usize {
        self.excluded_ips.len()
    }

    pub fn included_domains(&self) -> &[String] {
        &self.included_domains
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("cannot open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

/// Lines that carry content: not blank and not a `#` comment.
///
/// Lines are returned as written, minus a trailing `\r`.
fn content_lines<R: BufRead>(reader: R) -> impl Iterator<Item = Result<(usize, String)>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| match line {
            Ok(mut line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    None
                } else {
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    Some(Ok((idx + 1, line)))
                }
            }
            Err(e) => Some(Err(Error::Io(e))),
        })
}

/// Compile one regex per line. Any pattern that fails to compile is fatal.
pub fn load_patterns<R: BufRead>(reader: R) -> Result<Vec<Regex>> {
    let mut patterns = Vec::new();
    for entry in content_lines(reader) {
        let (line, pattern) = entry?;
        let re = Regex::new(&pattern).map_err(|source| Error::InvalidPattern {
            line,
            pattern: pattern.clone(),
            source,
        })?;
        log::debug!("Excluding (regex): {}", re.as_str());
        patterns.push(re);
    }
    Ok(patterns)
}

/// Read one domain per line.
pub fn load_included<R: BufRead>(reader: R) -> Result<Vec<String>> {
    content_lines(reader)
        .map(|entry| entry.map(|(_, domain)| domain.trim().to_string()))
        .collect()
}

/// Parse the upstream excluded-IP list.
///
/// Entries look like `^1\.2\.3\.4;`; the escapes and anchors are stripped
/// before parsing. Unparsable lines are logged and skipped.
pub fn load_excluded_ips<R: BufRead>(reader: R) -> Result<AHashSet<IpAddr>> {
    let mut ips = AHashSet::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_excluded_ip(&line) {
            Some(ip) => {
                ips.insert(ip);
            }
            None => log::warn!("Skipping excluded IP entry {:?}: not an IP address", line),
        }
    }
    Ok(ips)
}

fn parse_excluded_ip(line: &str) -> Option<IpAddr> {
    let cleaned = line
        .replace('\\', "")
        .replacen('^', "", 1)
        .replacen(';', "", 1);
    cleaned.trim().parse().ok()
}
