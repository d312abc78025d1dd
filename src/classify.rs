//! Record classification: overrides applied, domains decomposed, IPs parsed.

use crossbeam_channel::{Receiver, Sender};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::overrides::OverrideSet;
use crate::source::Record;
use crate::{Error, Result};

/// Geosite rule item.
///
/// The classifier only emits `Domain` and `DomainSuffix`; the other kinds
/// exist because the geosite format can carry them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleItem {
    /// Exact domain match
    Domain(String),
    /// Suffix match, stored with a leading dot
    DomainSuffix(String),
    /// Substring match
    DomainKeyword(String),
    /// Regex match
    DomainRegex(String),
}

impl RuleItem {
    pub fn value(&self) -> &str {
        match self {
            RuleItem::Domain(v)
            | RuleItem::DomainSuffix(v)
            | RuleItem::DomainKeyword(v)
            | RuleItem::DomainRegex(v) => v,
        }
    }

    /// Item type byte used by the sing-geosite format.
    pub fn type_byte(&self) -> u8 {
        match self {
            RuleItem::Domain(_) => 0,
            RuleItem::DomainSuffix(_) => 1,
            RuleItem::DomainKeyword(_) => 2,
            RuleItem::DomainRegex(_) => 3,
        }
    }

    pub fn from_type_byte(kind: u8, value: String) -> Option<Self> {
        match kind {
            0 => Some(RuleItem::Domain(value)),
            1 => Some(RuleItem::DomainSuffix(value)),
            2 => Some(RuleItem::DomainKeyword(value)),
            3 => Some(RuleItem::DomainRegex(value)),
            _ => None,
        }
    }
}

/// Decompose a dump domain into rule items.
///
/// `*.example.com` covers the apex and every subdomain, so it becomes
/// `Domain(example.com)` plus `DomainSuffix(.example.com)`. Anything else is a
/// single exact domain.
pub fn decompose_domain(domain: &str) -> Vec<RuleItem> {
    match domain.strip_prefix('*') {
        Some(rest) => {
            let base = rest.strip_prefix('.').unwrap_or(rest);
            domain_and_suffix(base)
        }
        None => vec![RuleItem::Domain(domain.to_string())],
    }
}

/// Items injected for a forced-include host: the host and all its subdomains.
pub fn inclusion_items(domain: &str) -> Vec<RuleItem> {
    domain_and_suffix(domain)
}

fn domain_and_suffix(base: &str) -> Vec<RuleItem> {
    if base.is_empty() {
        return Vec::new();
    }
    vec![
        RuleItem::Domain(base.to_string()),
        RuleItem::DomainSuffix(format!(".{}", base)),
    ]
}

/// Outcome of classifying one IP token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpToken {
    Network(IpNet),
    Excluded,
    Malformed,
}

/// Classify a single token of the `|`-separated IP field.
///
/// CIDR tokens are taken as written. Bare addresses are checked against the
/// excluded set and widened to a single-host network.
pub fn classify_ip_token(token: &str, overrides: &OverrideSet) -> IpToken {
    if token.contains('/') {
        return match token.parse::<IpNet>() {
            Ok(net) => IpToken::Network(net),
            Err(_) => IpToken::Malformed,
        };
    }

    match token.parse::<IpAddr>() {
        Ok(addr) if overrides.is_ip_excluded(&addr) => IpToken::Excluded,
        Ok(addr) => IpToken::Network(IpNet::from(addr)),
        Err(_) => IpToken::Malformed,
    }
}

/// Everything one record contributes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Classified {
    pub rules: Vec<RuleItem>,
    pub networks: Vec<IpNet>,
    /// The domain matched an exclusion pattern.
    pub domain_excluded: bool,
}

impl Classified {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.networks.is_empty()
    }
}

/// Classify a record against the overrides.
///
/// Domain exclusion only suppresses rule items; the record's IPs are still
/// classified on their own merits.
pub fn classify(record: &Record, overrides: &OverrideSet) -> Classified {
    let mut out = Classified::default();

    if let Some(domain) = record.domain() {
        // a wildcard row is excluded by patterns written for its apex too
        let base = domain.strip_prefix("*.").unwrap_or(domain);
        if overrides.is_domain_excluded(domain) || overrides.is_domain_excluded(base) {
            log::debug!("Excluded by pattern: {}", domain);
            out.domain_excluded = true;
        } else {
            out.rules = decompose_domain(domain);
        }
    }

    for token in record.ips().split('|').map(str::trim) {
        if token.is_empty() {
            continue;
        }
        match classify_ip_token(token, overrides) {
            IpToken::Network(net) => out.networks.push(net),
            IpToken::Excluded => log::debug!("Excluded IP: {}", token),
            IpToken::Malformed => log::warn!("Skipping malformed IP token {:?}", token),
        }
    }

    out
}

/// Diagnostic record counters shared by all workers.
#[derive(Debug, Default)]
pub struct ClassifyStats {
    included: AtomicU64,
    excluded: AtomicU64,
}

impl ClassifyStats {
    pub fn included(&self) -> u64 {
        self.included.load(Ordering::Relaxed)
    }

    pub fn excluded(&self) -> u64 {
        self.excluded.load(Ordering::Relaxed)
    }
}

/// One classifier worker. Cloned per thread; clones share overrides and stats.
#[derive(Clone)]
pub struct Classifier {
    overrides: Arc<OverrideSet>,
    stats: Arc<ClassifyStats>,
}

impl Classifier {
    pub fn new(overrides: Arc<OverrideSet>, stats: Arc<ClassifyStats>) -> Self {
        Self { overrides, stats }
    }

    /// Drain the record queue until it is closed and empty.
    ///
    /// Fails only if a downstream queue lost its consumer.
    pub fn run(
        &self,
        records: Receiver<Record>,
        ips: &Sender<IpNet>,
        rules: &Sender<RuleItem>,
    ) -> Result<()> {
        let mut counts = (0u64, 0u64);
        let outcome = self.drain(records, ips, rules, &mut counts);

        self.stats.included.fetch_add(counts.0, Ordering::Relaxed);
        self.stats.excluded.fetch_add(counts.1, Ordering::Relaxed);
        outcome
    }

    fn drain(
        &self,
        records: Receiver<Record>,
        ips: &Sender<IpNet>,
        rules: &Sender<RuleItem>,
        (included, excluded): &mut (u64, u64),
    ) -> Result<()> {
        for record in records.iter() {
            let classified = classify(&record, &self.overrides);
            if classified.domain_excluded {
                *excluded += 1;
            }
            if !classified.is_empty() {
                *included += 1;
            }
            for net in classified.networks {
                ips.send(net)
                    .map_err(|_| Error::Pipeline("IP queue closed early".to_string()))?;
            }
            for item in classified.rules {
                rules
                    .send(item)
                    .map_err(|_| Error::Pipeline("rule queue closed early".to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::load_patterns;

    fn overrides(patterns: &str, ips: &[&str]) -> OverrideSet {
        OverrideSet::new(
            load_patterns(patterns.as_bytes()).unwrap(),
            ips.iter().map(|ip| ip.parse().unwrap()),
            Vec::new(),
        )
    }

    #[test]
    fn test_decompose_wildcard() {
        assert_eq!(
            decompose_domain("*.example.com"),
            vec![
                RuleItem::Domain("example.com".to_string()),
                RuleItem::DomainSuffix(".example.com".to_string()),
            ]
        );
    }

    #[test]
    fn test_decompose_plain() {
        assert_eq!(
            decompose_domain("www.example.com"),
            vec![RuleItem::Domain("www.example.com".to_string())]
        );
    }

    #[test]
    fn test_decompose_bare_star() {
        assert!(decompose_domain("*").is_empty());
        assert!(decompose_domain("*.").is_empty());
    }

    #[test]
    fn test_inclusion_items() {
        assert_eq!(
            inclusion_items("extra.net"),
            vec![
                RuleItem::Domain("extra.net".to_string()),
                RuleItem::DomainSuffix(".extra.net".to_string()),
            ]
        );
    }

    #[test]
    fn test_classify_ip_tokens() {
        let o = overrides("", &["1.2.3.4"]);
        assert_eq!(classify_ip_token("1.2.3.4", &o), IpToken::Excluded);
        assert_eq!(
            classify_ip_token("1.2.3.5", &o),
            IpToken::Network("1.2.3.5/32".parse().unwrap())
        );
        assert_eq!(
            classify_ip_token("2001:db8::1", &o),
            IpToken::Network("2001:db8::1/128".parse().unwrap())
        );
        assert_eq!(classify_ip_token("10.0.0.0/33", &o), IpToken::Malformed);
        assert_eq!(classify_ip_token("garbage", &o), IpToken::Malformed);
    }

    #[test]
    fn test_cidr_keeps_written_form() {
        let o = overrides("", &[]);
        match classify_ip_token("5.6.7.8/24", &o) {
            IpToken::Network(net) => assert_eq!(net.to_string(), "5.6.7.8/24"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_excluded_ip_does_not_match_cidr() {
        let o = overrides("", &["1.2.3.4"]);
        assert!(matches!(
            classify_ip_token("1.2.3.4/32", &o),
            IpToken::Network(_)
        ));
    }

    #[test]
    fn test_classify_record() {
        let o = overrides("", &[]);
        let record = Record::new("1.2.3.4|5.6.7.8/24", Some("*.example.com".to_string()));
        let c = classify(&record, &o);
        assert_eq!(c.rules.len(), 2);
        assert_eq!(c.networks.len(), 2);
        assert!(!c.domain_excluded);
    }

    #[test]
    fn test_excluded_domain_keeps_ips() {
        let o = overrides("^example\\.com$", &[]);
        let record = Record::new("1.2.3.4|5.6.7.8/24", Some("example.com".to_string()));
        let c = classify(&record, &o);
        assert!(c.domain_excluded);
        assert!(c.rules.is_empty());
        assert_eq!(c.networks.len(), 2);
    }

    #[test]
    fn test_apex_pattern_excludes_wildcard() {
        let o = overrides("^example\\.com$", &[]);
        let record = Record::new("1.2.3.4", Some("*.example.com".to_string()));
        let c = classify(&record, &o);
        assert!(c.domain_excluded);
        assert!(c.rules.is_empty());
        assert_eq!(c.networks.len(), 1);
    }

    #[test]
    fn test_excluded_ip_keeps_other_tokens() {
        let o = overrides("", &["1.2.3.4"]);
        let record = Record::new("1.2.3.4|9.9.9.9|bad||5.6.7.8/24", None);
        let c = classify(&record, &o);
        let nets: Vec<String> = c.networks.iter().map(|n| n.to_string()).collect();
        assert_eq!(nets, vec!["9.9.9.9/32", "5.6.7.8/24"]);
    }

    #[test]
    fn test_worker_drains_and_counts() {
        let o = Arc::new(overrides("^skip\\.me$", &[]));
        let stats = Arc::new(ClassifyStats::default());
        let classifier = Classifier::new(o, stats.clone());

        let (rec_tx, rec_rx) = crossbeam_channel::bounded(16);
        let (ip_tx, ip_rx) = crossbeam_channel::bounded(16);
        let (rule_tx, rule_rx) = crossbeam_channel::bounded(16);

        rec_tx
            .send(Record::new("1.1.1.1", Some("a.com".to_string())))
            .unwrap();
        rec_tx
            .send(Record::new("", Some("skip.me".to_string())))
            .unwrap();
        drop(rec_tx);

        classifier.run(rec_rx, &ip_tx, &rule_tx).unwrap();
        drop(ip_tx);
        drop(rule_tx);

        assert_eq!(ip_rx.iter().count(), 1);
        assert_eq!(rule_rx.iter().count(), 1);
        assert_eq!(stats.included(), 1);
        assert_eq!(stats.excluded(), 1);
    }
}
