//! Single-consumer aggregation of classified items into canonical sets.
//!
//! Each aggregator owns its sets and its encoder for the whole run and hands
//! both back when its queue is closed and drained.

use ahash::AHashSet;
use crossbeam_channel::Receiver;
use ipnet::IpNet;

use crate::classify::RuleItem;
use crate::geoip::MmdbWriter;
use crate::geosite::GeositeWriter;
use crate::Result;

/// Sink for deduplicated IP networks.
pub trait GeoIpEncoder {
    fn insert(&mut self, network: IpNet, label: &str) -> Result<()>;
}

/// Sink for rule items stored under a geosite code.
pub trait GeositeEncoder {
    fn push(&mut self, code: &str, item: RuleItem) -> Result<()>;
}

impl GeoIpEncoder for MmdbWriter {
    fn insert(&mut self, network: IpNet, label: &str) -> Result<()> {
        MmdbWriter::insert(self, network, label);
        Ok(())
    }
}

impl GeositeEncoder for GeositeWriter {
    fn push(&mut self, code: &str, item: RuleItem) -> Result<()> {
        GeositeWriter::push(self, code, item);
        Ok(())
    }
}

/// Result of a finished aggregator.
pub struct Aggregated<S, E> {
    pub sets: S,
    pub encoder: E,
    /// Items received, including duplicates.
    pub received: u64,
}

/// Normalized `address/prefix` keys.
#[derive(Debug, Default, Clone)]
pub struct IpSet {
    pub ip_cidrs: AHashSet<String>,
}

#[derive(Debug, Default, Clone)]
pub struct DomainSets {
    pub domains: AHashSet<String>,
    pub domain_suffixes: AHashSet<String>,
}

pub struct GeoIpAggregator<E> {
    encoder: E,
    label: String,
}

impl<E: GeoIpEncoder> GeoIpAggregator<E> {
    pub fn new(encoder: E, label: &str) -> Self {
        Self {
            encoder,
            label: label.to_string(),
        }
    }

    /// Run until the IP queue is closed. The first encoder error is returned
    /// after the queue has been fully drained.
    pub fn run(mut self, networks: Receiver<IpNet>) -> Result<Aggregated<IpSet, E>> {
        let mut sets = IpSet::default();
        let mut received = 0u64;
        let mut failure = None;

        for network in networks.iter() {
            received += 1;
            if failure.is_some() {
                continue;
            }
            if !sets.ip_cidrs.insert(network.to_string()) {
                continue;
            }
            if let Err(e) = self.encoder.insert(network, &self.label) {
                log::warn!("GeoIP encoder failed on {}, draining queue", network);
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                log::debug!(
                    "GeoIP aggregator done: {} received, {} unique",
                    received,
                    sets.ip_cidrs.len()
                );
                Ok(Aggregated {
                    sets,
                    encoder: self.encoder,
                    received,
                })
            }
        }
    }
}

pub struct GeositeAggregator<E> {
    encoder: E,
    code: String,
}

impl<E: GeositeEncoder> GeositeAggregator<E> {
    pub fn new(encoder: E, code: &str) -> Self {
        Self {
            encoder,
            code: code.to_string(),
        }
    }

    /// Run until the rule queue is closed.
    ///
    /// Every item goes to the encoder; only exact domains and suffixes are
    /// kept in the canonical sets.
    pub fn run(mut self, items: Receiver<RuleItem>) -> Result<Aggregated<DomainSets, E>> {
        let mut sets = DomainSets::default();
        let mut received = 0u64;
        let mut failure = None;

        for item in items.iter() {
            received += 1;
            if failure.is_some() {
                continue;
            }

            match &item {
                RuleItem::Domain(d) => {
                    sets.domains.insert(d.clone());
                }
                RuleItem::DomainSuffix(s) => {
                    sets.domain_suffixes.insert(s.clone());
                }
                RuleItem::DomainKeyword(v) | RuleItem::DomainRegex(v) => {
                    log::warn!("Unsupported rule item kind for ruleset: {}", v);
                }
            }

            if let Err(e) = self.encoder.push(&self.code, item) {
                log::warn!("Geosite encoder failed, draining queue");
                failure = Some(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                log::debug!(
                    "Geosite aggregator done: {} received, {} domains, {} suffixes",
                    received,
                    sets.domains.len(),
                    sets.domain_suffixes.len()
                );
                Ok(Aggregated {
                    sets,
                    encoder: self.encoder,
                    received,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crossbeam_channel::bounded;

    #[derive(Default)]
    struct Recording {
        networks: Vec<(IpNet, String)>,
        fail_after: Option<usize>,
    }

    impl GeoIpEncoder for Recording {
        fn insert(&mut self, network: IpNet, label: &str) -> Result<()> {
            if self.fail_after == Some(self.networks.len()) {
                return Err(Error::Encode("full".to_string()));
            }
            self.networks.push((network, label.to_string()));
            Ok(())
        }
    }

    impl GeositeEncoder for Vec<RuleItem> {
        fn push(&mut self, _code: &str, item: RuleItem) -> Result<()> {
            Vec::push(self, item);
            Ok(())
        }
    }

    #[test]
    fn test_geoip_deduplicates_before_encoding() {
        let (tx, rx) = bounded(4);
        let handle = std::thread::spawn(move || {
            GeoIpAggregator::new(Recording::default(), "antizapret").run(rx)
        });
        for net in ["1.2.3.4/32", "1.2.3.4/32", "5.6.7.8/24"] {
            tx.send(net.parse::<IpNet>().unwrap()).unwrap();
        }
        drop(tx);

        let out = handle.join().unwrap().unwrap();
        assert_eq!(out.received, 3);
        assert_eq!(out.sets.ip_cidrs.len(), 2);
        assert!(out.sets.ip_cidrs.contains("5.6.7.8/24"));
        assert_eq!(out.encoder.networks.len(), 2);
        assert_eq!(out.encoder.networks[0].1, "antizapret");
    }

    #[test]
    fn test_geoip_encoder_error_keeps_draining() {
        // capacity 1 so the producer would block if the aggregator stopped
        let (tx, rx) = bounded(1);
        let encoder = Recording {
            fail_after: Some(1),
            ..Default::default()
        };
        let handle = std::thread::spawn(move || GeoIpAggregator::new(encoder, "x").run(rx));
        for i in 0..50u8 {
            tx.send(IpNet::from(std::net::IpAddr::from([10, 0, 0, i]))).unwrap();
        }
        drop(tx);

        let err = handle.join().unwrap().err().unwrap();
        assert!(matches!(err, Error::Encode(_)));
    }

    #[test]
    fn test_geosite_keeps_unsupported_out_of_sets() {
        let (tx, rx) = bounded(8);
        for item in [
            RuleItem::Domain("example.com".to_string()),
            RuleItem::Domain("example.com".to_string()),
            RuleItem::DomainSuffix(".example.com".to_string()),
            RuleItem::DomainKeyword("casino".to_string()),
        ] {
            tx.send(item).unwrap();
        }
        drop(tx);

        let out = GeositeAggregator::new(Vec::new(), "antizapret").run(rx).unwrap();
        assert_eq!(out.sets.domains.len(), 1);
        assert_eq!(out.sets.domain_suffixes.len(), 1);
        assert!(!out.sets.domains.contains("casino"));
        // the encoder sees everything, duplicates included
        assert_eq!(out.encoder.len(), 4);
    }
}
