//! Concurrent classification and aggregation pipeline.
//!
//! ```text
//! source (caller) --records--> classifiers x N --networks--> geoip aggregator
//!                                    |         --rules-----> geosite aggregator
//! finalizer: inclusion items -> rules, joins classifiers, closes both queues
//! ```
//!
//! Every queue is a bounded channel closed by dropping its last sender. The
//! record queue closes when the source is exhausted (or fails); the IP and
//! rule queues close only after the finalizer has pushed the inclusion items
//! and joined every classifier.

use ahash::AHashSet;
use crossbeam_channel::bounded;
use ipnet::IpNet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::aggregate::{GeoIpAggregator, GeoIpEncoder, GeositeAggregator, GeositeEncoder};
use crate::classify::{inclusion_items, ClassifyStats, Classifier, RuleItem};
use crate::geoip::MmdbWriter;
use crate::geosite::GeositeWriter;
use crate::overrides::OverrideSet;
use crate::source::Record;
use crate::{Error, Result, StageExt};

/// Default capacity of every pipeline queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5000;

/// Default geosite code and geoip language.
pub const DEFAULT_LABEL: &str = "antizapret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Classifier threads
    pub workers: usize,
    /// Capacity of each bounded queue
    pub queue_capacity: usize,
    /// Code and language under which entries are stored
    pub label: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            label: DEFAULT_LABEL.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// The three deduplicated result sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalSets {
    pub ip_cidrs: AHashSet<String>,
    pub domains: AHashSet<String>,
    pub domain_suffixes: AHashSet<String>,
}

/// Everything a finished run hands back to the caller.
pub struct PipelineOutput<G = MmdbWriter, S = GeositeWriter> {
    pub sets: CanonicalSets,
    pub geoip: G,
    pub geosite: S,
    pub records_read: u64,
    pub included: u64,
    pub excluded: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    overrides: Arc<OverrideSet>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, overrides: Arc<OverrideSet>) -> Self {
        Self { config, overrides }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run with the standard geoip and geosite encoders.
    pub fn run<I>(&self, records: I) -> Result<PipelineOutput>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        let geoip = MmdbWriter::sing_geoip(&self.config.label)
            .with_description("Networks from the antizapret registry dump");
        self.run_with(records, geoip, GeositeWriter::new())
    }

    /// Run the pipeline on the calling thread as the record source.
    ///
    /// On any failure every thread is joined before the error is returned.
    pub fn run_with<I, G, S>(&self, records: I, geoip: G, geosite: S) -> Result<PipelineOutput<G, S>>
    where
        I: IntoIterator<Item = Result<Record>>,
        G: GeoIpEncoder + Send + 'static,
        S: GeositeEncoder + Send + 'static,
    {
        let started = Instant::now();
        let capacity = self.config.queue_capacity.max(1);
        let workers = self.config.workers.max(1);

        let (record_tx, record_rx) = bounded::<Record>(capacity);
        let (ip_tx, ip_rx) = bounded::<IpNet>(capacity);
        let (rule_tx, rule_rx) = bounded::<RuleItem>(capacity);

        let label = self.config.label.clone();
        let geoip_handle = spawn("azrule-geoip", move || {
            GeoIpAggregator::new(geoip, &label).run(ip_rx)
        })?;
        let label = self.config.label.clone();
        let geosite_handle = spawn("azrule-geosite", move || {
            GeositeAggregator::new(geosite, &label).run(rule_rx)
        })?;

        let stats = Arc::new(ClassifyStats::default());
        let classifier = Classifier::new(Arc::clone(&self.overrides), Arc::clone(&stats));
        let mut classifiers = Vec::with_capacity(workers);
        for i in 0..workers {
            let classifier = classifier.clone();
            let records = record_rx.clone();
            let ips = ip_tx.clone();
            let rules = rule_tx.clone();
            classifiers.push(spawn(&format!("azrule-classify-{}", i), move || {
                classifier.run(records, &ips, &rules)
            })?);
        }
        drop(record_rx);

        let included = self.overrides.included_domains().to_vec();
        let finalizer = spawn("azrule-finalize", move || {
            let mut failure = None;
            'push: for domain in &included {
                for item in inclusion_items(domain) {
                    if rule_tx.send(item).is_err() {
                        failure = Some(Error::Pipeline("rule queue closed before inclusion".to_string()));
                        break 'push;
                    }
                }
            }
            for handle in classifiers {
                if let Err(e) = join(handle, "classify") {
                    failure.get_or_insert(e);
                }
            }
            // last senders: closes both aggregator queues
            drop(ip_tx);
            drop(rule_tx);
            failure.map_or(Ok(()), Err)
        })?;

        let mut records_read = 0u64;
        let mut source = Ok(());
        for record in records {
            match record {
                Ok(record) => {
                    if record_tx.send(record).is_err() {
                        source = Err(Error::Pipeline("record queue closed early".to_string()));
                        break;
                    }
                    records_read += 1;
                }
                Err(e) => {
                    source = Err(e.in_stage("read dump"));
                    break;
                }
            }
        }
        drop(record_tx);

        let finalized = join(finalizer, "finalize");
        let geoip = join(geoip_handle, "aggregate IP networks").stage("encode geoip");
        let geosite = join(geosite_handle, "aggregate rules").stage("encode geosite");

        // A dead consumer surfaces upstream as a closed queue; report the cause.
        if let Err(e @ Error::Stage { .. }) = source {
            return Err(e);
        }
        let geoip = geoip?;
        let geosite = geosite?;
        finalized?;
        source?;

        let output = PipelineOutput {
            sets: CanonicalSets {
                ip_cidrs: geoip.sets.ip_cidrs,
                domains: geosite.sets.domains,
                domain_suffixes: geosite.sets.domain_suffixes,
            },
            geoip: geoip.encoder,
            geosite: geosite.encoder,
            records_read,
            included: stats.included(),
            excluded: stats.excluded(),
        };
        log::info!(
            "Pipeline finished in {:?}: {} records, {} included, {} excluded, {} workers",
            started.elapsed(),
            records_read,
            output.included,
            output.excluded,
            workers
        );
        Ok(output)
    }
}

fn spawn<T, F>(name: &str, f: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
}

fn join<T>(handle: JoinHandle<Result<T>>, stage: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| Error::Pipeline(format!("{} thread panicked", stage)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overrides::load_patterns;

    fn overrides(patterns: &str, ips: &[&str], included: &[&str]) -> Arc<OverrideSet> {
        Arc::new(OverrideSet::new(
            load_patterns(patterns.as_bytes()).unwrap(),
            ips.iter().map(|ip| ip.parse().unwrap()),
            included.iter().map(|d| d.to_string()).collect(),
        ))
    }

    fn records(rows: &[(&str, Option<&str>)]) -> Vec<Result<Record>> {
        rows.iter()
            .map(|(ips, domain)| Ok(Record::new(*ips, domain.map(str::to_string))))
            .collect()
    }

    fn set(items: &[&str]) -> AHashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_wildcard_row() {
        let pipeline = Pipeline::new(PipelineConfig::default().with_workers(3), overrides("", &[], &[]));
        let out = pipeline
            .run(records(&[("1.2.3.4|5.6.7.8/24", Some("*.example.com"))]))
            .unwrap();

        assert_eq!(out.sets.ip_cidrs, set(&["1.2.3.4/32", "5.6.7.8/24"]));
        assert_eq!(out.sets.domains, set(&["example.com"]));
        assert_eq!(out.sets.domain_suffixes, set(&[".example.com"]));
        assert_eq!(out.records_read, 1);
        assert_eq!(out.included, 1);
        assert_eq!(out.geoip.inserted(), 2);
        assert_eq!(out.geosite.item_count(DEFAULT_LABEL), 2);
    }

    #[test]
    fn test_small_queues_many_records() {
        let rows: Vec<Result<Record>> = (0..2000u32)
            .map(|i| {
                let ip = format!("10.{}.{}.1", i / 256, i % 256);
                Ok(Record::new(ip, Some(format!("d{}.example.com", i % 500))))
            })
            .collect();
        let config = PipelineConfig::default()
            .with_workers(4)
            .with_queue_capacity(1);
        let out = Pipeline::new(config, overrides("", &[], &[])).run(rows).unwrap();

        assert_eq!(out.records_read, 2000);
        assert_eq!(out.included, 2000);
        assert_eq!(out.sets.ip_cidrs.len(), 2000);
        assert_eq!(out.sets.domains.len(), 500);
    }

    #[test]
    fn test_inclusion_with_empty_source() {
        let pipeline = Pipeline::new(PipelineConfig::default(), overrides("", &[], &["extra.net"]));
        let out = pipeline.run(Vec::new()).unwrap();

        assert!(out.sets.ip_cidrs.is_empty());
        assert_eq!(out.sets.domains, set(&["extra.net"]));
        assert_eq!(out.sets.domain_suffixes, set(&[".extra.net"]));
        assert_eq!(out.records_read, 0);
    }

    #[test]
    fn test_excluded_domain_and_ip() {
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            overrides(r"^example\.com$", &["1.2.3.4"], &[]),
        );
        let out = pipeline
            .run(records(&[
                ("1.2.3.4|5.6.7.8/24", Some("example.com")),
                ("9.9.9.9", Some("other.org")),
            ]))
            .unwrap();

        assert_eq!(out.sets.ip_cidrs, set(&["5.6.7.8/24", "9.9.9.9/32"]));
        assert_eq!(out.sets.domains, set(&["other.org"]));
        assert_eq!(out.excluded, 1);
        assert_eq!(out.included, 2);
    }

    #[test]
    fn test_duplicate_records_are_idempotent() {
        let row = ("1.2.3.4", Some("*.example.com"));
        let once = Pipeline::new(PipelineConfig::default(), overrides("", &[], &[]))
            .run(records(&[row]))
            .unwrap();
        let twice = Pipeline::new(PipelineConfig::default(), overrides("", &[], &[]))
            .run(records(&[row, row]))
            .unwrap();
        assert_eq!(once.sets, twice.sets);
    }

    #[test]
    fn test_source_error_joins_and_fails() {
        let mut rows = records(&[("1.2.3.4", Some("a.com"))]);
        rows.push(Err(Error::MalformedDump { line: 2 }));
        rows.extend(records(&[("5.6.7.8", Some("b.com"))]));

        let err = Pipeline::new(PipelineConfig::default(), overrides("", &[], &[]))
            .run(rows)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Stage { stage: "read dump", .. }
        ));
        assert!(err.to_string().contains("line 2"));
    }

    struct FailingGeoIp;

    impl GeoIpEncoder for FailingGeoIp {
        fn insert(&mut self, _network: IpNet, _label: &str) -> Result<()> {
            Err(Error::Encode("disk full".to_string()))
        }
    }

    #[test]
    fn test_encoder_error_is_reported() {
        let rows: Vec<Result<Record>> = (0..100u8)
            .map(|i| Ok(Record::new(format!("10.0.0.{}", i), None)))
            .collect();
        let err = Pipeline::new(
            PipelineConfig::default().with_queue_capacity(2),
            overrides("", &[], &[]),
        )
        .run_with(rows, FailingGeoIp, GeositeWriter::new())
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "cannot encode geoip: encode error: disk full");
    }

    struct PanickingGeosite {
        pushed: usize,
    }

    impl GeositeEncoder for PanickingGeosite {
        fn push(&mut self, _code: &str, _item: RuleItem) -> Result<()> {
            self.pushed += 1;
            if self.pushed == 100 {
                panic!("geosite encoder gave up");
            }
            Ok(())
        }
    }

    #[test]
    fn test_panicking_stage_is_reported() {
        let rows: Vec<Result<Record>> = (0..5000u32)
            .map(|i| {
                let ip = format!("10.{}.{}.1", i / 256, i % 256);
                Ok(Record::new(ip, Some(format!("d{}.example.com", i))))
            })
            .collect();
        let config = PipelineConfig::default()
            .with_workers(4)
            .with_queue_capacity(2);
        let err = Pipeline::new(config, overrides("", &[], &[]))
            .run_with(rows, MmdbWriter::sing_geoip(DEFAULT_LABEL), PanickingGeosite { pushed: 0 })
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "cannot encode geosite: pipeline error: aggregate rules thread panicked"
        );
    }
}
