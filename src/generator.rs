//! End-to-end generation: overrides, dump, pipeline, output files.

use encoding_rs::Encoding;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::overrides::OverrideSet;
use crate::pipeline::{Pipeline, PipelineConfig, PipelineOutput};
use crate::ruleset::RulesetDocument;
use crate::source::remote::{Fetcher, DEFAULT_DUMP_URL, DEFAULT_EXCLUDE_IPS_URL, DEFAULT_TIMEOUT};
use crate::source::{open_dump, DumpReader, DEFAULT_ENCODING};
use crate::{Error, Result, StageExt, Target};

/// Default exclusion pattern file.
pub const DEFAULT_EXCLUDED_PATH: &str = "excluded.txt";

/// Default inclusion list file.
pub const DEFAULT_INCLUDED_PATH: &str = "included.txt";

/// Locations of the four generated files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub geosite: PathBuf,
    pub geoip: PathBuf,
    pub ruleset_json: PathBuf,
    pub ruleset_bin: PathBuf,
}

impl OutputPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            geosite: dir.join("geosite.db"),
            geoip: dir.join("geoip.db"),
            ruleset_json: dir.join("ruleset.json"),
            ruleset_bin: dir.join("ruleset.bin"),
        }
    }

    pub fn all(&self) -> [&Path; 4] {
        [
            &self.geosite,
            &self.geoip,
            &self.ruleset_json,
            &self.ruleset_bin,
        ]
    }
}

/// Counters of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub records_read: u64,
    pub included: u64,
    pub excluded: u64,
    /// Domains forced in by the inclusion list
    pub included_hosts: usize,
    pub ip_cidrs: usize,
    pub domains: usize,
    pub domain_suffixes: usize,
    pub elapsed: Duration,
}

/// Configured generator run.
pub struct Generator {
    dump_url: String,
    exclude_ips_url: String,
    excluded_path: PathBuf,
    included_path: PathBuf,
    encoding: &'static Encoding,
    pipeline: PipelineConfig,
    timeout: Duration,
    target: Target,
}

impl Default for Generator {
    fn default() -> Self {
        Self {
            dump_url: DEFAULT_DUMP_URL.to_string(),
            exclude_ips_url: DEFAULT_EXCLUDE_IPS_URL.to_string(),
            excluded_path: PathBuf::from(DEFAULT_EXCLUDED_PATH),
            included_path: PathBuf::from(DEFAULT_INCLUDED_PATH),
            encoding: DEFAULT_ENCODING,
            pipeline: PipelineConfig::default(),
            timeout: DEFAULT_TIMEOUT,
            target: Target::default(),
        }
    }
}

impl Generator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dump_url(mut self, url: impl Into<String>) -> Self {
        self.dump_url = url.into();
        self
    }

    pub fn with_exclude_ips_url(mut self, url: impl Into<String>) -> Self {
        self.exclude_ips_url = url.into();
        self
    }

    pub fn with_excluded_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.excluded_path = path.into();
        self
    }

    pub fn with_included_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.included_path = path.into();
        self
    }

    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Select the dump encoding by WHATWG label, e.g. `windows-1251`.
    pub fn with_encoding_label(self, label: &str) -> Result<Self> {
        let encoding = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| Error::Config(format!("unknown encoding: {}", label)))?;
        Ok(self.with_encoding(encoding))
    }

    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Target stored in the compiled ruleset.
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Download the excluded IP list and the dump, then generate.
    pub fn download_and_generate(&self, output_dir: &Path) -> Result<RunSummary> {
        let fetcher = Fetcher::new(self.timeout)?;

        let excluded_ips = fetcher
            .get(&self.exclude_ips_url)
            .stage("download excluded IPs")?;
        let overrides = OverrideSet::load(
            &self.excluded_path,
            &self.included_path,
            BufReader::new(excluded_ips),
        )?;

        let dump = fetcher.get(&self.dump_url).stage("download dump")?;
        self.generate_from_reader(dump, overrides, &OutputPaths::in_dir(output_dir))
    }

    /// Generate from a local dump and an optional local excluded IP list.
    pub fn convert(
        &self,
        dump_path: &Path,
        exclude_ips_path: Option<&Path>,
        output_dir: &Path,
    ) -> Result<RunSummary> {
        let excluded_ips: Box<dyn BufRead> = match exclude_ips_path {
            Some(path) => Box::new(BufReader::new(
                File::open(path).stage("open excluded IPs")?,
            )),
            None => Box::new(io::empty()),
        };
        let overrides = OverrideSet::load(&self.excluded_path, &self.included_path, excluded_ips)?;

        let dump = File::open(dump_path).stage("open dump")?;
        self.generate_from_reader(dump, overrides, &OutputPaths::in_dir(output_dir))
    }

    /// Run the pipeline over `dump` and write every output.
    ///
    /// Nothing is written unless the whole pipeline succeeded.
    pub fn generate_from_reader<D: Read + 'static>(
        &self,
        dump: D,
        overrides: OverrideSet,
        outputs: &OutputPaths,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let included_hosts = overrides.included_domains().len();

        let decoded = open_dump(dump, self.encoding).stage("open dump")?;
        let mut reader = DumpReader::new(decoded);
        let pipeline = Pipeline::new(self.pipeline.clone(), Arc::new(overrides));
        let output = pipeline.run(reader.by_ref())?;

        self.write_outputs(&output, outputs)?;

        let summary = RunSummary {
            records_read: output.records_read,
            included: output.included,
            excluded: output.excluded,
            included_hosts,
            ip_cidrs: output.sets.ip_cidrs.len(),
            domains: output.sets.domains.len(),
            domain_suffixes: output.sets.domain_suffixes.len(),
            elapsed: started.elapsed(),
        };
        log::info!(
            "Generated in {:?}: {} records ({} included, {} excluded), {} CIDRs, {} domains, {} suffixes",
            summary.elapsed,
            summary.records_read,
            summary.included,
            summary.excluded,
            summary.ip_cidrs,
            summary.domains,
            summary.domain_suffixes
        );
        Ok(summary)
    }

    fn write_outputs(&self, output: &PipelineOutput, paths: &OutputPaths) -> Result<()> {
        let document = RulesetDocument::assemble(&output.sets);
        let compiled = document.compile(self.target).stage("compile ruleset")?;

        for path in paths.all() {
            if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
        }

        write_atomic(&paths.geosite, |w| output.geosite.write_to(w)).stage("write geosite.db")?;
        write_atomic(&paths.geoip, |w| output.geoip.write_to(w)).stage("write geoip.db")?;
        write_atomic(&paths.ruleset_json, |w| document.write_json(w)).stage("write ruleset.json")?;
        write_atomic(&paths.ruleset_bin, |w| Ok(w.write_all(&compiled)?))
            .stage("write ruleset.bin")?;

        for path in paths.all() {
            log::info!("Wrote {:?}", path);
        }
        Ok(())
    }
}

/// Write through a temporary sibling file, then rename into place.
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let result = File::create(&temp).map_err(Error::from).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush()?;
        Ok(())
    });

    match result {
        Ok(()) => {
            fs::rename(&temp, path)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&temp);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_paths() {
        let paths = OutputPaths::in_dir("/out");
        assert_eq!(paths.geosite, PathBuf::from("/out/geosite.db"));
        assert_eq!(paths.ruleset_bin, PathBuf::from("/out/ruleset.bin"));
        assert_eq!(paths.all().len(), 4);
    }

    #[test]
    fn test_builder_defaults() {
        let generator = Generator::new();
        assert_eq!(generator.dump_url, DEFAULT_DUMP_URL);
        assert_eq!(generator.excluded_path, PathBuf::from("excluded.txt"));
        assert_eq!(generator.timeout, Duration::from_secs(300));
        assert_eq!(generator.encoding, encoding_rs::WINDOWS_1251);

        let generator = generator
            .with_dump_url("http://localhost/dump.csv")
            .with_timeout(Duration::from_secs(5))
            .with_pipeline_config(PipelineConfig::default().with_workers(2));
        assert_eq!(generator.dump_url, "http://localhost/dump.csv");
        assert_eq!(generator.pipeline.workers, 2);
    }

    #[test]
    fn test_encoding_label() {
        let generator = Generator::new().with_encoding_label("utf-8").unwrap();
        assert_eq!(generator.encoding, encoding_rs::UTF_8);
        assert!(Generator::new().with_encoding_label("klingon").is_err());
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let err = write_atomic(&path, |_| Err(Error::Encode("boom".to_string())));
        assert!(err.is_err());
        assert!(!path.exists());
        assert!(!dir.path().join("out.bin.tmp").exists());
    }
}
