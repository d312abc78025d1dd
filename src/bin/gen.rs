//! azrule-gen: CLI tool for generating sing-box rule files from the antizapret dump.

use azrule::geosite::GeositeReader;
use azrule::pipeline::{DEFAULT_LABEL, DEFAULT_QUEUE_CAPACITY};
use azrule::slice::{SliceReader, SliceType};
use azrule::source::remote::{DEFAULT_DUMP_URL, DEFAULT_EXCLUDE_IPS_URL};
use azrule::{Error, Generator, OutputPaths, PipelineConfig, RuleItem, RulesetDocument, RunSummary, Target};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "azrule-gen")]
#[command(version)]
#[command(about = "Generate sing-box geosite/geoip/rule-set files from the antizapret dump", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the dump and the excluded IP list, then generate
    Download {
        /// Output directory
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Dump URL
        #[arg(long, default_value = DEFAULT_DUMP_URL)]
        dump_url: String,

        /// Excluded IP list URL
        #[arg(long, default_value = DEFAULT_EXCLUDE_IPS_URL)]
        exclude_ips_url: String,

        /// HTTP timeout in seconds
        #[arg(long, default_value_t = 300)]
        timeout: u64,

        #[command(flatten)]
        generate: GenerateArgs,
    },

    /// Generate from local files
    Convert {
        /// Dump file (plain or gzip)
        #[arg(short, long)]
        input: PathBuf,

        /// Excluded IP list; none when omitted
        #[arg(long)]
        exclude_ips: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        #[command(flatten)]
        generate: GenerateArgs,
    },

    /// Check generated files and optionally look up hosts or IPs
    Verify {
        /// Directory holding the generated files
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Geosite code / geoip language to inspect
        #[arg(long, default_value = DEFAULT_LABEL)]
        label: String,

        /// Host or IP to look up (repeatable)
        #[arg(short, long = "lookup")]
        lookups: Vec<String>,
    },
}

#[derive(Args)]
struct GenerateArgs {
    /// Exclusion pattern file
    #[arg(long, default_value = "excluded.txt")]
    excluded: PathBuf,

    /// Inclusion domain file
    #[arg(long, default_value = "included.txt")]
    included: PathBuf,

    /// Classifier threads (default: available CPUs)
    #[arg(long)]
    workers: Option<usize>,

    /// Capacity of each pipeline queue
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Dump text encoding (WHATWG label)
    #[arg(long, default_value = "windows-1251")]
    encoding: String,

    /// Geosite code and geoip language
    #[arg(long, default_value = DEFAULT_LABEL)]
    label: String,

    /// Target stored in ruleset.bin
    #[arg(long, value_enum, default_value_t = Target::Proxy)]
    target: Target,
}

impl GenerateArgs {
    fn generator(&self) -> azrule::Result<Generator> {
        let mut config = PipelineConfig::default()
            .with_queue_capacity(self.queue_capacity)
            .with_label(self.label.as_str());
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }

        Ok(Generator::new()
            .with_excluded_path(&self.excluded)
            .with_included_path(&self.included)
            .with_encoding_label(&self.encoding)?
            .with_pipeline_config(config)
            .with_target(self.target))
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> azrule::Result<()> {
    match command {
        Commands::Download {
            output_dir,
            dump_url,
            exclude_ips_url,
            timeout,
            generate,
        } => {
            let summary = generate
                .generator()?
                .with_dump_url(dump_url)
                .with_exclude_ips_url(exclude_ips_url)
                .with_timeout(Duration::from_secs(timeout))
                .download_and_generate(&output_dir)?;
            print_summary(&summary, &output_dir);
        }
        Commands::Convert {
            input,
            exclude_ips,
            output_dir,
            generate,
        } => {
            let summary = generate
                .generator()?
                .convert(&input, exclude_ips.as_deref(), &output_dir)?;
            print_summary(&summary, &output_dir);
        }
        Commands::Verify {
            output_dir,
            label,
            lookups,
        } => verify(&output_dir, &label, &lookups)?,
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, output_dir: &Path) {
    println!(
        "Processed {} records ({} included, {} excluded, {} forced) in {:.1?}",
        summary.records_read,
        summary.included,
        summary.excluded,
        summary.included_hosts,
        summary.elapsed
    );
    println!(
        "  {} CIDRs, {} domains, {} suffixes",
        summary.ip_cidrs, summary.domains, summary.domain_suffixes
    );
    println!("All files generated in {:?}", output_dir);
}

fn verify(output_dir: &Path, label: &str, lookups: &[String]) -> azrule::Result<()> {
    let paths = OutputPaths::in_dir(output_dir);

    let mut geosite = GeositeReader::open(&paths.geosite)?;
    let site_items = geosite.read(label)?;
    println!("{:?}: {} items under {:?}", paths.geosite, site_items.len(), label);

    let geoip = maxminddb::Reader::open_readfile(&paths.geoip)
        .map_err(|e| Error::GeoIp(format!("cannot open {:?}: {}", paths.geoip, e)))?;
    println!(
        "{:?}: {} ({} nodes, languages {:?})",
        paths.geoip, geoip.metadata.database_type, geoip.metadata.node_count, geoip.metadata.languages
    );

    let document: RulesetDocument = serde_json::from_reader(File::open(&paths.ruleset_json)?)?;
    if let Some(rule) = document.rule() {
        println!(
            "{:?}: version {}, {} CIDRs, {} domains, {} suffixes",
            paths.ruleset_json,
            document.version,
            rule.ip_cidr.len(),
            rule.domain.len(),
            rule.domain_suffix.len()
        );
    }

    let compiled = SliceReader::open(&paths.ruleset_bin)?;
    println!(
        "{:?}: {} slices, {} exact, {} suffixes, {} v4 CIDRs, {} v6 CIDRs, fallback {}",
        paths.ruleset_bin,
        compiled.slice_count(),
        compiled.entry_count(SliceType::FstExact),
        compiled.entry_count(SliceType::FstSuffix),
        compiled.entry_count(SliceType::CidrV4),
        compiled.entry_count(SliceType::CidrV6),
        compiled.fallback()
    );

    for query in lookups {
        match query.parse::<IpAddr>() {
            Ok(ip) => {
                let in_geoip = geoip.lookup::<String>(ip).ok();
                let target = compiled.match_ip(ip).unwrap_or(compiled.fallback());
                println!("{}: geoip {:?}, ruleset {}", ip, in_geoip, target);
            }
            Err(_) => {
                let host = query.trim_end_matches('.').to_lowercase();
                let in_geosite = site_items.iter().any(|item| match item {
                    RuleItem::Domain(d) => *d == host,
                    RuleItem::DomainSuffix(s) => host.ends_with(s.as_str()),
                    _ => false,
                });
                let target = compiled.match_domain(&host).unwrap_or(compiled.fallback());
                println!("{}: geosite {}, ruleset {}", host, in_geosite, target);
            }
        }
    }
    Ok(())
}
