//! azrule - routing rule generator for the antizapret censorship dump.
//!
//! The crate turns the registry dump (one `;`-separated row per blocked
//! resource) into deduplicated rule sets and writes them as:
//!
//! - `geosite.db`: sing-box geosite database with a single code
//! - `geoip.db`: sing-box geoip (MaxMind DB) database with a single code
//! - `ruleset.json`: sing-box source rule-set
//! - `ruleset.bin`: compiled slice file for fast local matching. This is the
//!   crate's own format, not a sing-box `.srs` rule-set, so sing-box cannot
//!   load it; compile `ruleset.json` with `sing-box rule-set compile` for that.
//!
//! # Quick Start
//!
//! ```ignore
//! use azrule::Generator;
//! use std::path::Path;
//!
//! let summary = Generator::new()
//!     .with_excluded_path("excluded.txt")
//!     .with_included_path("included.txt")
//!     .download_and_generate(Path::new("output"))?;
//! println!("{} domains", summary.domains);
//! ```
//!
//! # Pipeline
//!
//! Records are parsed on the calling thread and fanned out to a pool of
//! classifier threads over bounded channels. Classifiers apply the overrides
//! and feed two single-consumer aggregators (networks and rules), which own
//! the canonical sets and hand them back when joined. See [`pipeline`].
//!
//! # Overrides
//!
//! - exclusion patterns: one regex per line; matching domains are dropped
//! - excluded IPs: exact addresses dropped from the IP list
//! - included domains: always emitted as a domain and a `.domain` suffix

mod error;
mod target;

pub mod aggregate;
pub mod classify;
pub mod generator;
pub mod geoip;
pub mod geosite;
pub mod overrides;
pub mod pipeline;
pub mod ruleset;
pub mod slice;
pub mod source;

// Re-export core types
pub use error::{Error, Result, StageExt};
pub use target::Target;

pub use classify::RuleItem;
pub use generator::{Generator, OutputPaths, RunSummary};
pub use overrides::OverrideSet;
pub use pipeline::{CanonicalSets, Pipeline, PipelineConfig, PipelineOutput};
pub use ruleset::RulesetDocument;
pub use source::{DumpReader, Record};
