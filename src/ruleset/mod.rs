//! Ruleset assembly from the canonical sets.
//!
//! The declarative form is a sing-box source rule-set:
//!
//! ```json
//! {
//!   "version": 1,
//!   "rules": [
//!     { "ip_cidr": [...], "domain": [...], "domain_suffix": [...] }
//!   ]
//! }
//! ```
//!
//! The compiled form is a slice file (see [`crate::slice`]).

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::pipeline::CanonicalSets;
use crate::slice::SliceWriter;
use crate::{Error, Result, Target};

/// Version of the declarative ruleset document.
pub const RULESET_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetDocument {
    pub version: u32,
    pub rules: Vec<RulesetRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetRule {
    pub ip_cidr: Vec<String>,
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
}

impl RulesetDocument {
    /// Build the document with every list sorted.
    pub fn assemble(sets: &CanonicalSets) -> Self {
        Self {
            version: RULESET_VERSION,
            rules: vec![RulesetRule {
                ip_cidr: sorted(&sets.ip_cidrs),
                domain: sorted(&sets.domains),
                domain_suffix: sorted(&sets.domain_suffixes),
            }],
        }
    }

    pub fn rule(&self) -> Option<&RulesetRule> {
        self.rules.first()
    }

    /// Pretty JSON with a trailing newline.
    pub fn write_json<W: Write>(&self, mut writer: W) -> Result<()> {
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// Compile into a slice file where every rule maps to `target` and
    /// anything else falls back to `Direct`.
    pub fn compile(&self, target: Target) -> Result<Vec<u8>> {
        let mut writer = SliceWriter::new(Target::Direct);
        for rule in &self.rules {
            writer.add_exact_slice(&rule.domain, target)?;
            writer.add_suffix_slice(&rule.domain_suffix, target)?;

            let networks = rule
                .ip_cidr
                .iter()
                .map(|cidr| {
                    cidr.parse::<IpNet>()
                        .map_err(|e| Error::Encode(format!("invalid CIDR {:?}: {}", cidr, e)))
                })
                .collect::<Result<Vec<_>>>()?;
            writer.add_cidr_slices(&networks, target)?;
        }
        writer.build()
    }

    pub fn write_compiled<W: Write>(&self, mut writer: W, target: Target) -> Result<()> {
        writer.write_all(&self.compile(target)?)?;
        Ok(())
    }
}

fn sorted<'a>(set: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let mut out: Vec<String> = set.into_iter().cloned().collect();
    out.sort();
    out
}
