//! Routing target recorded in the compiled ruleset.

use std::fmt;

/// Action a router takes for traffic covered by the compiled ruleset.
///
/// Everything in the dump is blocked upstream, so generated slices default to
/// `Proxy` while unmatched traffic falls back to `Direct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
#[repr(u8)]
pub enum Target {
    Direct = 0,
    #[default]
    Proxy = 1,
    Reject = 2,
}

impl Target {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Target::Direct),
            1 => Some(Target::Proxy),
            2 => Some(Target::Reject),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Direct => "DIRECT",
            Target::Proxy => "PROXY",
            Target::Reject => "REJECT",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
