//! Compiled binary form of the ruleset.
//!
//! The file keeps the slice layout of a routing rule file: a fixed header, an
//! index of typed slices, then per-slice data (FST for domains, sorted arrays
//! for CIDRs).

pub mod format;
pub mod reader;
pub mod writer;

pub use format::{SliceEntry, SliceHeader, SliceType};
pub use reader::SliceReader;
pub use writer::SliceWriter;
