//! Error types for azrule.

use thiserror::Error;

/// Error type for azrule operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid binary file magic bytes
    #[error("invalid magic bytes: expected AZRULES1 header")]
    InvalidMagic,

    /// Unsupported binary format version
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Invalid header size
    #[error("invalid header size: expected {expected}, got {actual}")]
    InvalidHeaderSize { expected: usize, actual: usize },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV decoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Exclusion pattern that does not compile
    #[error("invalid exclusion pattern on line {line} ({pattern:?}): {source}")]
    InvalidPattern {
        line: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Short record after the header or after valid data
    #[error("malformed dump: record on line {line} has fewer than 2 fields")]
    MalformedDump { line: u64 },

    /// A pipeline thread failed
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Encoder failure
    #[error("encode error: {0}")]
    Encode(String),

    /// GeoIP database error
    #[error("GeoIP error: {0}")]
    GeoIp(String),

    /// GeoSite database error
    #[error("GeoSite error: {0}")]
    GeoSite(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Download error
    #[error("download error: {0}")]
    Download(#[from] reqwest::Error),

    /// Fatal error annotated with the stage that produced it
    #[error("cannot {stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the name of the failing stage.
    pub fn in_stage(self, stage: &'static str) -> Self {
        Error::Stage {
            stage,
            source: Box::new(self),
        }
    }
}

/// Result type alias for azrule operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension for annotating results with a stage name.
pub trait StageExt<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| e.into().in_stage(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_message_names_stage() {
        let err: Result<()> = Err(Error::MalformedDump { line: 7 });
        let msg = err.stage("parse dump").unwrap_err().to_string();
        assert!(msg.starts_with("cannot parse dump:"));
        assert!(msg.contains("line 7"));
    }
}
