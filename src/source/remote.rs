//! Blocking HTTP downloads of the dump and the upstream override lists.

use std::io::Read;
use std::time::Duration;

use crate::{Error, Result};

/// Default location of the censorship dump.
pub const DEFAULT_DUMP_URL: &str = "https://raw.githubusercontent.com/zapret-info/z-i/master/dump.csv";

/// Upstream list of IPs whose hosts must not be routed.
pub const DEFAULT_EXCLUDE_IPS_URL: &str = "https://bitbucket.org/anticensority/antizapret-pac-generator-light/raw/master/config/exclude-hosts-by-ips-dist.txt";

/// Default timeout for a single download.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Thin wrapper around a blocking HTTP client.
pub struct Fetcher {
    client: reqwest::blocking::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Start a GET request and return the body as a stream.
    ///
    /// Non-success statuses are reported as errors instead of handing an
    /// error page to the parsers.
    pub fn get(&self, url: &str) -> Result<impl Read + Send + 'static> {
        log::info!("Downloading {}", url);
        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Config(format!("HTTP {} from {}", status, url)));
        }
        Ok(response)
    }
}

/// One-off download with a dedicated client.
pub fn fetch(url: &str, timeout: Duration) -> Result<impl Read + Send + 'static> {
    Fetcher::new(timeout)?.get(url)
}
