//! Fetching archives from a remote URL for restore.

use crate::{Result, SnapshotError};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

pub trait ArchiveFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// Blocking HTTP(S) fetcher.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("site-snapshot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SnapshotError::Download(e.to_string()))?;
        Ok(Self { client })
    }
}

impl ArchiveFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SnapshotError::InvalidArgument(format!("unsupported archive URL: {url}")));
        }

        tracing::info!(url, "Downloading remote archive");
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| SnapshotError::Download(format!("Failed to download remote archive: {e}")))?;

        if !response.status().is_success() {
            return Err(SnapshotError::Download(format!(
                "Failed to download remote archive: HTTP {} from {url}",
                response.status()
            )));
        }

        let file = File::create(dest)
            .map_err(|e| SnapshotError::io_at("Unable to store remote archive", dest, e))?;
        let mut writer = BufWriter::new(file);
        let bytes = io::copy(&mut response, &mut writer)
            .map_err(|e| SnapshotError::Download(format!("Failed to download remote archive: {e}")))?;
        writer.flush()?;

        tracing::info!(url, bytes, "Remote archive downloaded");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_non_http_urls() {
        let dir = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch("file:///etc/passwd", &dir.path().join("x.zip"))
            .unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidArgument(_)));
    }
}
