//! Backup and restore orchestration.

pub mod backup;
pub mod restore;

pub use backup::{ArchiveRecord, ArchiveSummary, BackupOptions, BackupService, BackupSettings, HousekeepingReport};
pub use restore::{RestoreReport, RestoreRequest, RestoreService, RestoreSettings, RestoreStage};

use crate::archive::Environment;
use crate::config::Config;
use crate::paths::url_host;
use std::path::PathBuf;

/// The live site the engine backs up and restores into.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    pub site_url: String,
    pub home_url: String,
    pub environment: Environment,
    pub content_dir: PathBuf,
    pub table_prefix: String,
}

impl SiteProfile {
    /// Host recorded in manifests and archive names.
    pub fn host(&self) -> String {
        url_host(&self.home_url)
            .or_else(|| url_host(&self.site_url))
            .unwrap_or_else(|| "site".to_string())
    }
}

impl From<&Config> for SiteProfile {
    fn from(config: &Config) -> Self {
        Self {
            site_url: config.site.site_url.clone(),
            home_url: config.home_url().to_string(),
            environment: config.site.environment,
            content_dir: config.site.content_dir.clone(),
            table_prefix: config.site.table_prefix.clone(),
        }
    }
}
