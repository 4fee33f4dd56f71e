//! Configuration for the snapshot engine.
//!
//! Loads configuration from a TOML file with `SNAPSHOT_*` environment
//! variable overrides (a `.env` file is honoured).

use crate::archive::Environment;
use crate::export::ExportSettings;
use crate::{Result, SnapshotError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub site: SiteConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub export: ExportConfig,
    pub restore: RestoreConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Base URL the site answers on
    pub site_url: String,

    /// Public home URL (usually the same as `site_url`)
    pub home_url: String,

    /// local, staging or live
    pub environment: Environment,

    /// Content directory archived alongside the database
    pub content_dir: PathBuf,

    /// Table-name prefix of the live installation
    pub table_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of archives/, logs/, temp/ and state.db
    pub base_dir: PathBuf,

    /// Archives kept after each backup (0 disables pruning)
    pub retention: usize,

    /// Seconds before an abandoned operation lock goes stale
    pub lock_ttl_secs: u64,

    /// Lifetime of the download token issued for a new backup
    pub download_ttl_secs: u64,

    /// Lifetime of the download token issued when viewing a backup
    pub detail_download_ttl_secs: u64,

    /// Externally reachable base URL for download links
    pub public_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Rows per INSERT batch (minimum 50)
    pub chunk_size: usize,

    /// Try the native dump tool before the streaming dump
    pub native_dump: bool,

    /// Native dump tool binary
    pub native_tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Tables (without prefix) that must exist after a database import
    pub required_tables: Vec<String>,

    /// Tables (without prefix) searched for the old base URL
    pub replace_tables: Vec<String>,

    /// Timeout for fetching a remote archive
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Also write daily log files under <base_dir>/logs
    pub file: bool,
}

fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Default for SiteConfig {
    fn default() -> Self {
        let url = format!("http://{}", default_host());
        Self {
            site_url: url.clone(),
            home_url: url,
            environment: Environment::Live,
            content_dir: PathBuf::from("content"),
            table_prefix: "wp_".to_string(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("site.db"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("content/site-snapshots"),
            retention: 10,
            lock_ttl_secs: 3600,
            download_ttl_secs: 86_400,
            detail_download_ttl_secs: 3600,
            public_url: "http://localhost:8080".to_string(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        let settings = ExportSettings::default();
        Self {
            chunk_size: settings.chunk_size,
            native_dump: settings.native_dump,
            native_tool: settings.native_tool,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            required_tables: ["options", "users", "usermeta", "posts", "postmeta"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            replace_tables: crate::replace::DEFAULT_REPLACE_TABLES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            fetch_timeout_secs: 300,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SnapshotError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| SnapshotError::Config(format!("invalid {}: {e}", path.display())))
    }

    /// File (or defaults), then `.env`, then `SNAPSHOT_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SNAPSHOT_SITE_URL") {
            self.site.site_url = v;
        }
        if let Some(v) = lookup("SNAPSHOT_HOME_URL") {
            self.site.home_url = v;
        }
        if let Some(v) = lookup("SNAPSHOT_ENVIRONMENT") {
            self.site.environment = v.parse()?;
        }
        if let Some(v) = lookup("SNAPSHOT_CONTENT_DIR") {
            self.site.content_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SNAPSHOT_TABLE_PREFIX") {
            self.site.table_prefix = v;
        }
        if let Some(v) = lookup("SNAPSHOT_DATABASE_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SNAPSHOT_STORAGE_DIR") {
            self.storage.base_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SNAPSHOT_RETENTION") {
            self.storage.retention = parse_env("SNAPSHOT_RETENTION", &v)?;
        }
        if let Some(v) = lookup("SNAPSHOT_PUBLIC_URL") {
            self.storage.public_url = v;
        }
        if let Some(v) = lookup("SNAPSHOT_NATIVE_DUMP") {
            self.export.native_dump = parse_env("SNAPSHOT_NATIVE_DUMP", &v)?;
        }
        if let Some(v) = lookup("SNAPSHOT_LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.site.site_url.trim().is_empty() {
            return Err(SnapshotError::Config("site.site_url must not be empty".into()));
        }
        if self.storage.lock_ttl_secs == 0 {
            return Err(SnapshotError::Config("storage.lock_ttl_secs must be positive".into()));
        }
        if self.storage.base_dir.as_os_str().is_empty() {
            return Err(SnapshotError::Config("storage.base_dir must not be empty".into()));
        }
        Ok(())
    }

    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            chunk_size: self.export.chunk_size,
            native_dump: self.export.native_dump,
            native_tool: self.export.native_tool.clone(),
        }
    }

    /// Home URL, falling back to the site URL when unset.
    pub fn home_url(&self) -> &str {
        if self.site.home_url.is_empty() {
            &self.site.site_url
        } else {
            &self.site.home_url
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SnapshotError::Config(format!("{key} has an invalid value '{value}'")))
}
