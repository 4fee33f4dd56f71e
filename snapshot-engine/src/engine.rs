//! Wires the services together from a [`Config`].

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{Database, SqliteDatabase};
use crate::fetch::{ArchiveFetcher, HttpFetcher};
use crate::lock::LockManager;
use crate::paths::StoragePaths;
use crate::services::{BackupService, BackupSettings, RestoreService, RestoreSettings, SiteProfile};
use crate::token::TokenStore;
use crate::transient::{SqliteTransientStore, TransientStore};
use crate::Result;
use chrono::Duration;
use std::sync::Arc;

/// Shared collaborators the services are built from.
pub struct EngineParts {
    pub db: Arc<dyn Database>,
    pub store: Arc<dyn TransientStore>,
    pub clock: Arc<dyn Clock>,
    pub fetcher: Arc<dyn ArchiveFetcher>,
}

pub struct Engine {
    config: Config,
    paths: StoragePaths,
    locks: LockManager,
    tokens: TokenStore,
    backups: Arc<BackupService>,
    restores: Arc<RestoreService>,
}

impl Engine {
    /// Open the site database and the state store named by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let paths = StoragePaths::new(&config.storage.base_dir);
        paths.ensure_directories()?;

        let parts = EngineParts {
            db: Arc::new(SqliteDatabase::open(&config.database.path)?),
            store: Arc::new(SqliteTransientStore::open(&paths.state_db())?),
            clock: Arc::new(SystemClock),
            fetcher: Arc::new(HttpFetcher::new(std::time::Duration::from_secs(
                config.restore.fetch_timeout_secs,
            ))?),
        };
        Ok(Self::with_parts(config, parts))
    }

    pub fn with_parts(config: Config, parts: EngineParts) -> Self {
        let paths = StoragePaths::new(&config.storage.base_dir);
        let site = SiteProfile::from(&config);
        let locks = LockManager::new(parts.store.clone(), parts.clock.clone());
        let tokens = TokenStore::new(parts.store, parts.clock.clone());
        let lock_ttl = seconds(config.storage.lock_ttl_secs);

        let backups = Arc::new(BackupService::new(
            parts.db.clone(),
            locks.clone(),
            tokens.clone(),
            parts.clock,
            paths.clone(),
            site.clone(),
            BackupSettings {
                lock_ttl,
                download_ttl: seconds(config.storage.download_ttl_secs),
                detail_download_ttl: seconds(config.storage.detail_download_ttl_secs),
                retention: config.storage.retention,
                public_url: config.storage.public_url.clone(),
                export: config.export_settings(),
            },
        ));

        let restores = Arc::new(RestoreService::new(
            parts.db,
            backups.clone(),
            locks.clone(),
            paths.clone(),
            site,
            RestoreSettings {
                lock_ttl,
                required_tables: config.restore.required_tables.clone(),
                replace_tables: config.restore.replace_tables.clone(),
            },
            parts.fetcher,
        ));

        Self {
            config,
            paths,
            locks,
            tokens,
            backups,
            restores,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn backups(&self) -> &Arc<BackupService> {
        &self.backups
    }

    pub fn restores(&self) -> &Arc<RestoreService> {
        &self.restores
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}
