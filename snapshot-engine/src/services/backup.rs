//! Backup orchestration: dump, archive, manifest, token, retention.

use super::SiteProfile;
use crate::archive::{
    checksum_file, ArchiveReader, ArchiveWriter, Manifest, CONTENT_PREFIX, DATABASE_ENTRY, MANIFEST_ENTRY,
};
use crate::clock::Clock;
use crate::db::Database;
use crate::export::{ExportSettings, Exporter};
use crate::lock::{LockManager, OperationKind};
use crate::paths::StoragePaths;
use crate::token::TokenStore;
use crate::{Result, SnapshotError};
use chrono::Duration;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_LABEL: &str = "full-site";
pub const SAFETY_LABEL: &str = "pre-restore";

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub label: String,
    pub include_files: bool,
    pub include_database: bool,
    /// Archives to keep afterwards. `None` uses the configured default,
    /// `Some(0)` disables pruning.
    pub retention: Option<usize>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            include_files: true,
            include_database: true,
            retention: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub lock_ttl: Duration,
    pub download_ttl: Duration,
    pub detail_download_ttl: Duration,
    pub retention: usize,
    pub public_url: String,
    pub export: ExportSettings,
}

/// Result of a backup or a detail lookup: the manifest plus what was
/// computed over the finished file.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveSummary {
    #[serde(flatten)]
    pub manifest: Manifest,
    pub checksum: String,
    pub filesize: u64,
    pub path: PathBuf,
    pub download_token: String,
    pub download_url: String,
}

/// One entry of the archive listing.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    #[serde(flatten)]
    pub manifest: Manifest,
    pub filesize: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HousekeepingReport {
    pub tokens_purged: usize,
    pub archives_pruned: usize,
    pub temp_entries_removed: usize,
    /// Retention and temp cleanup are skipped while an operation holds the lock.
    pub skipped_busy: bool,
}

pub struct BackupService {
    db: Arc<dyn Database>,
    locks: LockManager,
    tokens: TokenStore,
    clock: Arc<dyn Clock>,
    paths: StoragePaths,
    site: SiteProfile,
    settings: BackupSettings,
    exporter: Exporter,
}

impl BackupService {
    pub fn new(
        db: Arc<dyn Database>,
        locks: LockManager,
        tokens: TokenStore,
        clock: Arc<dyn Clock>,
        paths: StoragePaths,
        site: SiteProfile,
        settings: BackupSettings,
    ) -> Self {
        let exporter = Exporter::new(&settings.export);
        Self {
            db,
            locks,
            tokens,
            clock,
            paths,
            site,
            settings,
            exporter,
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Create an archive under the backup lock, then prune to the retention
    /// limit before releasing it.
    pub fn create(&self, options: &BackupOptions) -> Result<ArchiveSummary> {
        if !options.include_files && !options.include_database {
            tracing::warn!("Backup failed - no content selected");
            return Err(SnapshotError::InvalidArgument(
                "Nothing to backup. Enable files and/or database.".into(),
            ));
        }

        let lock = self.locks.acquire(OperationKind::Backup, self.settings.lock_ttl)?;
        let summary = self.create_unlocked(options)?;

        let retention = options.retention.unwrap_or(self.settings.retention);
        tracing::info!(retention_limit = retention, "Enforcing retention policy");
        if let Err(e) = self.enforce_retention(retention) {
            tracing::warn!(error = %e, "Retention pruning failed");
        }

        if let Err(e) = lock.release() {
            tracing::warn!(error = %e, "Backup created but the lock could not be released");
        }
        Ok(summary)
    }

    /// Build the archive without touching the lock. The caller must already
    /// hold an operation lock.
    pub(crate) fn create_unlocked(&self, options: &BackupOptions) -> Result<ArchiveSummary> {
        if !options.include_files && !options.include_database {
            return Err(SnapshotError::InvalidArgument(
                "Nothing to backup. Enable files and/or database.".into(),
            ));
        }
        self.paths.ensure_directories()?;

        let now = self.clock.now();
        let label = if options.label.trim().is_empty() {
            DEFAULT_LABEL
        } else {
            options.label.as_str()
        };
        let host = self.site.host();
        let archive_path = self
            .paths
            .unique_archive_path(now, &host, self.site.environment, label);
        let id = archive_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut manifest = Manifest {
            id,
            label: label.to_string(),
            created_at_gmt: now,
            site_url: self.site.site_url.clone(),
            home_url: self.site.home_url.clone(),
            origin_host: host,
            environment: self.site.environment,
            table_prefix: self.site.table_prefix.clone(),
            include_files: options.include_files,
            include_database: options.include_database,
            tables: Vec::new(),
            engine_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };

        tracing::info!(
            label = %manifest.label,
            archive = %manifest.id,
            include_database = options.include_database,
            include_files = options.include_files,
            environment = %manifest.environment,
            "Backup started"
        );

        let mut writer = ArchiveWriter::create(&archive_path)?;

        if options.include_database {
            let scratch = self.paths.scratch("dump")?;
            let dump_path = scratch.path().join(DATABASE_ENTRY);
            manifest.tables = self.exporter.export_to_file(self.db.as_ref(), &dump_path)?;
            let sql_bytes = fs::metadata(&dump_path).map(|m| m.len()).unwrap_or(0);
            writer.add_file(DATABASE_ENTRY, &dump_path)?;
            tracing::info!(num_tables = manifest.tables.len(), sql_bytes, "Database dumped");
        }

        if options.include_files {
            tracing::info!(source_dir = %self.site.content_dir.display(), "Starting file archiving");
            writer.add_directory(&self.site.content_dir, CONTENT_PREFIX, Some(self.paths.base_dir()))?;
        }

        writer.add_bytes(MANIFEST_ENTRY, &manifest.to_json()?)?;
        let path = writer.finish()?;

        let checksum = checksum_file(&path)?;
        let filesize = fs::metadata(&path)?.len();
        let download_token = self.tokens.issue(&path, self.settings.download_ttl)?;
        let download_url = self.download_url(&download_token);

        tracing::info!(
            archive = %manifest.id,
            bytes = filesize,
            checksum = %checksum,
            num_tables = manifest.tables.len(),
            "Backup completed successfully"
        );

        Ok(ArchiveSummary {
            manifest,
            checksum,
            filesize,
            path,
            download_token,
            download_url,
        })
    }

    pub fn download_url(&self, token: &str) -> String {
        format!(
            "{}/download?token={token}",
            self.settings.public_url.trim_end_matches('/')
        )
    }

    /// Every readable archive, newest first by creation time.
    pub fn list_archives(&self) -> Result<Vec<ArchiveRecord>> {
        let dir = self.paths.archives_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("zip") || !path.is_file() {
                continue;
            }
            let manifest = match self.read_manifest(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::debug!(archive = %path.display(), error = %e, "Skipping unreadable archive");
                    continue;
                }
            };
            let filesize = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            records.push(ArchiveRecord {
                manifest,
                filesize,
                checksum: None,
                path,
            });
        }

        records.sort_by(|a, b| {
            b.manifest
                .created_at_gmt
                .cmp(&a.manifest.created_at_gmt)
                .then_with(|| b.manifest.id.cmp(&a.manifest.id))
        });
        Ok(records)
    }

    /// Manifest of the archive at `path`, with the id defaulted to the file stem.
    pub fn read_manifest(&self, path: &Path) -> Result<Manifest> {
        let mut manifest = ArchiveReader::open(path)?.read_manifest()?;
        if manifest.id.is_empty() {
            manifest.id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(manifest)
    }

    /// Path of the archive with this id, when it exists inside the archives
    /// directory.
    pub fn resolve_id(&self, id: &str) -> Option<PathBuf> {
        let id = id.trim().trim_end_matches(".zip");
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.starts_with('.');
        if !safe {
            return None;
        }
        self.validate_path(&self.paths.archives_dir().join(format!("{id}.zip")))
    }

    /// Resolve symlinks and accept the path only if it exists and stays
    /// inside the archives directory. Relative paths are taken relative to
    /// the archives directory.
    pub fn validate_path(&self, path: &Path) -> Option<PathBuf> {
        let archives = self.paths.archives_dir().canonicalize().ok()?;
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            archives.join(path)
        };
        let real = candidate.canonicalize().ok()?;
        (real.starts_with(&archives) && real != archives && real.is_file()).then_some(real)
    }

    pub fn detail(&self, id: &str) -> Result<ArchiveSummary> {
        let path = self
            .resolve_id(id)
            .ok_or_else(|| SnapshotError::ArchiveNotFound(id.to_string()))?;
        let manifest = self.read_manifest(&path)?;
        let checksum = checksum_file(&path)?;
        let filesize = fs::metadata(&path)?.len();
        let download_token = self.tokens.issue(&path, self.settings.detail_download_ttl)?;
        let download_url = self.download_url(&download_token);
        Ok(ArchiveSummary {
            manifest,
            checksum,
            filesize,
            path,
            download_token,
            download_url,
        })
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        match self.resolve_id(id) {
            Some(path) => self.delete_by_path(&path, "Backup deleted"),
            None => Ok(false),
        }
    }

    pub fn delete_by_path(&self, path: &Path, reason: &str) -> Result<bool> {
        let Some(path) = self.validate_path(path) else {
            return Ok(false);
        };
        fs::remove_file(&path).map_err(|e| SnapshotError::io_at("Unable to delete archive", &path, e))?;
        tracing::info!(archive = %path.display(), "{reason}");
        Ok(true)
    }

    /// Store an archive obtained elsewhere under a fresh name. Archives
    /// without a valid manifest are removed again.
    pub fn ingest(&self, file: &Path, label: &str) -> Result<ArchiveRecord> {
        if !file.is_file() {
            return Err(SnapshotError::ArchiveNotFound(file.display().to_string()));
        }
        self.paths.ensure_directories()?;
        let dest = self.paths.unique_archive_path(
            self.clock.now(),
            &self.site.host(),
            self.site.environment,
            label,
        );
        fs::copy(file, &dest).map_err(|e| SnapshotError::io_at("Failed to store imported archive", &dest, e))?;

        let manifest = match self.read_manifest(&dest) {
            Ok(manifest) => manifest,
            Err(e) => {
                let _ = fs::remove_file(&dest);
                return Err(SnapshotError::Manifest(format!("Imported archive manifest invalid: {e}")));
            }
        };
        let filesize = fs::metadata(&dest)?.len();
        let checksum = checksum_file(&dest)?;

        tracing::info!(archive = %dest.display(), source = %file.display(), "Backup ingested");
        Ok(ArchiveRecord {
            manifest,
            filesize,
            checksum: Some(checksum),
            path: dest,
        })
    }

    /// Delete archives beyond the newest `limit`, oldest first. Returns the
    /// removed paths.
    pub fn enforce_retention(&self, limit: usize) -> Result<Vec<PathBuf>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let archives = self.list_archives()?;
        if archives.len() <= limit {
            tracing::info!(current_count = archives.len(), limit, "Retention check - no pruning needed");
            return Ok(Vec::new());
        }

        tracing::info!(
            total_archives = archives.len(),
            retention_limit = limit,
            archives_to_remove = archives.len() - limit,
            "Pruning archives"
        );
        let mut removed = Vec::new();
        for record in archives[limit..].iter().rev() {
            if self.delete_by_path(&record.path, "Backup pruned by retention policy")? {
                removed.push(record.path.clone());
            }
        }
        Ok(removed)
    }

    /// Periodic maintenance: purge expired tokens, prune to the default
    /// retention and empty the temp directory.
    pub fn housekeeping(&self) -> Result<HousekeepingReport> {
        tracing::info!("Starting housekeeping");
        let mut report = HousekeepingReport {
            tokens_purged: self.tokens.purge_expired()?,
            ..HousekeepingReport::default()
        };

        if let Some(marker) = self.locks.current()? {
            tracing::info!(operation = %marker.kind, "Operation in progress, skipping retention and temp cleanup");
            report.skipped_busy = true;
            return Ok(report);
        }

        report.archives_pruned = self.enforce_retention(self.settings.retention)?.len();
        report.temp_entries_removed = self.paths.cleanup_temp()?;
        tracing::info!(
            tokens_purged = report.tokens_purged,
            archives_pruned = report.archives_pruned,
            temp_entries_removed = report.temp_entries_removed,
            "Housekeeping completed"
        );
        Ok(report)
    }

    /// Redeem a download token. The token is spent whatever the outcome.
    pub fn redeem_download(&self, token: &str) -> Result<Option<PathBuf>> {
        let Some(payload) = self.tokens.consume(token)? else {
            return Ok(None);
        };
        Ok(self.validate_path(&payload.path))
    }
}
