//! Restore orchestration with safety-snapshot rollback.
//!
//! A restore walks `Idle -> LockAcquired -> SafetyBackupTaken -> Extracted
//! -> DatabaseImported -> FilesRestored -> Committed`. Any failure after the
//! lock is taken replays the safety snapshot, when one was captured, and the
//! error reports whether that replay worked.

use super::backup::{BackupOptions, BackupService, SAFETY_LABEL};
use super::SiteProfile;
use crate::archive::{copy_directory, ArchiveReader, Manifest, CONTENT_PREFIX, DATABASE_ENTRY};
use crate::db::Database;
use crate::fetch::ArchiveFetcher;
use crate::import::Importer;
use crate::lock::{LockManager, OperationKind};
use crate::paths::StoragePaths;
use crate::replace::UrlReplacer;
use crate::{Result, SnapshotError};
use chrono::Duration;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const REMOTE_LABEL: &str = "remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    Idle,
    LockAcquired,
    SafetyBackupTaken,
    Extracted,
    DatabaseImported,
    FilesRestored,
    Committed,
    RollingBack,
}

impl fmt::Display for RestoreStage {
    /// Names the step that leads into the stage.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreStage::Idle => "startup",
            RestoreStage::LockAcquired => "lock acquisition",
            RestoreStage::SafetyBackupTaken => "safety backup",
            RestoreStage::Extracted => "archive extraction",
            RestoreStage::DatabaseImported => "database import",
            RestoreStage::FilesRestored => "file restore",
            RestoreStage::Committed => "commit",
            RestoreStage::RollingBack => "rollback",
        })
    }
}

/// Where to restore from. Exactly one source is used, checked in the order
/// path, id, URL.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub archive_path: Option<PathBuf>,
    pub archive_id: Option<String>,
    pub source_url: Option<String>,
    pub drop_tables: bool,
    pub safety_backup: bool,
    /// Label given to a fetched archive.
    pub label: Option<String>,
}

impl Default for RestoreRequest {
    fn default() -> Self {
        Self {
            archive_path: None,
            archive_id: None,
            source_url: None,
            drop_tables: true,
            safety_backup: true,
            label: None,
        }
    }
}

impl RestoreRequest {
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            archive_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            source_url: Some(url.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    pub lock_ttl: Duration,
    /// Tables, without prefix, that must exist after a database import.
    pub required_tables: Vec<String>,
    /// Tables, without prefix, searched for the old base URL.
    pub replace_tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// Manifest of the restored archive, with the prefix and table names as
    /// they are in the live database now.
    pub manifest: Manifest,
    pub archive: PathBuf,
    pub safety_snapshot: Option<PathBuf>,
    pub stages: Vec<RestoreStage>,
    pub statements_executed: usize,
    pub tables_renamed: usize,
    pub url_replacements: usize,
    pub rows_updated: usize,
    pub maintenance_failures: usize,
    /// Set when the content tree could not be copied. The database import
    /// is kept regardless.
    pub files_error: Option<String>,
}

impl RestoreReport {
    fn new(manifest: Manifest, archive: &Path, safety_snapshot: Option<PathBuf>) -> Self {
        Self {
            manifest,
            archive: archive.to_path_buf(),
            safety_snapshot,
            stages: Vec::new(),
            statements_executed: 0,
            tables_renamed: 0,
            url_replacements: 0,
            rows_updated: 0,
            maintenance_failures: 0,
            files_error: None,
        }
    }
}

/// Progress of the apply step, kept outside it so a failure can be
/// classified after the fact.
struct Progress {
    stage: RestoreStage,
    modified: bool,
    stages: Vec<RestoreStage>,
}

impl Progress {
    fn enter(&mut self, stage: RestoreStage) {
        self.stage = stage;
    }

    fn reached(&mut self, stage: RestoreStage) {
        self.stage = stage;
        self.stages.push(stage);
    }
}

pub struct RestoreService {
    db: Arc<dyn Database>,
    backups: Arc<BackupService>,
    locks: LockManager,
    paths: StoragePaths,
    site: SiteProfile,
    settings: RestoreSettings,
    fetcher: Arc<dyn ArchiveFetcher>,
}

impl RestoreService {
    pub fn new(
        db: Arc<dyn Database>,
        backups: Arc<BackupService>,
        locks: LockManager,
        paths: StoragePaths,
        site: SiteProfile,
        settings: RestoreSettings,
        fetcher: Arc<dyn ArchiveFetcher>,
    ) -> Self {
        Self {
            db,
            backups,
            locks,
            paths,
            site,
            settings,
            fetcher,
        }
    }

    pub fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let lock = self.locks.acquire(OperationKind::Restore, self.settings.lock_ttl)?;
        let mut progress = Progress {
            stage: RestoreStage::LockAcquired,
            modified: false,
            stages: vec![RestoreStage::LockAcquired],
        };

        let archive = self.resolve_archive(request)?;
        tracing::info!(
            archive = %archive.display(),
            drop_tables = request.drop_tables,
            safety_backup = request.safety_backup,
            "Restore started"
        );

        let safety_snapshot = if request.safety_backup {
            progress.enter(RestoreStage::SafetyBackupTaken);
            // An empty database has nothing to dump; rollback then just drops
            // whatever the failed import created.
            let has_tables = match self.db.list_tables(None) {
                Ok(tables) => !tables.is_empty(),
                Err(e) => return Err(SnapshotError::SafetyBackupFailed { source: Box::new(e.into()) }),
            };
            let options = BackupOptions {
                label: SAFETY_LABEL.to_string(),
                include_files: true,
                include_database: has_tables,
                retention: Some(0),
            };
            match self.backups.create_unlocked(&options) {
                Ok(summary) => {
                    tracing::info!(safety_backup = %summary.path.display(), "Safety backup created");
                    progress.reached(RestoreStage::SafetyBackupTaken);
                    Some(summary.path)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Safety backup failed, restore aborted");
                    return Err(SnapshotError::SafetyBackupFailed { source: Box::new(e) });
                }
            }
        } else {
            None
        };

        match self.apply(&archive, request.drop_tables, &mut progress) {
            Ok(mut report) => {
                progress.reached(RestoreStage::Committed);
                report.safety_snapshot = safety_snapshot;
                report.stages = progress.stages;
                tracing::info!(
                    archive = %archive.display(),
                    statements = report.statements_executed,
                    url_replacements = report.url_replacements,
                    maintenance_failures = report.maintenance_failures,
                    files_restored = report.files_error.is_none(),
                    "Restore completed successfully"
                );
                if let Err(e) = lock.release() {
                    tracing::warn!(error = %e, "Restore committed but the lock could not be released");
                }
                Ok(report)
            }
            Err(e) => Err(self.fail(e, &progress, safety_snapshot)),
        }
    }

    fn resolve_archive(&self, request: &RestoreRequest) -> Result<PathBuf> {
        if let Some(path) = &request.archive_path {
            return self
                .backups
                .validate_path(path)
                .ok_or_else(|| SnapshotError::ArchiveNotFound(path.display().to_string()));
        }
        if let Some(id) = &request.archive_id {
            return self
                .backups
                .resolve_id(id)
                .ok_or_else(|| SnapshotError::ArchiveNotFound(id.clone()));
        }
        if let Some(url) = &request.source_url {
            let scratch = self.paths.scratch("download")?;
            let download = scratch.path().join("remote.zip");
            self.fetcher.fetch(url, &download)?;
            let label = request.label.as_deref().unwrap_or(REMOTE_LABEL);
            return Ok(self.backups.ingest(&download, label)?.path);
        }
        Err(SnapshotError::InvalidArgument(
            "No archive selected. Give an archive path, id or source URL.".into(),
        ))
    }

    fn apply(&self, archive: &Path, drop_tables: bool, progress: &mut Progress) -> Result<RestoreReport> {
        progress.enter(RestoreStage::Extracted);
        let scratch = self.paths.scratch("restore")?;
        let mut reader = ArchiveReader::open(archive)?;
        let manifest = reader.read_manifest()?;
        reader.verify_payloads(&manifest)?;
        let extracted = reader.extract(scratch.path())?;
        tracing::info!(files = extracted, "Archive extracted");
        progress.reached(RestoreStage::Extracted);

        let mut report = RestoreReport::new(manifest, archive, None);

        if report.manifest.include_database {
            progress.enter(RestoreStage::DatabaseImported);
            progress.modified = true;
            self.restore_database(&scratch.path().join(DATABASE_ENTRY), drop_tables, &mut report)?;
            progress.reached(RestoreStage::DatabaseImported);
        }

        if report.manifest.include_files {
            progress.enter(RestoreStage::FilesRestored);
            match copy_directory(&scratch.path().join(CONTENT_PREFIX), &self.site.content_dir) {
                Ok(stats) => {
                    progress.modified |= stats.files > 0 || stats.dirs > 0;
                    progress.reached(RestoreStage::FilesRestored);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "File restore failed, database restore kept");
                    report.files_error = Some(e.to_string());
                }
            }
        }

        Ok(report)
    }

    fn restore_database(&self, dump: &Path, drop_tables: bool, report: &mut RestoreReport) -> Result<()> {
        let live_prefix = self.site.table_prefix.as_str();
        let importer = Importer::new(self.db.as_ref(), live_prefix);
        let manifest = &mut report.manifest;

        let stats = importer.import_file(dump, &manifest.tables, drop_tables)?;
        report.statements_executed = stats.statements;

        let source_prefix = if manifest.table_prefix.is_empty() {
            importer.detect_prefix(&manifest.tables)?
        } else {
            manifest.table_prefix.clone()
        };
        report.tables_renamed = importer.ensure_prefix(&manifest.tables, &source_prefix, live_prefix)?;
        if report.tables_renamed > 0 {
            manifest.tables = manifest
                .tables
                .iter()
                .map(|table| match table.strip_prefix(source_prefix.as_str()) {
                    Some(rest) => format!("{live_prefix}{rest}"),
                    None => table.clone(),
                })
                .collect();
        }
        if !live_prefix.is_empty() {
            manifest.table_prefix = live_prefix.to_string();
        }

        self.check_required_tables()?;

        let replacer =
            UrlReplacer::new(self.db.as_ref(), live_prefix).with_tables(self.settings.replace_tables.clone());
        let mut pairs = vec![(manifest.site_url.as_str(), self.site.site_url.as_str())];
        if manifest.home_url != manifest.site_url || self.site.home_url != self.site.site_url {
            pairs.push((manifest.home_url.as_str(), self.site.home_url.as_str()));
        }
        for (old, new) in pairs {
            let stats = replacer.run(old, new)?;
            report.url_replacements += stats.replacements;
            report.rows_updated += stats.rows_updated;
        }
        replacer.set_canonical_urls(&self.site.site_url, &self.site.home_url)?;

        report.maintenance_failures = self.maintain(&manifest.tables);
        Ok(())
    }

    fn check_required_tables(&self) -> Result<()> {
        let mut missing = Vec::new();
        for table in &self.settings.required_tables {
            let name = format!("{}{table}", self.site.table_prefix);
            if !self.db.table_exists(&name)? {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            tracing::error!(missing = ?missing, "Required tables missing after import");
            return Err(SnapshotError::MissingTables(missing));
        }
        Ok(())
    }

    /// Repair and optimize every table. Returns how many calls failed.
    fn maintain(&self, tables: &[String]) -> usize {
        let mut failures = 0;
        for table in tables {
            if let Err(e) = self.db.repair_table(table) {
                tracing::warn!(table = %table, error = %e, "Table repair failed");
                failures += 1;
            }
            if let Err(e) = self.db.optimize_table(table) {
                tracing::warn!(table = %table, error = %e, "Table optimize failed");
                failures += 1;
            }
        }
        tracing::info!(num_tables = tables.len(), failures, "Table maintenance completed");
        failures
    }

    /// Classify a failed apply, replaying the safety snapshot when there is one.
    fn fail(&self, error: SnapshotError, progress: &Progress, safety_snapshot: Option<PathBuf>) -> SnapshotError {
        let stage = progress.stage;
        tracing::error!(stage = %stage, error = %error, "Restore failed");

        let Some(snapshot) = safety_snapshot else {
            return SnapshotError::RestoreFailed {
                stage,
                modified: progress.modified,
                source: Box::new(error),
            };
        };

        tracing::warn!(
            stage = %RestoreStage::RollingBack,
            safety_backup = %snapshot.display(),
            "Attempting rollback from safety backup"
        );
        match self.rollback(&snapshot) {
            Ok(()) => {
                tracing::info!(safety_backup = %snapshot.display(), "Rollback completed");
                SnapshotError::RolledBack {
                    stage,
                    snapshot,
                    source: Box::new(error),
                }
            }
            Err(rollback) => {
                tracing::error!(
                    safety_backup = %snapshot.display(),
                    error = %rollback,
                    "Rollback failed, manual recovery required"
                );
                SnapshotError::Critical {
                    stage,
                    snapshot,
                    rollback: Box::new(rollback),
                    source: Box::new(error),
                }
            }
        }
    }

    fn rollback(&self, snapshot: &Path) -> Result<()> {
        let scratch = self.paths.scratch("rollback")?;
        let mut reader = ArchiveReader::open(snapshot)?;
        let manifest = reader.read_manifest()?;
        reader.extract(scratch.path())?;

        let importer = Importer::new(self.db.as_ref(), &self.site.table_prefix);
        importer.drop_all_tables()?;
        if manifest.include_database {
            importer.import_file(&scratch.path().join(DATABASE_ENTRY), &manifest.tables, true)?;
        }
        if manifest.include_files {
            copy_directory(&scratch.path().join(CONTENT_PREFIX), &self.site.content_dir)?;
        }
        Ok(())
    }
}
