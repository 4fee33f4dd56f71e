//! Error types for the snapshot engine.

use crate::db::DbError;
use crate::lock::OperationKind;
use crate::services::restore::RestoreStage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Site snapshot engine is busy with {held_by}. Try again later.")]
    Busy { held_by: OperationKind },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Backup archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("No database tables discovered")]
    NoTablesFound,

    #[error("Unable to read CREATE TABLE for {0}")]
    TableStructure(String),

    #[error("SQL error at line {line}: {message}")]
    Import { line: usize, message: String },

    #[error("Failed to update table prefixes: {0}")]
    Rename(String),

    #[error("Required tables missing after import: {}", .0.join(", "))]
    MissingTables(Vec<String>),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {source}")]
    IoPath {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Download error: {0}")]
    Download(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Restore failed during {stage}: {source}")]
    RestoreFailed {
        stage: RestoreStage,
        modified: bool,
        #[source]
        source: Box<SnapshotError>,
    },

    #[error(
        "Restore failed during {stage} ({source}). The site was restored to its previous state from {}",
        .snapshot.display()
    )]
    RolledBack {
        stage: RestoreStage,
        snapshot: PathBuf,
        #[source]
        source: Box<SnapshotError>,
    },

    #[error(
        "CRITICAL ERROR: restore failed during {stage} ({source}) and rollback failed ({rollback}). Restore manually from the safety backup at {}",
        .snapshot.display()
    )]
    Critical {
        stage: RestoreStage,
        snapshot: PathBuf,
        rollback: Box<SnapshotError>,
        #[source]
        source: Box<SnapshotError>,
    },

    #[error("CRITICAL ERROR: safety backup could not be created ({source}). Restore aborted before any change")]
    SafetyBackupFailed {
        #[source]
        source: Box<SnapshotError>,
    },
}

/// What a failed operation left behind, for callers that report to humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Failed before touching the database or content tree.
    NothingChanged,
    /// Failed after modifying shared state, no safety snapshot to replay.
    Failed,
    /// Failed, then the safety snapshot was replayed successfully.
    RolledBack,
    /// Manual recovery needed.
    Critical,
}

impl SnapshotError {
    pub fn io_at(context: impl Into<String>, path: &Path, source: std::io::Error) -> Self {
        SnapshotError::IoPath {
            context: format!("{} {}", context.into(), path.display()),
            source,
        }
    }

    pub fn outcome(&self) -> FailureOutcome {
        match self {
            SnapshotError::RestoreFailed { modified: true, .. } => FailureOutcome::Failed,
            SnapshotError::RolledBack { .. } => FailureOutcome::RolledBack,
            SnapshotError::Critical { .. } | SnapshotError::SafetyBackupFailed { .. } => {
                FailureOutcome::Critical
            }
            _ => FailureOutcome::NothingChanged,
        }
    }

    /// Safety backup an operator should restore from, when one exists.
    pub fn safety_snapshot(&self) -> Option<&Path> {
        match self {
            SnapshotError::RolledBack { snapshot, .. } | SnapshotError::Critical { snapshot, .. } => {
                Some(snapshot)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
