use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use snapshot_engine::archive::Manifest;
use snapshot_engine::services::{ArchiveRecord, ArchiveSummary, BackupOptions};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/{id}", get(get_backup).delete(delete_backup))
}

/// Archive summary as returned to clients; filesystem paths stay private.
#[derive(Serialize)]
pub struct BackupView {
    #[serde(flatten)]
    pub manifest: Manifest,
    pub checksum: String,
    pub filesize: u64,
    pub download_token: String,
    pub download_url: String,
}

impl From<ArchiveSummary> for BackupView {
    fn from(summary: ArchiveSummary) -> Self {
        Self {
            manifest: summary.manifest,
            checksum: summary.checksum,
            filesize: summary.filesize,
            download_token: summary.download_token,
            download_url: summary.download_url,
        }
    }
}

#[derive(Serialize)]
pub struct ArchiveView {
    #[serde(flatten)]
    pub manifest: Manifest,
    pub filesize: u64,
}

impl From<ArchiveRecord> for ArchiveView {
    fn from(record: ArchiveRecord) -> Self {
        Self {
            manifest: record.manifest,
            filesize: record.filesize,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct CreateBackupBody {
    pub label: String,
    pub include_files: bool,
    pub include_database: bool,
    pub retention: Option<usize>,
}

impl Default for CreateBackupBody {
    fn default() -> Self {
        let options = BackupOptions::default();
        Self {
            label: options.label,
            include_files: options.include_files,
            include_database: options.include_database,
            retention: options.retention,
        }
    }
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ArchiveView>>, AppError> {
    let records = state.run(|engine| engine.backups().list_archives()).await?;
    Ok(Json(records.into_iter().map(ArchiveView::from).collect()))
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBackupBody>,
) -> Result<(StatusCode, Json<BackupView>), AppError> {
    let options = BackupOptions {
        label: body.label,
        include_files: body.include_files,
        include_database: body.include_database,
        retention: body.retention,
    };
    let summary = state.run(move |engine| engine.backups().create(&options)).await?;
    Ok((StatusCode::CREATED, Json(summary.into())))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupView>, AppError> {
    let summary = state.run(move |engine| engine.backups().detail(&id)).await?;
    Ok(Json(summary.into()))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let target = id.clone();
    let deleted = state.run(move |engine| engine.backups().delete(&target)).await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Backup archive not found: {id}")))
    }
}
