use super::archive_id;
use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use snapshot_engine::archive::Manifest;
use snapshot_engine::services::{RestoreReport, RestoreRequest, RestoreStage};
use std::path::PathBuf;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", post(restore))
}

#[derive(Deserialize)]
#[serde(default)]
pub struct RestoreBody {
    pub archive_id: Option<String>,
    /// Relative to the archive directory; anything outside it is rejected.
    pub archive_path: Option<PathBuf>,
    pub source_url: Option<String>,
    pub drop_tables: bool,
    pub safety_backup: bool,
}

impl Default for RestoreBody {
    fn default() -> Self {
        let request = RestoreRequest::default();
        Self {
            archive_id: None,
            archive_path: None,
            source_url: None,
            drop_tables: request.drop_tables,
            safety_backup: request.safety_backup,
        }
    }
}

#[derive(Serialize)]
pub struct RestoreView {
    pub archive_id: String,
    pub manifest: Manifest,
    pub safety_backup: Option<String>,
    pub stages: Vec<RestoreStage>,
    pub statements_executed: usize,
    pub tables_renamed: usize,
    pub url_replacements: usize,
    pub maintenance_failures: usize,
    pub files_error: Option<String>,
}

impl From<RestoreReport> for RestoreView {
    fn from(report: RestoreReport) -> Self {
        Self {
            archive_id: archive_id(&report.archive),
            manifest: report.manifest,
            safety_backup: report.safety_snapshot.as_deref().map(archive_id),
            stages: report.stages,
            statements_executed: report.statements_executed,
            tables_renamed: report.tables_renamed,
            url_replacements: report.url_replacements,
            maintenance_failures: report.maintenance_failures,
            files_error: report.files_error,
        }
    }
}

async fn restore(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RestoreBody>,
) -> Result<Json<RestoreView>, AppError> {
    if body.archive_id.is_none() && body.archive_path.is_none() && body.source_url.is_none() {
        return Err(AppError::BadRequest(
            "One of archive_id, archive_path or source_url is required".into(),
        ));
    }

    let request = RestoreRequest {
        archive_path: body.archive_path,
        archive_id: body.archive_id,
        source_url: body.source_url,
        drop_tables: body.drop_tables,
        safety_backup: body.safety_backup,
        label: None,
    };
    let report = state.run(move |engine| engine.restores().restore(&request)).await?;
    Ok(Json(report.into()))
}
