use crate::error::AppError;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

#[derive(Deserialize)]
pub struct DownloadQuery {
    #[serde(default)]
    pub token: String,
}

/// Stream the archive a download token points at. The token is spent on
/// the first request whatever happens next.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let token = query.token;
    let path = state
        .run(move |engine| engine.backups().redeem_download(&token))
        .await?
        .ok_or_else(|| AppError::NotFound("Download link expired or invalid".into()))?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("Backup archive not found".into()));
        }
        Err(e) => return Err(anyhow::Error::from(e).into()),
    };
    let size = file.metadata().await.map_err(anyhow::Error::from)?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| "snapshot.zip".into());

    tracing::info!(archive = %path.display(), bytes = size, "Serving archive download");
    Ok((
        [
            (CONTENT_TYPE, "application/zip".to_string()),
            (CONTENT_LENGTH, size.to_string()),
            (CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\"")),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
