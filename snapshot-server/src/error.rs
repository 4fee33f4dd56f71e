use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use snapshot_engine::{FailureOutcome, SnapshotError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "error": m })),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, json!({ "error": m })),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, json!({ "error": m })),
            AppError::Snapshot(e) => snapshot_response(e),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn snapshot_response(e: &SnapshotError) -> (StatusCode, serde_json::Value) {
    let status = match e {
        SnapshotError::Busy { .. } => StatusCode::CONFLICT,
        SnapshotError::ArchiveNotFound(_) => StatusCode::NOT_FOUND,
        SnapshotError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        SnapshotError::Manifest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SnapshotError::Download(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "Snapshot operation failed");
    }

    let outcome = e.outcome();
    let mut body = json!({ "error": e.to_string() });
    if outcome != FailureOutcome::NothingChanged || matches!(e, SnapshotError::RestoreFailed { .. }) {
        body["outcome"] = json!(outcome);
    }
    if let Some(snapshot) = e.safety_snapshot() {
        body["safety_backup"] = json!(snapshot.file_stem().map(|s| s.to_string_lossy()));
    }
    (status, body)
}
