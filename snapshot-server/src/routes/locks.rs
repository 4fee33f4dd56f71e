use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde_json::{json, Value};
use snapshot_engine::lock::OperationKind;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(lock_status))
        .route("/{kind}", delete(clear_lock))
}

async fn lock_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let marker = state.run(|engine| engine.locks().current()).await?;
    Ok(Json(match marker {
        Some(marker) => json!({
            "locked": true,
            "operation": marker.kind,
            "acquired_at": marker.acquired_at,
            "expires_at": marker.expires_at,
        }),
        None => json!({ "locked": false }),
    }))
}

/// Clears the marker only; a still-running operation is not stopped.
async fn clear_lock(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<Value>, AppError> {
    let kind: OperationKind = kind.parse()?;
    let cleared = state.run(move |engine| engine.locks().force_release(kind)).await?;
    Ok(Json(json!({ "operation": kind, "cleared": cleared })))
}
