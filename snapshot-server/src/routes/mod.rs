pub mod auth;
pub mod backups;
pub mod download;
pub mod health;
pub mod locks;
pub mod restore;

use crate::state::AppState;
use axum::routing::get;
use axum::{middleware, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .nest("/api/backups", backups::router(state.clone()))
        .nest("/api/restore", restore::router(state.clone()))
        .nest("/api/locks", locks::router(state.clone()))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .merge(api)
        .route("/download", get(download::download))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// File stem of an archive path, the id clients address archives by.
pub(crate) fn archive_id(path: &std::path::Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}
