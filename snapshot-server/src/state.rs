use crate::config::AppConfig;
use crate::error::AppError;
use snapshot_engine::Engine;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(engine: Engine, config: AppConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            config,
        }
    }

    /// Run a synchronous engine call off the async runtime.
    pub async fn run<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> snapshot_engine::Result<T> + Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .map_err(AppError::from)
    }
}
