use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Runs engine housekeeping (expired tokens, retention, temp cleanup) on a
/// cron schedule.
pub struct HousekeepingScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl HousekeepingScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule(&self, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                match state.run(|engine| engine.backups().housekeeping()).await {
                    Ok(report) if report.skipped_busy => {
                        tracing::info!("Scheduled housekeeping deferred: operation in progress");
                    }
                    Ok(report) => tracing::info!(
                        tokens_purged = report.tokens_purged,
                        archives_pruned = report.archives_pruned,
                        "Scheduled housekeeping finished"
                    ),
                    Err(e) => tracing::error!(error = %e, "Scheduled housekeeping failed"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(cron = %cron_expression, "Housekeeping scheduled");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
