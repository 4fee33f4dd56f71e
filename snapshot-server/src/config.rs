use std::path::PathBuf;

/// Daily at 03:00 (seconds field first).
const DEFAULT_HOUSEKEEPING_CRON: &str = "0 0 3 * * *";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Engine configuration file. Engine defaults and `SNAPSHOT_*` variables
    /// apply when unset.
    pub snapshot_config: Option<PathBuf>,
    /// Bearer token required on `/api` routes when set.
    pub api_token: Option<String>,
    /// Empty disables the scheduled housekeeping job.
    pub housekeeping_cron: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            port: lookup("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            snapshot_config: lookup("SNAPSHOT_CONFIG")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            api_token: lookup("API_TOKEN").filter(|v| !v.is_empty()),
            housekeeping_cron: lookup("HOUSEKEEPING_CRON")
                .unwrap_or_else(|| DEFAULT_HOUSEKEEPING_CRON.into()),
        }
    }
}
