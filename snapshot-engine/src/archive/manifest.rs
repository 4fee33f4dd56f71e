//! Archive manifest.
//!
//! Stored as `manifest.json` at the root of every archive and written last,
//! so it always reflects the final table list.

use crate::{Result, SnapshotError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const DATABASE_ENTRY: &str = "database.sql";
pub const CONTENT_PREFIX: &str = "wp-content";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Staging,
    #[default]
    Live,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Staging => "staging",
            Environment::Live => "live",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = SnapshotError;

    /// Accepts the usual environment names and folds them into three classes.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "development" | "dev" => Ok(Environment::Local),
            "staging" | "stage" => Ok(Environment::Staging),
            "live" | "production" | "prod" => Ok(Environment::Live),
            other => Err(SnapshotError::Config(format!("unknown environment '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub created_at_gmt: DateTime<Utc>,
    #[serde(default)]
    pub site_url: String,
    #[serde(default)]
    pub home_url: String,
    #[serde(default)]
    pub origin_host: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub table_prefix: String,
    pub include_files: bool,
    pub include_database: bool,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
}

impl Manifest {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| SnapshotError::Manifest(format!("cannot parse {MANIFEST_ENTRY}: {e}")))?;
        if !manifest.include_files && !manifest.include_database {
            return Err(SnapshotError::Manifest(
                "manifest declares neither files nor database".into(),
            ));
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_keys() {
        let manifest = Manifest {
            id: "20240601-120000-example-com-live-full-site".into(),
            label: "full-site".into(),
            created_at_gmt: DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            site_url: "https://example.com".into(),
            home_url: "https://example.com".into(),
            origin_host: "example.com".into(),
            environment: Environment::Staging,
            table_prefix: "wp_".into(),
            include_files: false,
            include_database: true,
            tables: vec!["wp_options".into()],
            engine_version: None,
        };
        let json: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(json["environment"], "staging");
        assert_eq!(json["created_at_gmt"], "2024-06-01T12:00:00Z");
        assert!(json.get("engine_version").is_none());

        let back = Manifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_manifest_requires_a_payload() {
        let json = br#"{"created_at_gmt":"2024-06-01T12:00:00+00:00","include_files":false,"include_database":false}"#;
        assert!(matches!(Manifest::from_json(json), Err(SnapshotError::Manifest(_))));
        assert!(Manifest::from_json(b"not json").is_err());
    }

    #[test]
    fn test_environment_aliases() {
        assert_eq!("development".parse::<Environment>().unwrap(), Environment::Local);
        assert_eq!("production".parse::<Environment>().unwrap(), Environment::Live);
        assert!("moon".parse::<Environment>().is_err());
    }
}
