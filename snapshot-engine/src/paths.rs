//! Storage layout under the configured base directory.
//!
//! ```text
//! <base>/archives/   finished archives
//! <base>/logs/       daily log files
//! <base>/temp/       scratch workspaces and dump staging
//! <base>/state.db    locks and download tokens
//! ```

use crate::archive::Environment;
use crate::{Result, SnapshotError};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    base: PathBuf,
}

impl StoragePaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.base.join("archives")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.base.join("temp")
    }

    pub fn state_db(&self) -> PathBuf {
        self.base.join("state.db")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.base.clone(), self.archives_dir(), self.logs_dir(), self.temp_dir()] {
            fs::create_dir_all(&dir).map_err(|e| {
                SnapshotError::io_at("Cannot create storage directory (check filesystem permissions)", &dir, e)
            })?;
        }
        Ok(())
    }

    /// `<Ymd-His>-<host>-<env>-<label>.zip`, with `-N` appended when the name
    /// is taken.
    pub fn unique_archive_path(
        &self,
        now: DateTime<Utc>,
        host: &str,
        environment: Environment,
        label: &str,
    ) -> PathBuf {
        let label = match slugify(label) {
            s if s.is_empty() => "snapshot".to_string(),
            s => s,
        };
        let host = match slugify(host) {
            s if s.is_empty() => "site".to_string(),
            s => s,
        };
        let stem = format!("{}-{host}-{environment}-{label}", now.format("%Y%m%d-%H%M%S"));
        unique_path(&self.archives_dir(), &stem, "zip")
    }

    /// Fresh directory under `temp/`, removed when the guard drops.
    pub fn scratch(&self, purpose: &str) -> Result<ScratchDir> {
        let path = self
            .temp_dir()
            .join(format!("{}-{}", slugify(purpose), uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&path)
            .map_err(|e| SnapshotError::io_at("Unable to allocate temporary storage", &path, e))?;
        Ok(ScratchDir { path })
    }

    /// Empty the temp directory. Returns the number of entries removed.
    pub fn cleanup_temp(&self) -> Result<usize> {
        let temp = self.temp_dir();
        if !temp.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&temp)? {
            let path = entry?.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Unable to remove temp entry"),
            }
        }
        Ok(removed)
    }
}

/// First free `<dir>/<stem>.<ext>`, `<dir>/<stem>-1.<ext>`, ...
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{ext}"));
    if !candidate.exists() {
        return candidate;
    }
    (1..)
        .map(|n| dir.join(format!("{stem}-{n}.{ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Lowercase ASCII slug: alphanumerics kept, everything else collapsed to
/// single dashes.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !slug.is_empty() && !dash {
            slug.push('-');
            dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Host part of a URL, without scheme, credentials or port.
pub fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = match host.strip_prefix('[') {
        Some(v6) => v6.split(']').next()?,
        None => host.split(':').next()?,
    };
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Temporary directory removed on drop.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Unable to remove scratch directory");
            }
        }
    }
}
