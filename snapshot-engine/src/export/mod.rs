//! Database export.
//!
//! Two strategies produce the same importable statement stream: the
//! paginated [`StreamingDump`] that reads through the [`Database`] trait, and
//! [`NativeDump`], which hands the work to the engine's own dump tool when it
//! is installed and the database location is known.

pub mod native;
pub mod streaming;

pub use native::NativeDump;
pub use streaming::StreamingDump;

use crate::db::Database;
use crate::{Result, SnapshotError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Smallest page the exporter will read.
pub const MIN_CHUNK_SIZE: usize = 50;
pub const DEFAULT_CHUNK_SIZE: usize = 500;

pub trait DumpStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy can run against `db` right now.
    fn available(&self, db: &dyn Database) -> bool;

    /// Write the dump of `tables` to `out`.
    fn dump(&self, db: &dyn Database, tables: &[String], out: &mut dyn Write) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub chunk_size: usize,
    pub native_dump: bool,
    pub native_tool: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            native_dump: true,
            native_tool: "sqlite3".to_string(),
        }
    }
}

pub struct Exporter {
    strategies: Vec<Box<dyn DumpStrategy>>,
}

impl Exporter {
    /// Native tool first when enabled, streaming dump as the fallback.
    pub fn new(settings: &ExportSettings) -> Self {
        let mut strategies: Vec<Box<dyn DumpStrategy>> = Vec::new();
        if settings.native_dump {
            strategies.push(Box::new(NativeDump::new(&settings.native_tool)));
        }
        strategies.push(Box::new(StreamingDump::new(settings.chunk_size)));
        Self { strategies }
    }

    pub fn with_strategies(strategies: Vec<Box<dyn DumpStrategy>>) -> Self {
        Self { strategies }
    }

    /// Dump every table to `out` and return the table names in dump order.
    pub fn export(&self, db: &dyn Database, out: &mut dyn Write) -> Result<Vec<String>> {
        let tables = db.list_tables(None)?;
        if tables.is_empty() {
            return Err(SnapshotError::NoTablesFound);
        }

        let strategy = self
            .strategies
            .iter()
            .find(|s| s.available(db))
            .ok_or_else(|| SnapshotError::Config("no dump strategy available".into()))?;

        tracing::info!(
            strategy = strategy.name(),
            num_tables = tables.len(),
            "Starting database dump"
        );
        strategy.dump(db, &tables, out)?;
        out.flush()?;

        Ok(tables)
    }

    pub fn export_to_file(&self, db: &dyn Database, path: &Path) -> Result<Vec<String>> {
        let file = File::create(path)
            .map_err(|e| SnapshotError::io_at("Unable to write database dump", path, e))?;
        let mut writer = BufWriter::new(file);
        let tables = self.export(db, &mut writer)?;
        writer
            .into_inner()
            .map_err(|e| SnapshotError::io_at("Unable to flush database dump", path, e.into_error()))?
            .sync_all()?;
        Ok(tables)
    }
}
