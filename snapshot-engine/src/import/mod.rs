//! Replays a SQL dump into the live database and reconciles table prefixes.

pub mod scanner;

pub use scanner::{Statement, StatementScanner};

use crate::db::{prefix_pattern, Database};
use crate::{Result, SnapshotError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub statements: usize,
    pub lines: usize,
}

pub struct Importer<'a> {
    db: &'a dyn Database,
    /// Prefix of the live installation.
    live_prefix: String,
}

impl<'a> Importer<'a> {
    pub fn new(db: &'a dyn Database, live_prefix: &str) -> Self {
        Self {
            db,
            live_prefix: live_prefix.to_string(),
        }
    }

    pub fn import_file(&self, path: &Path, known_tables: &[String], drop_existing: bool) -> Result<ImportStats> {
        let file = File::open(path)
            .map_err(|e| SnapshotError::io_at("Unable to open database dump", path, e))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        tracing::info!(
            sql_file = %path.display(),
            bytes = size,
            num_known_tables = known_tables.len(),
            drop_existing,
            "Starting SQL import"
        );
        self.import(BufReader::new(file), known_tables, drop_existing)
    }

    /// Execute every statement in `reader`, stopping at the first failure.
    ///
    /// With `drop_existing`, the known tables and every table carrying the
    /// live prefix are dropped first.
    pub fn import<R: BufRead>(&self, reader: R, known_tables: &[String], drop_existing: bool) -> Result<ImportStats> {
        self.db.set_foreign_key_checks(false)?;
        let result = self.run(reader, known_tables, drop_existing);
        if let Err(e) = self.db.set_foreign_key_checks(true) {
            tracing::warn!(error = %e, "Unable to re-enable foreign key checks");
        }

        let stats = result?;
        tracing::info!(
            total_statements = stats.statements,
            total_lines = stats.lines,
            "SQL import completed"
        );
        Ok(stats)
    }

    fn run<R: BufRead>(&self, reader: R, known_tables: &[String], drop_existing: bool) -> Result<ImportStats> {
        if drop_existing {
            tracing::info!(num_tables = known_tables.len(), "Dropping existing tables");
            for table in known_tables {
                self.drop_table(table)?;
            }
            tracing::info!(prefix = %self.live_prefix, "Dropping tables with current prefix");
            self.drop_tables_with_prefix(&self.live_prefix)?;
            self.drop_schema_objects(Some(self.live_prefix.as_str()))?;
        }

        let mut scanner = StatementScanner::new(reader, self.db.backslash_escapes());
        let mut executed = 0usize;

        while let Some(statement) = scanner.next() {
            let statement = statement?;
            if let Err(e) = self.db.execute_script(&statement.sql) {
                // A dump that opened a transaction must not leave it open.
                let _ = self.db.execute_script("ROLLBACK");
                tracing::error!(
                    line = statement.line,
                    statement_preview = %preview(&statement.sql),
                    error = %e,
                    "SQL import failed at statement"
                );
                return Err(SnapshotError::Import {
                    line: statement.line,
                    message: e.message,
                });
            }

            executed += 1;
            if executed % PROGRESS_EVERY == 0 {
                tracing::info!(
                    statements_executed = executed,
                    lines_processed = scanner.lines_read(),
                    "SQL import progress"
                );
            }
        }

        Ok(ImportStats {
            statements: executed,
            lines: scanner.lines_read(),
        })
    }

    /// Rename tables from `source_prefix` to `target_prefix`.
    ///
    /// An empty source prefix is detected from the table names. Returns the
    /// number of renamed tables.
    pub fn ensure_prefix(&self, tables: &[String], source_prefix: &str, target_prefix: &str) -> Result<usize> {
        let source_prefix = if source_prefix.is_empty() {
            let detected = self.detect_prefix(tables)?;
            tracing::info!(prefix = %detected, "Detected source prefix");
            detected
        } else {
            source_prefix.to_string()
        };

        if source_prefix.is_empty() || target_prefix.is_empty() || source_prefix == target_prefix {
            tracing::info!(
                source_prefix = %source_prefix,
                target_prefix,
                "Prefix conversion not needed"
            );
            return Ok(0);
        }

        let renames: Vec<(String, String)> = tables
            .iter()
            .filter_map(|table| {
                table
                    .strip_prefix(source_prefix.as_str())
                    .map(|rest| (table.clone(), format!("{target_prefix}{rest}")))
            })
            .collect();

        if renames.is_empty() {
            tracing::info!("No tables to rename");
            return Ok(0);
        }

        tracing::info!(
            source_prefix = %source_prefix,
            target_prefix,
            num_renames = renames.len(),
            "Renaming tables"
        );

        for (_, target) in &renames {
            self.drop_table(target)
                .map_err(|e| SnapshotError::Rename(e.to_string()))?;
        }
        self.db.rename_tables(&renames).map_err(|e| {
            tracing::error!(error = %e, "Table rename failed");
            SnapshotError::Rename(e.message)
        })?;

        tracing::info!(renamed_tables = renames.len(), "Table prefix conversion completed");
        Ok(renames.len())
    }

    /// Text up to and including the first underscore of the first table that
    /// has one, falling back to the tables already present.
    pub fn detect_prefix(&self, tables: &[String]) -> Result<String> {
        if let Some(prefix) = first_prefix(tables) {
            return Ok(prefix);
        }
        Ok(first_prefix(&self.list_tables(None)?).unwrap_or_default())
    }

    pub fn list_tables(&self, like: Option<&str>) -> Result<Vec<String>> {
        Ok(self.db.list_tables(like)?)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.db.table_exists(table)?)
    }

    pub fn drop_tables_with_prefix(&self, prefix: &str) -> Result<usize> {
        if prefix.is_empty() {
            return Ok(0);
        }
        let tables = self.list_tables(Some(&prefix_pattern(prefix)))?;
        for table in &tables {
            self.drop_table(table)?;
        }
        Ok(tables.len())
    }

    /// Drop every table, view and trigger in the database. Used before
    /// replaying a safety snapshot. Returns the number of tables dropped.
    pub fn drop_all_tables(&self) -> Result<usize> {
        self.drop_schema_objects(None)?;
        let tables = self.list_tables(None)?;
        self.db.set_foreign_key_checks(false)?;
        for table in &tables {
            self.drop_table(table)?;
        }
        self.db.set_foreign_key_checks(true)?;
        tracing::info!(num_tables = tables.len(), "Dropped all tables");
        Ok(tables.len())
    }

    /// Drop views and triggers, only those named with `prefix` when given.
    pub fn drop_schema_objects(&self, prefix: Option<&str>) -> Result<usize> {
        let objects: Vec<_> = self
            .db
            .schema_objects()?
            .into_iter()
            .filter(|object| match prefix {
                Some(prefix) => !prefix.is_empty() && object.name.starts_with(prefix),
                None => true,
            })
            .collect();
        for object in &objects {
            self.db.execute_script(&self.db.drop_object_statement(object))?;
        }
        if !objects.is_empty() {
            tracing::info!(num_objects = objects.len(), "Dropped views and triggers");
        }
        Ok(objects.len())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.db
            .execute_script(&format!("DROP TABLE IF EXISTS {}", self.db.quote_identifier(table)))?;
        Ok(())
    }
}

fn first_prefix(tables: &[String]) -> Option<String> {
    tables
        .iter()
        .find_map(|t| t.find('_').map(|pos| t[..=pos].to_string()))
}

fn preview(sql: &str) -> String {
    sql.chars().take(200).collect()
}
