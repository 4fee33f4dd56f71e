//! Base-URL rewriting across the content tables after a restore.

pub mod serialized;

use crate::db::{ColumnInfo, Database, PageStrategy, Pager, SqlValue};
use crate::Result;

/// Content tables searched for the old base URL, without prefix.
pub const DEFAULT_REPLACE_TABLES: &[&str] = &[
    "options",
    "posts",
    "postmeta",
    "comments",
    "commentmeta",
    "terms",
    "term_taxonomy",
    "term_relationships",
    "termmeta",
    "usermeta",
];

/// Key columns tried when a table declares no primary key.
const FALLBACK_KEYS: &[&str] = &[
    "ID",
    "term_id",
    "term_taxonomy_id",
    "comment_ID",
    "meta_id",
    "umeta_id",
    "link_id",
];

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceStats {
    pub replacements: usize,
    pub rows_updated: usize,
    pub tables_skipped: usize,
}

pub struct UrlReplacer<'a> {
    db: &'a dyn Database,
    prefix: String,
    tables: Vec<String>,
    dry_run: bool,
}

impl<'a> UrlReplacer<'a> {
    pub fn new(db: &'a dyn Database, prefix: &str) -> Self {
        Self {
            db,
            prefix: prefix.to_string(),
            tables: DEFAULT_REPLACE_TABLES.iter().map(|t| t.to_string()).collect(),
            dry_run: false,
        }
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    /// Count matches without writing anything back.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn run(&self, old: &str, new: &str) -> Result<ReplaceStats> {
        let mut stats = ReplaceStats::default();
        if old.is_empty() || old == new {
            tracing::info!(old, new, "URL replacement skipped - URLs are identical");
            return Ok(stats);
        }

        for suffix in &self.tables {
            let table = format!("{}{}", self.prefix, suffix);
            if !self.db.table_exists(&table)? {
                continue;
            }
            let (replacements, rows_updated, skipped) = self.replace_in_table(&table, old, new)?;
            if skipped {
                stats.tables_skipped += 1;
                continue;
            }
            if replacements > 0 {
                tracing::info!(table, replacements, rows_updated, "URL replacements in table");
            }
            stats.replacements += replacements;
            stats.rows_updated += rows_updated;
        }

        tracing::info!(
            old_url = old,
            new_url = new,
            total_replacements = stats.replacements,
            total_rows_updated = stats.rows_updated,
            "URL replacement completed"
        );
        Ok(stats)
    }

    fn replace_in_table(&self, table: &str, old: &str, new: &str) -> Result<(usize, usize, bool)> {
        let columns = self.db.columns(table)?;
        let keys = key_columns(&columns);
        if keys.is_empty() {
            tracing::warn!(table, "Skipping table - no primary key found");
            return Ok((0, 0, true));
        }

        let strategy = PageStrategy::detect(self.db, table)?;
        let mut pager = Pager::new(self.db, table, strategy, PAGE_SIZE);
        let mut replacements = 0;
        let mut rows_updated = 0;

        while let Some(page) = pager.next_page()? {
            let key_idx: Option<Vec<usize>> = keys.iter().map(|k| page.column_index(k)).collect();
            let Some(key_idx) = key_idx else {
                return Ok((0, 0, true));
            };

            for row in &page.rows {
                let mut updates: Vec<(&str, SqlValue)> = Vec::new();
                for (idx, value) in row.iter().enumerate() {
                    if key_idx.contains(&idx) {
                        continue;
                    }
                    let Some(text) = value.as_text() else { continue };
                    if let Some(updated) = replace_value(text, old, new) {
                        updates.push((page.columns[idx].as_str(), SqlValue::Text(updated)));
                    }
                }
                if updates.is_empty() {
                    continue;
                }
                replacements += updates.len();
                if self.dry_run {
                    continue;
                }

                let key_values: Vec<SqlValue> = key_idx.iter().map(|i| row[*i].clone()).collect();
                if self.update_row(table, &updates, &keys, key_values)? > 0 {
                    rows_updated += 1;
                }
            }
        }

        Ok((replacements, rows_updated, false))
    }

    fn update_row(
        &self,
        table: &str,
        updates: &[(&str, SqlValue)],
        keys: &[String],
        key_values: Vec<SqlValue>,
    ) -> Result<usize> {
        let set = updates
            .iter()
            .enumerate()
            .map(|(i, (col, _))| format!("{} = ?{}", self.db.quote_identifier(col), i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let filter = keys
            .iter()
            .enumerate()
            .map(|(i, k)| format!("{} = ?{}", self.db.quote_identifier(k), updates.len() + i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");

        let mut params: Vec<SqlValue> = updates.iter().map(|(_, v)| v.clone()).collect();
        params.extend(key_values);

        Ok(self.db.execute(
            &format!("UPDATE {} SET {set} WHERE {filter}", self.db.quote_identifier(table)),
            &params,
        )?)
    }

    /// Point the canonical `siteurl` and `home` options at the live site.
    pub fn set_canonical_urls(&self, site_url: &str, home_url: &str) -> Result<()> {
        let options = format!("{}options", self.prefix);
        if !self.db.table_exists(&options)? {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET option_value = ?1 WHERE option_name = ?2",
            self.db.quote_identifier(&options)
        );
        for (name, value) in [("siteurl", site_url), ("home", home_url)] {
            self.db.execute(
                &sql,
                &[SqlValue::Text(value.to_string()), SqlValue::Text(name.to_string())],
            )?;
        }
        tracing::info!(site_url, home_url, "Canonical URLs updated");
        Ok(())
    }
}

/// Declared primary key columns, or the first well-known key column present.
fn key_columns(columns: &[ColumnInfo]) -> Vec<String> {
    let declared: Vec<String> = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.clone())
        .collect();
    if !declared.is_empty() {
        return declared;
    }
    FALLBACK_KEYS
        .iter()
        .find(|key| columns.iter().any(|c| c.name == **key))
        .map(|key| vec![key.to_string()])
        .unwrap_or_default()
}

/// Replace `old` in one column value. Serialized values are rewritten leaf by
/// leaf so their length prefixes stay valid. `None` when nothing changed.
pub fn replace_value(value: &str, old: &str, new: &str) -> Option<String> {
    if old.is_empty() || !value.contains(old) {
        return None;
    }

    if serialized::looks_serialized(value) {
        if let Ok(mut tree) = serialized::parse(value.as_bytes()) {
            tree.replace_strings(old.as_bytes(), new.as_bytes());
            let bytes = serialized::serialize(&tree);
            return String::from_utf8(bytes).ok().filter(|updated| updated != value);
        }
    }

    Some(value.replace(old, new))
}
