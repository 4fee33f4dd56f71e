//! Memory-bounded paging over a table.
//!
//! Tables with a single integer primary key are read by keyset
//! (`key > last ORDER BY key LIMIT n`), which stays cheap and stable however
//! deep the table is. Anything else falls back to `LIMIT n OFFSET k`.

use super::{Database, DbResult, RowSet, SqlValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStrategy {
    Keyset { column: String },
    Offset { order_by: Option<String> },
}

impl PageStrategy {
    /// Pick keyset paging when the table has exactly one primary-key column
    /// and it is integer-typed.
    pub fn detect(db: &dyn Database, table: &str) -> DbResult<Self> {
        let columns = db.columns(table)?;
        let keys: Vec<_> = columns.iter().filter(|c| c.primary_key).collect();
        Ok(match keys.as_slice() {
            [key] if key.is_integer() => PageStrategy::Keyset {
                column: key.name.clone(),
            },
            [key] => PageStrategy::Offset {
                order_by: Some(key.name.clone()),
            },
            _ => PageStrategy::Offset { order_by: None },
        })
    }
}

pub struct Pager<'a> {
    db: &'a dyn Database,
    table: String,
    strategy: PageStrategy,
    chunk_size: usize,
    last_key: Option<i64>,
    offset: usize,
    done: bool,
}

impl<'a> Pager<'a> {
    pub fn new(db: &'a dyn Database, table: &str, strategy: PageStrategy, chunk_size: usize) -> Self {
        Self {
            db,
            table: table.to_string(),
            strategy,
            chunk_size: chunk_size.max(1),
            last_key: None,
            offset: 0,
            done: false,
        }
    }

    pub fn strategy(&self) -> &PageStrategy {
        &self.strategy
    }

    /// Next page, or `None` once the table is exhausted.
    pub fn next_page(&mut self) -> DbResult<Option<RowSet>> {
        if self.done {
            return Ok(None);
        }

        let table = self.db.quote_identifier(&self.table);
        let page = match &self.strategy {
            PageStrategy::Keyset { column } => {
                let key = self.db.quote_identifier(column);
                let page = match self.last_key {
                    Some(last) => self.db.query(
                        &format!("SELECT * FROM {table} WHERE {key} > ?1 ORDER BY {key} LIMIT ?2"),
                        &[SqlValue::Integer(last), SqlValue::Integer(self.chunk_size as i64)],
                    )?,
                    None => self.db.query(
                        &format!("SELECT * FROM {table} ORDER BY {key} LIMIT ?1"),
                        &[SqlValue::Integer(self.chunk_size as i64)],
                    )?,
                };
                let key_idx = page.column_index(column);
                if let Some(last) = key_idx
                    .and_then(|idx| page.rows.last().map(|row| &row[idx]))
                    .and_then(SqlValue::as_integer)
                {
                    self.last_key = Some(last);
                } else if !page.is_empty() {
                    // Key column missing or not an integer: cannot continue by keyset.
                    self.done = true;
                }
                page
            }
            PageStrategy::Offset { order_by } => {
                let order = order_by
                    .as_ref()
                    .map(|c| format!(" ORDER BY {}", self.db.quote_identifier(c)))
                    .unwrap_or_default();
                let page = self.db.query(
                    &format!("SELECT * FROM {table}{order} LIMIT ?1 OFFSET ?2"),
                    &[
                        SqlValue::Integer(self.chunk_size as i64),
                        SqlValue::Integer(self.offset as i64),
                    ],
                )?;
                self.offset += page.len();
                page
            }
        };

        if page.len() < self.chunk_size {
            self.done = true;
        }
        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }
}
