use super::{ColumnInfo, Database, DbError, DbResult, ObjectKind, RowSet, SchemaObject, SqlValue};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, ToSql};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type DbPool = Pool<SqliteConnectionManager>;

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        DbError::new(e.to_string())
    }
}

impl From<r2d2::Error> for DbError {
    fn from(e: r2d2::Error) -> Self {
        DbError::new(format!("connection pool: {e}"))
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlValue::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

/// SQLite site database.
///
/// The pool holds exactly one connection: foreign-key toggles and the
/// transactions a native dump opens are connection-scoped and must survive
/// from one statement to the next.
pub struct SqliteDatabase {
    pool: DbPool,
    path: Option<PathBuf>,
}

impl SqliteDatabase {
    pub fn open(path: &Path) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(10)));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| DbError::new(format!("cannot open {}: {e}", path.display())))?;

        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory() -> DbResult<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Ok(Self { pool, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl Database for SqliteDatabase {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }

    fn execute_script(&self, sql: &str) -> DbResult<()> {
        let conn = self.conn()?;
        Ok(conn.execute_batch(sql)?)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<RowSet> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_value_ref(row.get_ref(i)?));
            }
            out.push(values);
        }

        Ok(RowSet { columns, rows: out })
    }

    fn list_tables(&self, like: Option<&str>) -> DbResult<Vec<String>> {
        let mut sql = String::from(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'",
        );
        let mut params = Vec::new();
        if let Some(pattern) = like {
            sql.push_str(" AND name LIKE ?1 ESCAPE '\\'");
            params.push(SqlValue::Text(pattern.to_string()));
        }
        sql.push_str(" ORDER BY name");

        let result = self.query(&sql, &params)?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(SqlValue::Text(name)) => Some(name),
                _ => None,
            })
            .collect())
    }

    fn create_statements(&self, table: &str) -> DbResult<Vec<String>> {
        let result = self.query(
            "SELECT sql FROM sqlite_master
             WHERE tbl_name = ?1 AND type IN ('table', 'index') AND sql IS NOT NULL
             ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, name",
            &[SqlValue::Text(table.to_string())],
        )?;
        let statements: Vec<String> = result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter_map(|value| match value {
                SqlValue::Text(sql) => Some(sql),
                _ => None,
            })
            .collect();

        // No CREATE TABLE means the table is gone, whatever indexes remain.
        match statements.first() {
            Some(first) if first.trim_start().to_ascii_uppercase().starts_with("CREATE TABLE") => {
                Ok(statements)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn schema_objects(&self) -> DbResult<Vec<SchemaObject>> {
        let result = self.query(
            "SELECT type, name, sql FROM sqlite_master
             WHERE type IN ('view', 'trigger') AND sql IS NOT NULL
             ORDER BY CASE type WHEN 'view' THEN 0 ELSE 1 END, rowid",
            &[],
        )?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| {
                let [kind, name, sql]: [SqlValue; 3] = row.try_into().ok()?;
                let kind = match kind.as_text()? {
                    "view" => ObjectKind::View,
                    "trigger" => ObjectKind::Trigger,
                    _ => return None,
                };
                Some(SchemaObject {
                    kind,
                    name: name.as_text()?.to_string(),
                    sql: sql.as_text()?.to_string(),
                })
            })
            .collect())
    }

    fn columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>> {
        let sql = format!("PRAGMA table_info({})", self.quote_identifier(table));
        let result = self.query(&sql, &[])?;
        let name_idx = result.column_index("name");
        let type_idx = result.column_index("type");
        let pk_idx = result.column_index("pk");

        let (Some(name_idx), Some(type_idx), Some(pk_idx)) = (name_idx, type_idx, pk_idx) else {
            return Err(DbError::new(format!("unexpected table_info shape for {table}")));
        };

        Ok(result
            .rows
            .iter()
            .map(|row| ColumnInfo {
                name: row[name_idx].to_string(),
                declared_type: row[type_idx].to_string(),
                primary_key: row[pk_idx].as_integer().unwrap_or(0) > 0,
            })
            .collect())
    }

    fn rename_tables(&self, pairs: &[(String, String)]) -> DbResult<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (from, to) in pairs {
            tx.execute_batch(&format!(
                "ALTER TABLE {} RENAME TO {}",
                self.quote_identifier(from),
                self.quote_identifier(to)
            ))?;
        }
        tx.commit()?;
        Ok(())
    }

    fn repair_table(&self, table: &str) -> DbResult<()> {
        self.execute_script(&format!("REINDEX {}", self.quote_identifier(table)))
    }

    fn optimize_table(&self, table: &str) -> DbResult<()> {
        self.execute_script(&format!("ANALYZE {}", self.quote_identifier(table)))
    }

    fn set_foreign_key_checks(&self, enabled: bool) -> DbResult<()> {
        self.execute_script(if enabled {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        })
    }

    fn backslash_escapes(&self) -> bool {
        false
    }

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    fn dump_preamble(&self) -> Vec<String> {
        vec!["PRAGMA foreign_keys=OFF;".to_string()]
    }

    fn dump_postamble(&self) -> Vec<String> {
        vec!["PRAGMA foreign_keys=ON;".to_string()]
    }

    fn native_dump_source(&self) -> Option<PathBuf> {
        self.path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> SqliteDatabase {
        let db = SqliteDatabase::in_memory().unwrap();
        db.execute_script(
            "CREATE TABLE wp_posts (ID INTEGER PRIMARY KEY, post_title TEXT);
             CREATE INDEX wp_posts_title ON wp_posts(post_title);
             CREATE TABLE wpxposts (id INTEGER);
             CREATE TABLE wp_options (option_name TEXT PRIMARY KEY, option_value TEXT);",
        )
        .unwrap();
        db
    }

    #[test]
    fn test_list_tables_with_escaped_prefix() {
        let db = db();
        assert_eq!(db.list_tables(None).unwrap().len(), 3);
        assert_eq!(
            db.list_tables(Some(&super::super::prefix_pattern("wp_"))).unwrap(),
            vec!["wp_options".to_string(), "wp_posts".to_string()]
        );
        assert!(db.table_exists("wp_posts").unwrap());
        assert!(!db.table_exists("wp_post").unwrap());
    }

    #[test]
    fn test_create_statements_include_indexes() {
        let db = db();
        let statements = db.create_statements("wp_posts").unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE"));
        assert!(statements[1].starts_with("CREATE INDEX"));
        assert!(db.create_statements("missing").unwrap().is_empty());
    }

    #[test]
    fn test_triggers_and_views_are_listed_apart_from_tables() {
        let db = db();
        db.execute_script(
            "CREATE TABLE wp_log (post_id INTEGER);
             CREATE TRIGGER wp_posts_log AFTER INSERT ON wp_posts
             BEGIN
               INSERT INTO wp_log VALUES (NEW.ID);
             END;
             CREATE VIEW wp_titles AS SELECT post_title FROM wp_posts;
             CREATE VIEW wp_titles_upper AS SELECT upper(post_title) FROM wp_titles;",
        )
        .unwrap();

        let statements = db.create_statements("wp_posts").unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|s| !s.contains("TRIGGER")));
        assert!(!db.list_tables(None).unwrap().contains(&"wp_titles".to_string()));

        let objects = db.schema_objects().unwrap();
        let names: Vec<(ObjectKind, &str)> = objects.iter().map(|o| (o.kind, o.name.as_str())).collect();
        assert_eq!(
            names,
            vec![
                (ObjectKind::View, "wp_titles"),
                (ObjectKind::View, "wp_titles_upper"),
                (ObjectKind::Trigger, "wp_posts_log"),
            ]
        );
        assert_eq!(db.drop_object_statement(&objects[0]), "DROP VIEW IF EXISTS `wp_titles`");
    }

    #[test]
    fn test_columns_report_primary_key() {
        let db = db();
        let cols = db.columns("wp_posts").unwrap();
        assert_eq!(cols.len(), 2);
        assert!(cols[0].primary_key && cols[0].is_integer());
        assert!(!cols[1].primary_key);
    }

    #[test]
    fn test_rename_is_all_or_nothing() {
        let db = db();
        let pairs = vec![
            ("wp_posts".to_string(), "site_posts".to_string()),
            ("does_not_exist".to_string(), "site_missing".to_string()),
        ];
        assert!(db.rename_tables(&pairs).is_err());
        assert!(db.table_exists("wp_posts").unwrap());
        assert!(!db.table_exists("site_posts").unwrap());
    }

    #[test]
    fn test_quote_literal_doubles_quotes() {
        let db = db();
        assert_eq!(db.quote_literal("it's"), "'it''s'");
        assert_eq!(db.quote_literal("a\\b"), "'a\\b'");
    }
}
