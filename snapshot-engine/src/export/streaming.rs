//! Paginated SQL dump through the [`Database`] trait.
//!
//! Output per table:
//!
//! ```text
//! DROP TABLE IF EXISTS `t`;
//! CREATE TABLE `t` (...);
//! INSERT INTO `t` (`a`, `b`) VALUES
//! (1, 'x'),
//! (2, 'y');
//! ```
//!
//! One INSERT per page, so memory is bounded by the chunk size. Views and
//! triggers are dropped up front and recreated after the last table's data.

use super::{DumpStrategy, MIN_CHUNK_SIZE};
use crate::db::{ColumnInfo, Database, PageStrategy, Pager, SqlValue};
use crate::{Result, SnapshotError};
use std::io::Write;

pub struct StreamingDump {
    chunk_size: usize,
}

impl StreamingDump {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(MIN_CHUNK_SIZE),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn dump_table(&self, db: &dyn Database, table: &str, out: &mut dyn Write) -> Result<u64> {
        let create = db.create_statements(table)?;
        if create.is_empty() {
            return Err(SnapshotError::TableStructure(table.to_string()));
        }

        let quoted = db.quote_identifier(table);
        writeln!(out, "\n-- Table structure for {quoted}")?;
        writeln!(out, "DROP TABLE IF EXISTS {quoted};")?;
        for statement in &create {
            writeln!(out, "{};", statement.trim_end().trim_end_matches(';'))?;
        }

        let columns = db.columns(table)?;
        let strategy = PageStrategy::detect(db, table)?;
        let mut pager = Pager::new(db, table, strategy, self.chunk_size);
        let mut rows_written = 0u64;
        let mut header_written = false;

        while let Some(page) = pager.next_page()? {
            if !header_written {
                writeln!(out, "\n-- Data for {quoted}")?;
                header_written = true;
            }

            let column_list = page
                .columns
                .iter()
                .map(|c| db.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            // Declared types in result order, for the numeric passthrough rule.
            let types: Vec<Option<&ColumnInfo>> = page
                .columns
                .iter()
                .map(|name| columns.iter().find(|c| &c.name == name))
                .collect();

            writeln!(out, "INSERT INTO {quoted} ({column_list}) VALUES")?;
            let last = page.rows.len() - 1;
            for (i, row) in page.rows.iter().enumerate() {
                let values = row
                    .iter()
                    .zip(&types)
                    .map(|(value, column)| render_value(db, value, *column))
                    .collect::<Vec<_>>()
                    .join(", ");
                let terminator = if i == last { ";" } else { "," };
                writeln!(out, "({values}){terminator}")?;
            }
            rows_written += page.rows.len() as u64;
        }

        tracing::debug!(table, rows = rows_written, "Dumped table");
        Ok(rows_written)
    }
}

impl DumpStrategy for StreamingDump {
    fn name(&self) -> &'static str {
        "streaming"
    }

    fn available(&self, _db: &dyn Database) -> bool {
        true
    }

    fn dump(&self, db: &dyn Database, tables: &[String], out: &mut dyn Write) -> Result<()> {
        writeln!(out, "-- Site snapshot database dump")?;
        for line in db.dump_preamble() {
            writeln!(out, "{line}")?;
        }

        let objects = db.schema_objects()?;
        for object in &objects {
            writeln!(out, "{};", db.drop_object_statement(object))?;
        }

        let mut total_rows = 0u64;
        for table in tables {
            total_rows += self.dump_table(db, table, out)?;
        }

        if !objects.is_empty() {
            writeln!(out, "\n-- Views and triggers")?;
            for object in &objects {
                writeln!(out, "{};", object.sql.trim_end().trim_end_matches(';'))?;
            }
        }

        writeln!(out)?;
        for line in db.dump_postamble() {
            writeln!(out, "{line}")?;
        }

        tracing::info!(
            tables = tables.len(),
            schema_objects = objects.len(),
            rows = total_rows,
            chunk_size = self.chunk_size,
            "Streaming dump complete"
        );
        Ok(())
    }
}

/// Render one value as a SQL literal.
///
/// Numbers pass through bare. Text in a numeric column passes through bare
/// only when it is a plain number without a leading zero, so values such as
/// `007` keep their padding.
pub fn render_value(db: &dyn Database, value: &SqlValue, column: Option<&ColumnInfo>) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(r) if r.is_finite() => format!("{r:?}"),
        SqlValue::Real(_) => "NULL".to_string(),
        SqlValue::Text(s) => {
            if column.is_some_and(ColumnInfo::is_numeric) && is_plain_number(s) {
                s.clone()
            } else {
                db.quote_literal(s)
            }
        }
        SqlValue::Blob(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2 + 3);
            hex.push_str("X'");
            for b in bytes {
                hex.push_str(&format!("{b:02X}"));
            }
            hex.push('\'');
            hex
        }
    }
}

fn is_plain_number(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };

    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if int_part.len() > 1 && int_part.starts_with('0') {
        return false;
    }
    match frac_part {
        Some(f) => !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDatabase;

    fn fixture() -> SqliteDatabase {
        let db = SqliteDatabase::in_memory().unwrap();
        db.execute_script(
            "CREATE TABLE wp_options (option_id INTEGER PRIMARY KEY, option_name TEXT, option_value TEXT);
             CREATE TABLE wp_meta (meta_key TEXT, code TEXT, data BLOB);
             INSERT INTO wp_options VALUES (1, 'siteurl', 'http://old.test');
             INSERT INTO wp_options VALUES (2, 'blogname', 'It''s mine;
with a newline');
             INSERT INTO wp_meta VALUES ('zip', '00501', X'00FF');",
        )
        .unwrap();
        db
    }

    fn dump(db: &SqliteDatabase, chunk: usize) -> String {
        let tables = db.list_tables(None).unwrap();
        let mut out = Vec::new();
        StreamingDump::new(chunk).dump(db, &tables, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_dump_layout() {
        let db = fixture();
        let sql = dump(&db, 500);

        assert!(sql.contains("PRAGMA foreign_keys=OFF;"));
        assert!(sql.contains("DROP TABLE IF EXISTS `wp_options`;"));
        assert!(sql.contains("CREATE TABLE wp_options"));
        assert!(sql.contains("INSERT INTO `wp_options` (`option_id`, `option_name`, `option_value`) VALUES"));
        assert!(sql.contains("(1, 'siteurl', 'http://old.test'),"));
        assert!(sql.contains("'It''s mine;\nwith a newline');"));
        assert!(sql.trim_end().ends_with("PRAGMA foreign_keys=ON;"));
    }

    #[test]
    fn test_zero_padded_text_and_blobs() {
        let db = fixture();
        let sql = dump(&db, 500);
        assert!(sql.contains("('zip', '00501', X'00FF');"));
    }

    #[test]
    fn test_plain_number_rule() {
        assert!(is_plain_number("42"));
        assert!(is_plain_number("-3.5"));
        assert!(is_plain_number("0"));
        assert!(is_plain_number("0.25"));
        assert!(!is_plain_number("007"));
        assert!(!is_plain_number("1e5"));
        assert!(!is_plain_number("12abc"));
        assert!(!is_plain_number(""));
        assert!(!is_plain_number("3."));
    }

    #[test]
    fn test_render_value_quotes_text_in_numeric_columns() {
        let db = SqliteDatabase::in_memory().unwrap();
        let numeric = ColumnInfo {
            name: "n".into(),
            declared_type: "bigint(20)".into(),
            primary_key: false,
        };
        let text = SqlValue::Text("0042".into());
        assert_eq!(render_value(&db, &text, Some(&numeric)), "'0042'");
        assert_eq!(render_value(&db, &SqlValue::Text("42".into()), Some(&numeric)), "42");
        assert_eq!(render_value(&db, &SqlValue::Text("42".into()), None), "'42'");
        assert_eq!(render_value(&db, &SqlValue::Real(1.0), None), "1.0");
        assert_eq!(render_value(&db, &SqlValue::Null, None), "NULL");
    }

    #[test]
    fn test_triggers_and_views_follow_the_data() {
        let db = fixture();
        db.execute_script(
            "CREATE TABLE wp_log (option_id INTEGER);
             INSERT INTO wp_log VALUES (1), (2);
             CREATE TRIGGER wp_options_log AFTER INSERT ON wp_options
             BEGIN
               INSERT INTO wp_log VALUES (NEW.option_id);
               UPDATE wp_log SET option_id = CASE WHEN option_id < 0 THEN 0 ELSE option_id END;
             END;
             CREATE VIEW wp_names AS SELECT option_name FROM wp_options;",
        )
        .unwrap();

        let sql = dump(&db, 500);
        let last_insert = sql.rfind("INSERT INTO `").unwrap();
        assert!(sql.find("CREATE TRIGGER wp_options_log").unwrap() > last_insert);
        assert!(sql.find("CREATE VIEW wp_names").unwrap() > last_insert);
        assert!(sql.find("DROP VIEW IF EXISTS `wp_names`;").unwrap() < sql.find("CREATE TABLE").unwrap());

        let target = SqliteDatabase::in_memory().unwrap();
        crate::import::Importer::new(&target, "wp_")
            .import(sql.as_bytes(), &[], true)
            .unwrap();

        // The trigger did not fire while the rows were replayed.
        let log = target.query("SELECT COUNT(*) FROM wp_log", &[]).unwrap();
        assert_eq!(log.rows[0][0], SqlValue::Integer(2));
        let names = target.query("SELECT COUNT(*) FROM wp_names", &[]).unwrap();
        assert_eq!(names.rows[0][0], SqlValue::Integer(2));

        target
            .execute_script("INSERT INTO wp_options VALUES (3, 'home', 'http://old.test');")
            .unwrap();
        let log = target.query("SELECT COUNT(*) FROM wp_log", &[]).unwrap();
        assert_eq!(log.rows[0][0], SqlValue::Integer(3));

        // Replaying over the populated database replaces the view.
        crate::import::Importer::new(&target, "wp_")
            .import(sql.as_bytes(), &[], true)
            .unwrap();
    }

    #[test]
    fn test_chunk_size_has_floor() {
        assert_eq!(StreamingDump::new(10).chunk_size(), MIN_CHUNK_SIZE);
        assert_eq!(StreamingDump::new(800).chunk_size(), 800);
    }

    #[test]
    fn test_one_insert_per_page() {
        let db = SqliteDatabase::in_memory().unwrap();
        db.execute_script(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
             WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 120)
             INSERT INTO t SELECT i, 'row' || i FROM n;",
        )
        .unwrap();
        let sql = dump(&db, 50);
        assert_eq!(sql.matches("INSERT INTO `t`").count(), 3);
    }
}
