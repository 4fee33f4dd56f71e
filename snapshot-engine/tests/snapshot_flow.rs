//! End-to-end backup and restore against SQLite files on disk.

use chrono::{Duration, TimeZone, Utc};
use snapshot_engine::archive::{ArchiveReader, ArchiveWriter, DATABASE_ENTRY, MANIFEST_ENTRY};
use snapshot_engine::clock::ManualClock;
use snapshot_engine::db::{Database, SqliteDatabase};
use snapshot_engine::export::{ExportSettings, Exporter, NativeDump};
use snapshot_engine::fetch::HttpFetcher;
use snapshot_engine::import::Importer;
use snapshot_engine::lock::OperationKind;
use snapshot_engine::replace::replace_value;
use snapshot_engine::services::{BackupOptions, RestoreRequest, RestoreStage};
use snapshot_engine::transient::SqliteTransientStore;
use snapshot_engine::{Config, Engine, EngineParts, FailureOutcome, SnapshotError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const SOURCE_URL: &str = "http://source.test";
const TARGET_URL: &str = "https://target.test";

const SITE_SCHEMA: &str = r#"
CREATE TABLE wp_options (option_id INTEGER PRIMARY KEY, option_name TEXT UNIQUE, option_value TEXT, autoload TEXT);
CREATE TABLE wp_users (ID INTEGER PRIMARY KEY, user_login TEXT, user_url TEXT);
CREATE TABLE wp_usermeta (umeta_id INTEGER PRIMARY KEY, user_id INTEGER, meta_key TEXT, meta_value TEXT);
CREATE TABLE wp_posts (ID INTEGER PRIMARY KEY, post_title TEXT, post_content TEXT, guid TEXT);
CREATE TABLE wp_postmeta (meta_id INTEGER PRIMARY KEY, post_id INTEGER, meta_key TEXT, meta_value TEXT);
CREATE INDEX wp_postmeta_post ON wp_postmeta (post_id);
INSERT INTO wp_options VALUES (1, 'siteurl', 'http://source.test', 'yes');
INSERT INTO wp_options VALUES (2, 'home', 'http://source.test', 'yes');
INSERT INTO wp_options VALUES (3, 'widget', 'a:1:{s:3:"url";s:23:"http://source.test/page";}', 'no');
INSERT INTO wp_users VALUES (1, 'admin', 'https://example.org/me');
INSERT INTO wp_usermeta VALUES (1, 1, 'nickname', 'admin');
INSERT INTO wp_posts VALUES (1, 'Hello', 'Line one;
line two with a quote '' and http://source.test/hello', 'http://source.test/?p=1');
INSERT INTO wp_posts VALUES (2, 'Empty', NULL, 'http://source.test/?p=2');
INSERT INTO wp_postmeta VALUES (1, 1, '_price', '00120');
"#;

/// A trigger and views on top of the site tables. The log already holds
/// the row the trigger wrote for post 3.
const SCHEMA_OBJECTS: &str = r#"
CREATE TABLE wp_post_log (post_id INTEGER, note TEXT);
CREATE TRIGGER wp_posts_log AFTER INSERT ON wp_posts
BEGIN
  INSERT INTO wp_post_log VALUES (NEW.ID, 'created; ' || CASE WHEN NEW.post_content IS NULL THEN 'empty' ELSE 'full' END);
END;
CREATE VIEW wp_post_titles AS SELECT ID, post_title FROM wp_posts;
CREATE VIEW wp_post_counts AS SELECT COUNT(*) AS total FROM wp_post_titles;
INSERT INTO wp_posts VALUES (3, 'Logged', 'body', 'http://source.test/?p=3');
"#;

struct Site {
    dir: TempDir,
    clock: ManualClock,
    engine: Engine,
}

impl Site {
    fn new(url: &str) -> Self {
        Self::with_native_dump(url, false)
    }

    fn with_native_dump(url: &str, native_dump: bool) -> Self {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap());
        let engine = build_engine_with(dir.path(), url, &clock, native_dump);
        Self { dir, clock, engine }
    }

    fn seeded() -> Self {
        Self::seeded_with(false)
    }

    fn seeded_with(native_dump: bool) -> Self {
        let site = Self::with_native_dump(SOURCE_URL, native_dump);
        site.db().execute_script(SITE_SCHEMA).unwrap();
        let uploads = site.content_dir().join("uploads/2024");
        fs::create_dir_all(&uploads).unwrap();
        fs::write(uploads.join("photo.jpg"), b"jpeg bytes").unwrap();
        fs::write(site.content_dir().join("index.php"), b"<?php // silence").unwrap();
        site
    }

    fn content_dir(&self) -> PathBuf {
        self.dir.path().join("content")
    }

    fn db(&self) -> SqliteDatabase {
        SqliteDatabase::open(&self.dir.path().join("site.db")).unwrap()
    }

    fn tick(&self) {
        self.clock.advance(Duration::minutes(1));
    }
}

fn build_engine(root: &Path, url: &str, clock: &ManualClock) -> Engine {
    build_engine_with(root, url, clock, false)
}

fn build_engine_with(root: &Path, url: &str, clock: &ManualClock, native_dump: bool) -> Engine {
    let mut config = Config::default();
    config.site.site_url = url.to_string();
    config.site.home_url = url.to_string();
    config.site.content_dir = root.join("content");
    config.database.path = root.join("site.db");
    // Storage lives inside the content tree, as on a real site.
    config.storage.base_dir = root.join("content/site-snapshots");
    config.export.native_dump = native_dump;

    fs::create_dir_all(&config.storage.base_dir).unwrap();
    let parts = EngineParts {
        db: Arc::new(SqliteDatabase::open(&config.database.path).unwrap()),
        store: Arc::new(SqliteTransientStore::open(&config.storage.base_dir.join("state.db")).unwrap()),
        clock: Arc::new(clock.clone()),
        fetcher: Arc::new(HttpFetcher::new(std::time::Duration::from_secs(5)).unwrap()),
    };
    Engine::with_parts(config, parts)
}

/// Every row of every table, rendered as text, ordered by table name and
/// first column.
fn snapshot(db: &dyn Database) -> Vec<(String, Vec<Vec<String>>)> {
    let mut tables = db.list_tables(None).unwrap();
    tables.sort();
    tables
        .into_iter()
        .map(|table| {
            let rows = db
                .query(&format!("SELECT * FROM {} ORDER BY 1", db.quote_identifier(&table)), &[])
                .unwrap()
                .rows
                .into_iter()
                .map(|row| row.iter().map(|v| v.to_string()).collect())
                .collect();
            (table, rows)
        })
        .collect()
}

/// Names of views and triggers, sorted.
fn schema_objects(db: &dyn Database) -> Vec<String> {
    let mut names: Vec<String> = db.schema_objects().unwrap().into_iter().map(|o| o.name).collect();
    names.sort();
    names
}

fn count(db: &dyn Database, sql: &str) -> i64 {
    db.query(sql, &[]).unwrap().rows[0][0].as_integer().unwrap()
}

/// Copy of `good` whose dump fails after every table has been replaced.
fn broken_copy(site: &Site, good: &Path) -> PathBuf {
    let mut reader = ArchiveReader::open(good).unwrap();
    let mut sql = reader.read_entry(DATABASE_ENTRY).unwrap();
    sql.extend_from_slice(b"\nINSERT INTO wp_missing VALUES (1);\n");
    let mut manifest = reader.read_manifest().unwrap();
    manifest.id = "broken".into();
    manifest.include_files = false;
    let broken = site.engine.paths().archives_dir().join("broken.zip");
    let mut writer = ArchiveWriter::create(&broken).unwrap();
    writer.add_bytes(DATABASE_ENTRY, &sql).unwrap();
    writer.add_bytes(MANIFEST_ENTRY, &manifest.to_json().unwrap()).unwrap();
    writer.finish().unwrap()
}

fn file_only(options: BackupOptions) -> BackupOptions {
    BackupOptions {
        include_database: false,
        ..options
    }
}

#[test]
fn test_round_trip_onto_fresh_site_rewrites_base_url() {
    let source = Site::seeded();
    let expected: Vec<(String, Vec<Vec<String>>)> = snapshot(&source.db())
        .into_iter()
        .map(|(table, rows)| {
            let rows = rows
                .into_iter()
                .map(|row| {
                    row.into_iter()
                        .map(|v| replace_value(&v, SOURCE_URL, TARGET_URL).unwrap_or(v))
                        .collect()
                })
                .collect();
            (table, rows)
        })
        .collect();

    let backup = source.engine.backups().create(&BackupOptions::default()).unwrap();
    assert_eq!(backup.manifest.tables.len(), 5);

    let target = Site::new(TARGET_URL);
    let ingested = target.engine.backups().ingest(&backup.path, "imported").unwrap();
    target.tick();

    let report = target
        .engine
        .restores()
        .restore(&RestoreRequest::from_path(&ingested.path))
        .unwrap();

    assert_eq!(snapshot(&target.db()), expected);
    assert_eq!(
        target
            .db()
            .query("SELECT option_value FROM wp_options WHERE option_name = 'widget'", &[])
            .unwrap()
            .rows[0][0]
            .to_string(),
        r#"a:1:{s:3:"url";s:24:"https://target.test/page";}"#
    );
    assert_eq!(
        fs::read(target.content_dir().join("uploads/2024/photo.jpg")).unwrap(),
        b"jpeg bytes"
    );
    assert_eq!(
        report.stages,
        vec![
            RestoreStage::LockAcquired,
            RestoreStage::SafetyBackupTaken,
            RestoreStage::Extracted,
            RestoreStage::DatabaseImported,
            RestoreStage::FilesRestored,
            RestoreStage::Committed,
        ]
    );
}

#[test]
fn test_database_only_backup_has_exactly_manifest_and_dump() {
    let site = Site::new(SOURCE_URL);
    site.db()
        .execute_script(
            "CREATE TABLE wp_a (id INTEGER PRIMARY KEY, v TEXT);
             CREATE TABLE wp_b (id INTEGER PRIMARY KEY, v TEXT);
             CREATE TABLE wp_c (id INTEGER PRIMARY KEY, v TEXT);
             INSERT INTO wp_a VALUES (1, 'x');",
        )
        .unwrap();

    let summary = site
        .engine
        .backups()
        .create(&BackupOptions {
            include_files: false,
            ..BackupOptions::default()
        })
        .unwrap();

    let mut names = ArchiveReader::open(&summary.path).unwrap().entry_names();
    names.sort();
    assert_eq!(names, vec![DATABASE_ENTRY.to_string(), MANIFEST_ENTRY.to_string()]);

    let mut tables = summary.manifest.tables.clone();
    tables.sort();
    assert_eq!(tables, vec!["wp_a", "wp_b", "wp_c"]);
    assert!(!summary.manifest.include_files);
}

#[test]
fn test_retention_removes_oldest_archives() {
    let site = Site::seeded();
    let mut created = Vec::new();
    for _ in 0..4 {
        let summary = site
            .engine
            .backups()
            .create(&file_only(BackupOptions {
                retention: Some(0),
                ..BackupOptions::default()
            }))
            .unwrap();
        created.push(summary.manifest.id);
        site.tick();
    }

    let newest = site
        .engine
        .backups()
        .create(&file_only(BackupOptions {
            retention: Some(2),
            ..BackupOptions::default()
        }))
        .unwrap();

    let remaining: Vec<String> = site
        .engine
        .backups()
        .list_archives()
        .unwrap()
        .into_iter()
        .map(|r| r.manifest.id)
        .collect();
    assert_eq!(remaining, vec![newest.manifest.id, created[3].clone()]);
}

#[test]
fn test_ten_thousand_rows_export_in_twenty_batches() {
    let source = SqliteDatabase::in_memory().unwrap();
    source
        .execute_script(
            "CREATE TABLE wp_items (id INTEGER PRIMARY KEY, name TEXT, price REAL);
             WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 10000)
             INSERT INTO wp_items SELECT x, 'item ' || x, x * 1.25 FROM n;",
        )
        .unwrap();

    let exporter = Exporter::new(&ExportSettings {
        chunk_size: 500,
        native_dump: false,
        ..ExportSettings::default()
    });
    let mut dump = Vec::new();
    let tables = exporter.export(&source, &mut dump).unwrap();
    assert_eq!(tables, vec!["wp_items".to_string()]);

    let text = String::from_utf8(dump.clone()).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with("INSERT INTO")).count(), 20);

    let target = SqliteDatabase::in_memory().unwrap();
    let stats = Importer::new(&target, "wp_")
        .import(dump.as_slice(), &tables, true)
        .unwrap();
    assert!(stats.statements >= 22);
    assert_eq!(snapshot(&target), snapshot(&source));
}

#[test]
fn test_failed_import_rolls_back_to_pre_restore_state() {
    let site = Site::seeded();
    let good = site.engine.backups().create(&BackupOptions::default()).unwrap();
    site.tick();

    // Build an archive whose dump breaks halfway through.
    broken_copy(&site, &good.path);

    // Diverge from the archive so a rollback is observable.
    site.db()
        .execute_script("INSERT INTO wp_posts VALUES (3, 'Draft', 'after backup', 'http://source.test/?p=3');")
        .unwrap();
    let before = snapshot(&site.db());

    let err = site
        .engine
        .restores()
        .restore(&RestoreRequest::from_id("broken"))
        .unwrap_err();

    assert_eq!(err.outcome(), FailureOutcome::RolledBack);
    match &err {
        SnapshotError::RolledBack { stage, source, .. } => {
            assert_eq!(*stage, RestoreStage::DatabaseImported);
            assert!(matches!(**source, SnapshotError::Import { .. }));
        }
        other => panic!("expected a rolled back restore, got {other:?}"),
    }
    assert!(err.to_string().contains("restored to its previous state"));
    assert_eq!(snapshot(&site.db()), before);
    assert!(!site.engine.locks().is_locked(OperationKind::Restore).unwrap());
}

#[test]
fn test_paths_outside_archive_root_are_rejected() {
    let site = Site::seeded();
    let summary = site
        .engine
        .backups()
        .create(&file_only(BackupOptions::default()))
        .unwrap();
    let backups = site.engine.backups();

    assert!(backups.validate_path(Path::new("../../etc/passwd")).is_none());
    assert!(backups.validate_path(Path::new("../state.db")).is_none());
    assert!(backups.validate_path(&site.content_dir().join("index.php")).is_none());
    assert!(backups.validate_path(&summary.path).is_some());

    #[cfg(unix)]
    {
        let link = site.engine.paths().archives_dir().join("escape.zip");
        std::os::unix::fs::symlink(site.content_dir().join("index.php"), &link).unwrap();
        assert!(backups.validate_path(&link).is_none());
    }
}

#[test]
fn test_lock_is_shared_between_engines_on_one_state_store() {
    let site = Site::seeded();
    let other = build_engine(site.dir.path(), SOURCE_URL, &site.clock);

    let held = other
        .locks()
        .acquire(OperationKind::Restore, Duration::hours(1))
        .unwrap();
    let err = site.engine.backups().create(&BackupOptions::default()).unwrap_err();
    assert!(matches!(err, SnapshotError::Busy { held_by: OperationKind::Restore }));
    assert_eq!(err.outcome(), FailureOutcome::NothingChanged);

    held.release().unwrap();
    assert!(site.engine.backups().create(&BackupOptions::default()).is_ok());
}

#[test]
fn test_download_token_is_single_use() {
    let site = Site::seeded();
    let summary = site
        .engine
        .backups()
        .create(&file_only(BackupOptions::default()))
        .unwrap();

    assert!(summary.download_url.ends_with(&summary.download_token));
    let first = site.engine.backups().redeem_download(&summary.download_token).unwrap();
    assert!(first.is_some());
    assert!(site
        .engine
        .backups()
        .redeem_download(&summary.download_token)
        .unwrap()
        .is_none());
}

/// Backup, in-place restore and rollback on a site that has a trigger and
/// views, with the given dump strategy.
fn round_trip_with_views_and_triggers(native_dump: bool) {
    let site = Site::seeded_with(native_dump);
    site.db().execute_script(SCHEMA_OBJECTS).unwrap();
    let expected = snapshot(&site.db());
    let objects = schema_objects(&site.db());
    assert_eq!(objects, vec!["wp_post_counts", "wp_post_titles", "wp_posts_log"]);
    assert_eq!(count(&site.db(), "SELECT COUNT(*) FROM wp_post_log"), 1);

    let backup = site.engine.backups().create(&BackupOptions::default()).unwrap();
    let dump = ArchiveReader::open(&backup.path).unwrap().read_entry(DATABASE_ENTRY).unwrap();
    let dump = String::from_utf8(dump).unwrap();
    assert_eq!(dump.contains("dump (sqlite3)"), native_dump);
    site.tick();

    // Diverge, then restore over the live database that still has every view.
    site.db()
        .execute_script("INSERT INTO wp_posts VALUES (4, 'Later', 'after backup', 'http://source.test/?p=4');")
        .unwrap();
    let report = site
        .engine
        .restores()
        .restore(&RestoreRequest::from_id(&backup.manifest.id))
        .unwrap();
    assert_eq!(report.stages.last(), Some(&RestoreStage::Committed));

    // The trigger did not fire while rows were replayed.
    assert_eq!(snapshot(&site.db()), expected);
    assert_eq!(schema_objects(&site.db()), objects);
    assert_eq!(count(&site.db(), "SELECT total FROM wp_post_counts"), 3);
    site.db()
        .execute_script("INSERT INTO wp_posts VALUES (5, 'New', NULL, 'http://source.test/?p=5');")
        .unwrap();
    assert_eq!(count(&site.db(), "SELECT COUNT(*) FROM wp_post_log"), 2);
    let before = snapshot(&site.db());
    site.tick();

    // A failing restore replays the safety snapshot over the same objects.
    broken_copy(&site, &backup.path);
    let err = site
        .engine
        .restores()
        .restore(&RestoreRequest::from_id("broken"))
        .unwrap_err();
    assert_eq!(err.outcome(), FailureOutcome::RolledBack);
    assert_eq!(snapshot(&site.db()), before);
    assert_eq!(schema_objects(&site.db()), objects);
    assert_eq!(count(&site.db(), "SELECT total FROM wp_post_counts"), 4);
}

#[test]
fn test_streaming_dump_round_trip_with_views_and_triggers() {
    round_trip_with_views_and_triggers(false);
}

#[test]
fn test_native_dump_round_trip_with_views_and_triggers() {
    if !NativeDump::new("sqlite3").probe() {
        eprintln!("sqlite3 not installed, skipping native dump round trip");
        return;
    }
    round_trip_with_views_and_triggers(true);
}
