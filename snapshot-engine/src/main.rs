//! Site Snapshot - command line entry point
//!
//! Creates, lists and restores site snapshots against the configured site.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use snapshot_engine::lock::OperationKind;
use snapshot_engine::services::{BackupOptions, RestoreRequest};
use snapshot_engine::{utils, Config, Engine, FailureOutcome};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "site-snapshot", author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new snapshot
    Backup {
        /// Label appended to the archive name
        #[arg(long, default_value = "full-site")]
        label: String,

        /// Archives to keep afterwards (0 keeps everything)
        #[arg(long)]
        retention: Option<usize>,

        /// Leave the content directory out
        #[arg(long)]
        skip_files: bool,

        /// Leave the database out
        #[arg(long)]
        skip_db: bool,
    },

    /// Restore a snapshot by id, path or URL
    Restore {
        /// Archive id (file name without .zip)
        archive: Option<String>,

        #[arg(long, conflicts_with_all = ["archive", "path", "url"])]
        id: Option<String>,

        /// Archive file; files outside the archive directory are imported first
        #[arg(long, conflicts_with_all = ["archive", "url"])]
        path: Option<PathBuf>,

        /// Fetch the archive from a URL
        #[arg(long, conflicts_with = "archive")]
        url: Option<String>,

        /// Keep existing tables instead of dropping them before import
        #[arg(long)]
        keep_tables: bool,

        /// Skip the safety backup (no rollback on failure)
        #[arg(long)]
        no_backup: bool,
    },

    /// List archives, newest first
    List,

    /// Delete an archive by id
    Delete { id: String },

    /// Show the current operation lock
    Locks,

    /// Force-clear the lock held by an operation kind
    Unlock { kind: OperationKind },

    /// Purge expired tokens, enforce retention and clean temp files
    Housekeeping,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    let log_dir = config.log.file.then(|| config.storage.base_dir.join("logs"));
    utils::logger::init(&config.log.level, log_dir.as_deref())?;

    tracing::debug!("Starting site-snapshot v{}", env!("CARGO_PKG_VERSION"));
    let engine = Engine::from_config(config)?;

    match args.command {
        Command::Backup {
            label,
            retention,
            skip_files,
            skip_db,
        } => {
            let summary = engine.backups().create(&BackupOptions {
                label,
                include_files: !skip_files,
                include_database: !skip_db,
                retention,
            })?;
            println!("Backup created: {}", summary.path.display());
            println!("  id:       {}", summary.manifest.id);
            println!("  size:     {} bytes", summary.filesize);
            println!("  sha256:   {}", summary.checksum);
            println!("  tables:   {}", summary.manifest.tables.len());
            println!("  download: {}", summary.download_url);
        }

        Command::Restore {
            archive,
            id,
            path,
            url,
            keep_tables,
            no_backup,
        } => {
            let mut request = match (archive.or(id), path, url) {
                (Some(id), _, _) => RestoreRequest::from_id(id),
                (None, Some(path), _) => {
                    let path = match engine.backups().validate_path(&path) {
                        Some(inside) => inside,
                        None => engine.backups().ingest(&path, "imported")?.path,
                    };
                    RestoreRequest::from_path(path)
                }
                (None, None, Some(url)) => RestoreRequest::from_url(url),
                (None, None, None) => bail!("Give an archive id, --path or --url"),
            };
            request.drop_tables = !keep_tables;
            request.safety_backup = !no_backup;

            match engine.restores().restore(&request) {
                Ok(report) => {
                    println!("Restore completed from {}", report.archive.display());
                    println!("  statements:       {}", report.statements_executed);
                    println!("  url replacements: {}", report.url_replacements);
                    if let Some(snapshot) = &report.safety_snapshot {
                        println!("  safety backup:    {}", snapshot.display());
                    }
                    if let Some(error) = &report.files_error {
                        println!("  WARNING: files were not restored: {error}");
                    }
                }
                Err(e) => {
                    match e.outcome() {
                        FailureOutcome::NothingChanged => eprintln!("Restore aborted, nothing was changed."),
                        FailureOutcome::Failed => eprintln!("Restore failed after changes were made."),
                        FailureOutcome::RolledBack => eprintln!("Restore failed; the site was rolled back."),
                        FailureOutcome::Critical => eprintln!("Restore failed and needs manual recovery."),
                    }
                    return Err(e.into());
                }
            }
        }

        Command::List => {
            let archives = engine.backups().list_archives()?;
            if archives.is_empty() {
                println!("No archives in {}", engine.paths().archives_dir().display());
            }
            for record in archives {
                let m = &record.manifest;
                let contents = match (m.include_database, m.include_files) {
                    (true, true) => "db+files",
                    (true, false) => "db",
                    _ => "files",
                };
                println!(
                    "{}  {}  {:<8}  {:>12}  {}",
                    m.created_at_gmt.format("%Y-%m-%d %H:%M:%S"),
                    m.environment,
                    contents,
                    record.filesize,
                    m.id
                );
            }
        }

        Command::Delete { id } => {
            if !engine.backups().delete(&id)? {
                bail!("Backup archive not found: {id}");
            }
            println!("Deleted {id}");
        }

        Command::Locks => match engine.locks().current()? {
            Some(marker) => println!(
                "{} lock held since {} (expires {})",
                marker.kind, marker.acquired_at, marker.expires_at
            ),
            None => println!("No operation in progress"),
        },

        Command::Unlock { kind } => {
            if engine.locks().force_release(kind)? {
                println!("Cleared {kind} lock");
            } else {
                println!("No {kind} lock was held");
            }
        }

        Command::Housekeeping => {
            let report = engine.backups().housekeeping()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
