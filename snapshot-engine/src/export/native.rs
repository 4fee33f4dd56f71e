//! Dump through the database engine's own command-line tool.

use super::DumpStrategy;
use crate::db::{Database, DbError};
use crate::{Result, SnapshotError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

/// Probe results per tool, once per process.
static PROBES: OnceLock<Mutex<HashMap<String, bool>>> = OnceLock::new();

pub struct NativeDump {
    tool: String,
}

impl NativeDump {
    pub fn new(tool: &str) -> Self {
        Self {
            tool: tool.to_string(),
        }
    }

    /// Whether the tool runs at all. Cached after the first call.
    pub fn probe(&self) -> bool {
        let probes = PROBES.get_or_init(|| Mutex::new(HashMap::new()));
        if let Some(found) = probes.lock().get(&self.tool) {
            return *found;
        }

        let found = Command::new(&self.tool)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);

        if !found {
            tracing::info!(tool = %self.tool, "Native dump tool not available, using streaming dump");
        }
        probes.lock().insert(self.tool.clone(), found);
        found
    }
}

impl DumpStrategy for NativeDump {
    fn name(&self) -> &'static str {
        "native"
    }

    fn available(&self, db: &dyn Database) -> bool {
        db.native_dump_source().is_some() && self.probe()
    }

    fn dump(&self, db: &dyn Database, tables: &[String], out: &mut dyn Write) -> Result<()> {
        let source = db
            .native_dump_source()
            .ok_or_else(|| SnapshotError::Config("database has no on-disk source".into()))?;

        // The tool emits plain CREATE statements; make the stream replace
        // whatever the target already holds. Views and triggers come last in
        // the tool's output, after the data.
        writeln!(out, "-- Site snapshot database dump ({})", self.tool)?;
        for line in db.dump_preamble() {
            writeln!(out, "{line}")?;
        }
        for object in db.schema_objects()? {
            writeln!(out, "{};", db.drop_object_statement(&object))?;
        }
        for table in tables {
            writeln!(out, "DROP TABLE IF EXISTS {};", db.quote_identifier(table))?;
        }

        let mut child = Command::new(&self.tool)
            .arg(&source)
            .arg(".dump")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SnapshotError::io_at("Unable to start dump tool for", &source, e))?;

        let copied = match child.stdout.take() {
            Some(mut stdout) => std::io::copy(&mut stdout, out)?,
            None => 0,
        };

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let status = child.wait()?;
        if !status.success() {
            return Err(DbError::new(format!(
                "{} exited with {status}: {}",
                self.tool,
                stderr.trim()
            ))
            .into());
        }

        writeln!(out)?;
        for line in db.dump_postamble() {
            writeln!(out, "{line}")?;
        }

        tracing::info!(tool = %self.tool, bytes = copied, tables = tables.len(), "Native dump complete");
        Ok(())
    }
}
