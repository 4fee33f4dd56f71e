//! Zip packing and unpacking of the content tree.
//!
//! Directories are walked self-first in name order so empty directories
//! survive a round trip. Symlinks to files are followed; symlinks to
//! directories and broken symlinks are skipped.

use super::manifest::{Manifest, CONTENT_PREFIX, DATABASE_ENTRY, MANIFEST_ENTRY};
use crate::{Result, SnapshotError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub files: usize,
    pub dirs: usize,
    pub skipped: usize,
}

/// What a walk entry resolves to once symlinks are considered.
enum EntryKind {
    Dir,
    File,
    Skip,
}

fn entry_kind(entry: &DirEntry) -> io::Result<EntryKind> {
    let file_type = entry.file_type();
    if file_type.is_dir() {
        return Ok(EntryKind::Dir);
    }
    if file_type.is_symlink() {
        return Ok(match fs::metadata(entry.path()) {
            Ok(target) if target.is_dir() => EntryKind::Skip,
            Ok(_) => EntryKind::File,
            Err(_) => EntryKind::Skip,
        });
    }
    Ok(EntryKind::File)
}

fn archive_name(prefix: &str, relative: &Path) -> String {
    let relative = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    let base = prefix.trim_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, _) => relative,
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Archive being written. Lives at `<final>.part` until [`finish`](Self::finish)
/// renames it into place; dropped unfinished, the partial file is removed.
pub struct ArchiveWriter {
    zip: Option<ZipWriter<File>>,
    part_path: PathBuf,
    final_path: PathBuf,
    file_options: SimpleFileOptions,
    dir_options: SimpleFileOptions,
}

impl ArchiveWriter {
    pub fn create(final_path: &Path) -> Result<Self> {
        let mut part = final_path.as_os_str().to_owned();
        part.push(".part");
        let part_path = PathBuf::from(part);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .map_err(|e| SnapshotError::Archive(format!("Unable to initialize archive {}: {e}", part_path.display())))?;

        Ok(Self {
            zip: Some(ZipWriter::new(file)),
            part_path,
            final_path: final_path.to_path_buf(),
            file_options: SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .large_file(true),
            dir_options: SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
        })
    }

    fn zip(&mut self) -> Result<&mut ZipWriter<File>> {
        self.zip
            .as_mut()
            .ok_or_else(|| SnapshotError::Archive("archive already finished".into()))
    }

    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let options = self.file_options;
        let zip = self.zip()?;
        zip.start_file(name, options)
            .map_err(|e| SnapshotError::Archive(format!("Unable to add {name}: {e}")))?;
        zip.write_all(data)?;
        Ok(())
    }

    /// Stream a file from disk into the archive.
    pub fn add_file(&mut self, name: &str, path: &Path) -> Result<u64> {
        let options = self.file_options;
        let source = File::open(path)
            .map_err(|e| SnapshotError::Archive(format!("Failed to archive file {}: {e}", path.display())))?;
        let zip = self.zip()?;
        zip.start_file(name, options)
            .map_err(|e| SnapshotError::Archive(format!("Failed to archive file {}: {e}", path.display())))?;
        io::copy(&mut BufReader::new(source), zip)
            .map_err(|e| SnapshotError::Archive(format!("Failed to archive file {}: {e}", path.display())))
    }

    fn add_dir_entry(&mut self, name: &str) -> Result<()> {
        let options = self.dir_options;
        self.zip()?
            .add_directory(name, options)
            .map_err(|e| SnapshotError::Archive(format!("Unable to add directory {name}: {e}")))
    }

    /// Add `source` under `prefix`, skipping everything beneath `exclude`.
    /// The first file that cannot be read aborts with its path.
    pub fn add_directory(&mut self, source: &Path, prefix: &str, exclude: Option<&Path>) -> Result<DirectoryStats> {
        let mut stats = DirectoryStats::default();
        if !source.is_dir() {
            tracing::warn!(source = %source.display(), "Directory archiving skipped - source not found");
            // Keep the prefix so the archive still carries the tree it declares.
            let base = archive_name(prefix, Path::new(""));
            if !base.is_empty() {
                self.add_dir_entry(&base)?;
            }
            return Ok(stats);
        }

        let root = source.canonicalize()?;
        let exclude = exclude.and_then(|p| p.canonicalize().ok());
        tracing::info!(source = %root.display(), target = prefix, "Starting directory archiving");

        let walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match &exclude {
                Some(excluded) if entry.path().starts_with(excluded) => false,
                _ => true,
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                SnapshotError::Archive(format!("Failed to archive {path}: {e}"))
            })?;
            let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let name = archive_name(prefix, relative);

            match entry_kind(&entry)? {
                EntryKind::Dir => {
                    if !name.is_empty() {
                        self.add_dir_entry(&name)?;
                    }
                    stats.dirs += 1;
                }
                EntryKind::File => {
                    self.add_file(&name, entry.path())?;
                    stats.files += 1;
                    if stats.files % PROGRESS_EVERY == 0 {
                        tracing::info!(files_added = stats.files, dirs_added = stats.dirs, "Archiving progress");
                    }
                }
                EntryKind::Skip => stats.skipped += 1,
            }
        }

        tracing::info!(
            files_added = stats.files,
            dirs_added = stats.dirs,
            files_skipped = stats.skipped,
            "Directory archiving completed"
        );
        Ok(stats)
    }

    /// Finalize the container and move it to its final name.
    pub fn finish(mut self) -> Result<PathBuf> {
        let zip = self
            .zip
            .take()
            .ok_or_else(|| SnapshotError::Archive("archive already finished".into()))?;
        let file = zip
            .finish()
            .map_err(|e| SnapshotError::Archive(format!("Failed to finalize backup archive: {e}")))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.part_path, &self.final_path)
            .map_err(|e| SnapshotError::io_at("Unable to finalize archive", &self.final_path, e))?;
        Ok(self.final_path.clone())
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if self.zip.take().is_some() {
            let _ = fs::remove_file(&self.part_path);
        }
    }
}

/// Overlay-copy `source` onto `destination`, creating directories on demand
/// and overwriting files that already exist.
pub fn copy_directory(source: &Path, destination: &Path) -> Result<DirectoryStats> {
    let mut stats = DirectoryStats::default();
    if !source.is_dir() {
        tracing::warn!(source = %source.display(), "Directory copying skipped - source not found");
        return Ok(stats);
    }
    tracing::info!(
        source = %source.display(),
        destination = %destination.display(),
        "Starting directory copy"
    );

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
            SnapshotError::Archive(format!("Unable to read {path}: {e}"))
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = destination.join(relative);

        match entry_kind(&entry)? {
            EntryKind::Dir => {
                if !target.is_dir() {
                    fs::create_dir_all(&target)
                        .map_err(|e| SnapshotError::io_at("Unable to create directory", &target, e))?;
                    stats.dirs += 1;
                }
            }
            EntryKind::File => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| SnapshotError::io_at("Unable to create directory", parent, e))?;
                }
                fs::copy(entry.path(), &target).map_err(|e| SnapshotError::IoPath {
                    context: format!(
                        "Unable to copy {} to {}",
                        entry.path().display(),
                        target.display()
                    ),
                    source: e,
                })?;
                stats.files += 1;
                if stats.files % PROGRESS_EVERY == 0 {
                    tracing::info!(files_copied = stats.files, dirs_created = stats.dirs, "Copy progress");
                }
            }
            EntryKind::Skip => stats.skipped += 1,
        }
    }

    tracing::info!(files_copied = stats.files, dirs_created = stats.dirs, "Directory copy completed");
    Ok(stats)
}

pub struct ArchiveReader {
    zip: ZipArchive<File>,
    path: PathBuf,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| SnapshotError::Archive(format!("Unable to open archive {}: {e}", path.display())))?;
        let zip = ZipArchive::new(file)
            .map_err(|e| SnapshotError::Archive(format!("Unable to open archive {}: {e}", path.display())))?;
        Ok(Self {
            zip,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.zip.file_names().map(String::from).collect()
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.zip.index_for_name(name).is_some()
    }

    /// Whether any entry lives under `prefix/`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        self.zip.file_names().any(|n| n.starts_with(&dir))
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut entry = self
            .zip
            .by_name(name)
            .map_err(|e| SnapshotError::Archive(format!("{name} missing from {}: {e}", self.path.display())))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }

    pub fn read_manifest(&mut self) -> Result<Manifest> {
        if !self.has_entry(MANIFEST_ENTRY) {
            return Err(SnapshotError::Manifest(format!(
                "{MANIFEST_ENTRY} missing from {}",
                self.path.display()
            )));
        }
        Manifest::from_json(&self.read_entry(MANIFEST_ENTRY)?)
    }

    /// Every payload the manifest declares must be present.
    pub fn verify_payloads(&self, manifest: &Manifest) -> Result<()> {
        if manifest.include_database && !self.has_entry(DATABASE_ENTRY) {
            return Err(SnapshotError::Manifest(format!(
                "archive declares a database but has no {DATABASE_ENTRY}"
            )));
        }
        if manifest.include_files && !self.has_prefix(CONTENT_PREFIX) {
            return Err(SnapshotError::Manifest(format!(
                "archive declares files but has no {CONTENT_PREFIX}/ tree"
            )));
        }
        Ok(())
    }

    /// Unpack everything into `destination`. Entries whose names would land
    /// outside it are rejected.
    pub fn extract(&mut self, destination: &Path) -> Result<usize> {
        fs::create_dir_all(destination)?;
        let mut written = 0;
        for i in 0..self.zip.len() {
            let mut entry = self
                .zip
                .by_index(i)
                .map_err(|e| SnapshotError::Archive(format!("Unable to read entry {i}: {e}")))?;
            let Some(relative) = entry.enclosed_name() else {
                return Err(SnapshotError::Archive(format!(
                    "refusing to extract unsafe entry {}",
                    entry.name()
                )));
            };
            let target = destination.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&target)
                .map_err(|e| SnapshotError::io_at("Unable to extract", &target, e))?;
            io::copy(&mut entry, &mut out)?;
            written += 1;
        }
        tracing::debug!(archive = %self.path.display(), files = written, "Archive extracted");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn content_tree(root: &Path) {
        fs::create_dir_all(root.join("uploads/2024")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::create_dir_all(root.join("snapshots/archives")).unwrap();
        fs::write(root.join("index.php"), b"<?php").unwrap();
        fs::write(root.join("uploads/2024/a.txt"), b"hello").unwrap();
        fs::write(root.join("snapshots/archives/old.zip"), b"zip").unwrap();
    }

    #[test]
    fn test_add_directory_self_first_with_exclusion() {
        let dir = TempDir::new().unwrap();
        let content = dir.path().join("content");
        content_tree(&content);
        let target = dir.path().join("out.zip");

        let mut writer = ArchiveWriter::create(&target).unwrap();
        let stats = writer
            .add_directory(&content, CONTENT_PREFIX, Some(&content.join("snapshots")))
            .unwrap();
        let path = writer.finish().unwrap();
        assert_eq!(path, target);
        assert!(!dir.path().join("out.zip.part").exists());
        assert_eq!(stats.files, 2);

        let reader = ArchiveReader::open(&target).unwrap();
        let names = reader.entry_names();
        assert!(names.contains(&"wp-content/".to_string()));
        assert!(names.contains(&"wp-content/empty/".to_string()));
        assert!(names.contains(&"wp-content/uploads/2024/a.txt".to_string()));
        assert!(!names.iter().any(|n| n.contains("snapshots")));

        let dir_pos = names.iter().position(|n| n == "wp-content/uploads/2024/").unwrap();
        let file_pos = names.iter().position(|n| n == "wp-content/uploads/2024/a.txt").unwrap();
        assert!(dir_pos < file_pos);
    }

    #[test]
    fn test_unfinished_writer_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.zip");
        {
            let mut writer = ArchiveWriter::create(&target).unwrap();
            writer.add_bytes("x.txt", b"x").unwrap();
        }
        assert!(!target.exists());
        assert!(!dir.path().join("out.zip.part").exists());
    }

    #[test]
    fn test_copy_directory_overlays() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        content_tree(&src);
        fs::create_dir_all(dst.join("uploads/2024")).unwrap();
        fs::write(dst.join("uploads/2024/a.txt"), b"old").unwrap();
        fs::write(dst.join("keep.txt"), b"untouched").unwrap();

        let stats = copy_directory(&src, &dst).unwrap();
        assert_eq!(stats.files, 3);
        assert_eq!(fs::read(dst.join("uploads/2024/a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dst.join("keep.txt")).unwrap(), b"untouched");
        assert!(dst.join("empty").is_dir());
    }

    #[test]
    fn test_reader_manifest_and_extract() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("db.zip");
        let mut writer = ArchiveWriter::create(&target).unwrap();
        writer.add_bytes(DATABASE_ENTRY, b"SELECT 1;\n").unwrap();
        writer
            .add_bytes(
                MANIFEST_ENTRY,
                br#"{"created_at_gmt":"2024-06-01T12:00:00Z","include_files":true,"include_database":true}"#,
            )
            .unwrap();
        writer.finish().unwrap();

        let mut reader = ArchiveReader::open(&target).unwrap();
        let manifest = reader.read_manifest().unwrap();
        // Files are declared but no wp-content/ tree was written.
        assert!(reader.verify_payloads(&manifest).is_err());

        let out = dir.path().join("x");
        assert_eq!(reader.extract(&out).unwrap(), 2);
        assert_eq!(fs::read(out.join(DATABASE_ENTRY)).unwrap(), b"SELECT 1;\n");
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("bare.zip");
        let mut writer = ArchiveWriter::create(&target).unwrap();
        writer.add_bytes("other.txt", b"x").unwrap();
        writer.finish().unwrap();

        let err = ArchiveReader::open(&target).unwrap().read_manifest().unwrap_err();
        assert!(matches!(err, SnapshotError::Manifest(_)));
    }
}
