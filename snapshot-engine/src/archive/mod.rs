//! Archive container: manifest, database dump and content tree in one zip.

pub mod archiver;
pub mod manifest;

pub use archiver::{copy_directory, ArchiveReader, ArchiveWriter, DirectoryStats};
pub use manifest::{Environment, Manifest, CONTENT_PREFIX, DATABASE_ENTRY, MANIFEST_ENTRY};

use crate::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

/// Hex SHA-256 of a file, read in a streaming fashion.
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
