//! Local media library: the files already present in the download directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::format::format_file_size;
use crate::media::MediaFileKind;

/// A media file found in the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryEntry {
    /// Absolute path.
    pub path: PathBuf,
    /// Video or audio.
    pub kind: MediaFileKind,
    /// File size in bytes.
    pub size_bytes: u64,
}

impl LibraryEntry {
    /// File name without directories.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Human-readable size.
    #[must_use]
    pub fn size_label(&self) -> String {
        format_file_size(self.size_bytes)
    }
}

/// List every supported media file under `root`, recursively, sorted by path.
///
/// A missing root yields an empty list.
pub fn scan(root: &Path) -> Result<Vec<LibraryEntry>> {
    if !root.exists() {
        debug!("Library root {} does not exist", root.display());
        return Ok(Vec::new());
    }
    if !root.is_dir() {
        return Err(Error::FileSystem {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }

    let mut entries: Vec<LibraryEntry> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let kind = MediaFileKind::from_path(entry.path())?;
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            Some(LibraryEntry {
                path: entry.into_path(),
                kind,
                size_bytes,
            })
        })
        .collect();

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    debug!("Found {} media files under {}", entries.len(), root.display());
    Ok(entries)
}
