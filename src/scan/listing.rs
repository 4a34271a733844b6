use std::path::Path;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::error::{KbError, Result};

/// Prefix of transient office lock files, never indexed.
pub const LOCK_FILE_PREFIX: &str = "~$";

/// One immediate child of a scanned directory
#[derive(Debug, Clone, PartialEq)]
pub struct FsEntry {
    pub name: String,
    /// Absolute path with `/` separators, used as the diff key
    pub location_path: String,
    pub is_dir: bool,
    pub size: i64,
    /// Modification time in unix seconds
    pub mtime: i64,
}

impl FsEntry {
    /// Lower-cased extension without the dot, empty when there is none.
    pub fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase()
    }
}

/// Normalize a path into the form stored in `location_path`.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Size and mtime of a single path, `None` if it no longer exists.
pub fn stat(path: &Path) -> Result<Option<(i64, i64)>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some((meta.len() as i64, mtime_secs(&meta)))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(KbError::Io(e)),
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// List the immediate children of `dir`, skipping office lock files.
///
/// Returns `Ok(None)` when `dir` does not exist or is not a directory.
/// Entries that vanish between listing and stat are skipped.
pub fn list_children(dir: &Path) -> Result<Option<Vec<FsEntry>>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| {
                        std::io::Error::new(std::io::ErrorKind::Other, "directory walk failed")
                    });
                return Err(KbError::ScanIo {
                    path: normalize_path(dir),
                    source,
                });
            }
            Err(e) => {
                log::debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(LOCK_FILE_PREFIX) {
            continue;
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                log::debug!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };

        entries.push(FsEntry {
            name,
            location_path: normalize_path(entry.path()),
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() as i64 },
            mtime: mtime_secs(&meta),
        });
    }

    Ok(Some(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lists_one_level_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("guides/api")).unwrap();
        fs::write(root.join("notes.txt"), "plain text note").unwrap();
        fs::write(root.join("guides/api/endpoints.md"), "# API").unwrap();
        fs::write(root.join("~$report.docx"), b"lock").unwrap();

        let entries = list_children(root).unwrap().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["guides", "notes.txt"]);
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].size, 15);
        assert!(entries[1].mtime > 0);
        assert!(!entries[1].location_path.contains('\\'));
        assert_eq!(entries[1].extension(), "txt");
    }

    #[test]
    fn test_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert!(list_children(&temp_dir.path().join("gone")).unwrap().is_none());
        assert!(stat(&temp_dir.path().join("gone")).unwrap().is_none());
    }
}
