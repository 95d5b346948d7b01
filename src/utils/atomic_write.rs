//! Atomic file write utility.
//!
//! Single implementation of the write-to-temp-then-rename pattern used for
//! every persistent state file (resume metadata, trust stores, CA keys).
//!
//! Invariants:
//! - Write goes to `<name>.tmp` next to the target, is flushed to disk, then
//!   an atomic rename replaces the target.
//! - On rename failure, the temp file is cleaned up to avoid stale artifacts.
//! - Parent directories are created if absent.
//!
//! Note: `rename()` is atomic on all major filesystems when source and
//! destination are on the same mount, which the sibling temp file ensures.

use anyhow::Result;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::error;

/// Atomically write `content` to `path` via a temporary file and rename.
///
/// # Errors
/// Returns an error if the temp file cannot be written or the rename fails.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path_for(path);

    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()
    };
    write().map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

/// `a/b/file.part.meta` -> `a/b/file.part.meta.tmp`.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn test_atomic_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv.part.meta");

        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_atomic_write_no_temp_file_remains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("movie.mkv.part.meta");

        atomic_write(&path, b"data").unwrap();
        let tmp = temp_path_for(&path);
        assert_eq!(tmp.file_name().unwrap(), "movie.mkv.part.meta.tmp");
        assert!(!tmp.exists(), "temp file should not remain after a write");
    }
}
