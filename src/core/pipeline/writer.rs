//! Partial-file store for downloads.
//!
//! A download lives in `<save>.part` until every chunk is verified. Chunks
//! are written at their own offset, so completion order does not matter.
//! On finalize, the whole `.part` is re-hashed and renamed over the save
//! path only when the content digest matches.
//!
//! All functions here block; callers dispatch them to the worker pool.

use crate::core::config::HASH_READ_BUFFER;
use crate::core::pipeline::chunk::chunk_range;
use anyhow::{Result, bail};
use sha3::{Digest, Sha3_256};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// `movie.mkv` -> `movie.mkv.part`.
pub fn part_path(save_path: &Path) -> PathBuf {
    with_suffix(save_path, ".part")
}

/// `movie.mkv` -> `movie.mkv.part.meta`.
pub fn meta_path(save_path: &Path) -> PathBuf {
    with_suffix(save_path, ".part.meta")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Handle to a preallocated `.part` file.
#[derive(Debug, Clone)]
pub struct PartFile {
    path: PathBuf,
    size: u64,
}

impl PartFile {
    /// Open (or create) the part file for `save_path` and size it to `size`.
    ///
    /// Existing content is kept so a resumed download retains the chunks
    /// it already verified.
    pub fn open(save_path: &Path, size: u64) -> std::io::Result<Self> {
        let path = part_path(save_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        if file.metadata()?.len() != size {
            file.set_len(size)?;
        }
        Ok(Self { path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write chunk `index` at its offset and flush it to disk.
    pub fn write_chunk(&self, index: u32, data: &[u8]) -> std::io::Result<()> {
        let Some((offset, len)) = chunk_range(self.size, index) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("chunk {index} out of range"),
            ));
        };
        if data.len() != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("chunk {index}: expected {len} bytes, got {}", data.len()),
            ));
        }
        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()
    }

    /// Verify the whole content against `expected_digest` and move the part
    /// file to `save_path`. On mismatch the part file is left in place and
    /// an error is returned.
    pub fn finalize(self, save_path: &Path, expected_digest: &str) -> Result<()> {
        let mut file = File::open(&self.path)?;
        let mut hasher = Sha3_256::new();
        let mut buf = vec![0u8; HASH_READ_BUFFER];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected_digest) {
            bail!(
                "content digest mismatch for {}: expected {}, got {}",
                save_path.display(),
                expected_digest,
                actual
            );
        }
        std::fs::rename(&self.path, save_path)?;
        Ok(())
    }
}

/// Read chunk `index` of a complete file for serving.
pub fn read_chunk(path: &Path, index: u32) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let Some((offset, len)) = chunk_range(size, index) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("chunk {index} out of range"),
        ));
    };
    let mut data = vec![0u8; len];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut data)?;
    Ok(data)
}

/// Remove the `.part` and `.part.meta` pair for `save_path`. Missing files
/// are not an error.
pub fn remove_artifacts(save_path: &Path) -> std::io::Result<()> {
    for path in [part_path(save_path), meta_path(save_path)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
