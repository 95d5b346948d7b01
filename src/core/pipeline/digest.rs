//! Whole-file digest with per-chunk checksums in a single streaming pass.

use crate::core::config::{CHUNK_SIZE, HASH_READ_BUFFER};
use crate::utils::sos::SignalOfStop;
use sha3::{Digest, Sha3_256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Result of hashing a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    /// Hex SHA3-256 of the whole content.
    pub digest: String,
    /// Hex SHA3-256 of each chunk, by index.
    pub chunk_digests: Vec<String>,
}

/// Stream `path` once, hashing the whole content and every chunk.
///
/// `progress` receives the completed percentage each time it changes.
/// `sos` is checked between reads; a cancelled run returns `Ok(None)`.
/// Blocking: run it on the worker pool.
pub fn digest_file(
    path: &Path,
    sos: &SignalOfStop,
    mut progress: impl FnMut(u8),
) -> std::io::Result<Option<FileDigest>> {
    let mut file = File::open(path)?;
    let expected = file.metadata()?.len();

    let mut whole = Sha3_256::new();
    let mut chunk = Sha3_256::new();
    let mut chunk_fill: u64 = 0;
    let mut chunk_digests = Vec::new();
    let mut total: u64 = 0;
    let mut last_pct = 0u8;
    let mut buf = vec![0u8; HASH_READ_BUFFER];

    loop {
        if sos.cancelled() {
            return Ok(None);
        }
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        whole.update(&buf[..n]);

        let mut rest = &buf[..n];
        while !rest.is_empty() {
            let room = (CHUNK_SIZE - chunk_fill) as usize;
            let take = room.min(rest.len());
            chunk.update(&rest[..take]);
            chunk_fill += take as u64;
            rest = &rest[take..];
            if chunk_fill == CHUNK_SIZE {
                chunk_digests.push(hex::encode(chunk.finalize_reset()));
                chunk_fill = 0;
            }
        }

        total += n as u64;
        if expected > 0 {
            let pct = ((total.min(expected) * 100) / expected) as u8;
            if pct != last_pct {
                last_pct = pct;
                progress(pct);
            }
        }
    }

    if chunk_fill > 0 {
        chunk_digests.push(hex::encode(chunk.finalize()));
    }
    if last_pct != 100 {
        progress(100);
    }

    Ok(Some(FileDigest {
        size: total,
        digest: hex::encode(whole.finalize()),
        chunk_digests,
    }))
}
