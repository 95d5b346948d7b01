//! Chunk geometry and integrity verification.
//!
//! Files are sliced into fixed [`CHUNK_SIZE`] chunks indexed from 0; the
//! last chunk may be shorter. Chunk checksums are lowercase hex SHA3-256.
//!
//! Everything here is pure: callers own any state transition that follows
//! a failed verification.

use crate::core::config::CHUNK_SIZE;
use sha3::{Digest, Sha3_256};
use std::collections::BTreeSet;

/// Number of chunks covering `size` bytes. An empty file has none.
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE) as u32
}

/// Byte offset and length of chunk `index`, or `None` past the end.
pub fn chunk_range(size: u64, index: u32) -> Option<(u64, usize)> {
    let offset = (index as u64).checked_mul(CHUNK_SIZE)?;
    if offset >= size {
        return None;
    }
    let len = (size - offset).min(CHUNK_SIZE) as usize;
    Some((offset, len))
}

/// SHA3-256 of `data`, hex encoded.
pub fn digest_chunk(data: &[u8]) -> String {
    hex::encode(Sha3_256::digest(data))
}

/// True iff `data` hashes to `expected`.
///
/// An absent or empty expected checksum cannot be checked and is accepted.
/// Callers that need strict verification must supply one.
pub fn verify_chunk(data: &[u8], expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(e) if e.trim().is_empty() => true,
        Some(e) => digest_chunk(data).eq_ignore_ascii_case(e.trim()),
    }
}

/// Indices in `0..total` not present in `have`, ascending.
pub fn missing_chunks(total: u32, have: &BTreeSet<u32>) -> Vec<u32> {
    (0..total).filter(|i| !have.contains(i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_geometry() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);

        let size = 2 * CHUNK_SIZE + 10;
        assert_eq!(chunk_range(size, 0), Some((0, CHUNK_SIZE as usize)));
        assert_eq!(chunk_range(size, 2), Some((2 * CHUNK_SIZE, 10)));
        assert_eq!(chunk_range(size, 3), None);
    }

    #[test]
    fn test_chunk_verify() {
        let data = b"hello world".to_vec();
        let sum = digest_chunk(&data);
        assert_eq!(sum.len(), 64);
        assert!(verify_chunk(&data, Some(&sum)));
        assert!(verify_chunk(&data, Some(&sum.to_uppercase())));
    }

    #[test]
    fn test_chunk_verify_detects_any_flipped_byte() {
        let data: Vec<u8> = (0..64u8).collect();
        let sum = digest_chunk(&data);
        for i in 0..data.len() {
            let mut corrupted = data.clone();
            corrupted[i] ^= 0x01;
            assert!(!verify_chunk(&corrupted, Some(&sum)), "byte {i}");
        }
    }

    #[test]
    fn test_chunk_verify_accepts_missing_checksum() {
        assert!(verify_chunk(b"anything", None));
        assert!(verify_chunk(b"anything", Some("")));
        assert!(!verify_chunk(b"anything", Some("00")));
    }

    #[test]
    fn test_missing_chunks() {
        let have: BTreeSet<u32> = [0, 2, 5].into_iter().collect();
        assert_eq!(missing_chunks(7, &have), vec![1, 3, 4, 6]);
    }
}
