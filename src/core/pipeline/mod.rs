//! Chunk & integrity pipeline.
//!
//! - `chunk`: fixed-size chunk geometry and per-chunk checksums
//! - `digest`: single-pass whole-file + per-chunk hashing, cancellable
//! - `writer`: offset-addressed `.part` files, finalize-by-digest, chunk reads

pub mod chunk;
pub mod digest;
pub mod writer;
