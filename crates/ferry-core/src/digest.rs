//! Content digests.
//!
//! Two digests, two jobs: SHA-256 over the whole file for end-to-end
//! verification, and xxh64 per chunk for cheap on-wire integrity. The
//! chunk digest is not a security boundary.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::xxh64;

/// Streaming SHA-256 of a file, hex-encoded. Reads in 64 KiB blocks.
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// xxh64 of a chunk payload as the 8 wire bytes (big-endian).
pub fn chunk_digest(data: &[u8]) -> [u8; 8] {
    xxh64(data, 0).to_be_bytes()
}

/// xxh64 of a chunk payload, hex-encoded for the manifest.
pub fn chunk_digest_hex(data: &[u8]) -> String {
    hex::encode(chunk_digest(data))
}
