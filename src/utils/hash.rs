//! SHA-1 content digests for the object store.
//!
//! The digest is used for content addressing only, never in a security
//! context; collisions are acceptable. Files are hashed in 1 MiB chunks so
//! multi-gigabyte VM images do not need to fit in memory.

use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;

/// Chunk size tuned for throughput on large images.
const CHUNK_SIZE: usize = 1 << 20;

/// Hash a byte slice, returning the lowercase hex digest.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

/// Hash a file's contents in chunks, returning the lowercase hex digest.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
