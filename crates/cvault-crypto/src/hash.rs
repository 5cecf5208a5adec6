//! SHA-256 content hashing
//!
//! The lowercase hex digest of a file's plaintext is its blob key, so two
//! files with identical bytes share one stored blob.

use std::io::{self, Read};
use std::path::Path;

use cvault_core::{VaultError, VaultResult};
use sha2::{Digest, Sha256};

const READ_BUF: usize = 64 * 1024;

/// Incremental hasher for callers that already see the bytes go by
/// (the upload path re-hashes while it encrypts).
#[derive(Default, Clone)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consume the hasher, returning the 64-char lowercase hex digest.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash everything a reader yields, 64 KiB at a time.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Hash a file from disk without loading it into memory.
pub fn hash_file(path: &Path) -> VaultResult<String> {
    let file = std::fs::File::open(path).map_err(|e| VaultError::fs(path, e))?;
    hash_reader(file).map_err(|e| VaultError::fs(path, e))
}

/// True for exactly 64 lowercase hex characters.
pub fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
