//! Integrity: SHA-256 digests of transferred files, for logs and transfer reports.

use sha2::{Digest, Sha256};

/// Hash a whole file. Returns 32-byte digest.
pub fn hash_file(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Lowercase hex, for log fields.
pub fn digest_hex(digest: &[u8; 32]) -> String {
    hex::encode(digest)
}
