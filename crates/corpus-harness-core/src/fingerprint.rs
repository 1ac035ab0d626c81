//! Content fingerprints.
//!
//! A fingerprint is the lowercase hex SHA-256 of a byte string. Source files,
//! refined derivatives and chunks are all fingerprinted the same way so drift
//! checks reduce to string comparison.

use sha2::{Digest, Sha256};

/// Fingerprint raw bytes.
///
/// ```rust
/// use corpus_harness_core::fingerprint::fingerprint_bytes;
///
/// let fp = fingerprint_bytes(b"hello");
/// assert_eq!(fp.len(), 64);
/// assert_eq!(fp, fingerprint_bytes(b"hello"));
/// ```
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn fingerprint_text(text: &str) -> String {
    fingerprint_bytes(text.as_bytes())
}

/// Fingerprint an ordered sequence of parts without ambiguity between
/// `["ab", "c"]` and `["a", "bc"]`.
pub fn fingerprint_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}
