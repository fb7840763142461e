//! SHA-256 hashing, peer short-ids, and rendezvous topics.

use sha2::{Digest, Sha256};

use crate::signing::PublicKey;

/// Length of a peer short-id in hex characters.
pub const SHORT_ID_LEN: usize = 8;

/// Compute the SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-256 digest of `data` as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Derive a peer's short-id: the first 8 hex characters of the SHA-256 digest
/// of its signing public key.
///
/// Both sides hash the lowercase hex encoding of the key, the same string
/// form every wire field carries.
pub fn short_id(sign_pub: &PublicKey) -> String {
    let digest = sha256_hex(sign_pub.to_hex().as_bytes());
    digest[..SHORT_ID_LEN].to_string()
}

/// Derive the 32-byte rendezvous topic a node listens on: the SHA-256 digest
/// of its signing public key.
pub fn topic_of(sign_pub: &PublicKey) -> [u8; 32] {
    sha256(sign_pub.to_hex().as_bytes())
}
