//! X25519 ECDH payload encryption.
//!
//! Payloads are sealed with AES-256-GCM under a key derived by HKDF-SHA256
//! from an X25519 shared secret. Two variants share the same blob shape:
//! ephemeral-ephemeral (forward-secret, protocol v2) and static-static
//! (v1 fallback). A blob is `base64(nonce || tag || ciphertext)` with a
//! 12-byte random nonce and 16-byte GCM tag.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::error::{Error, Result};

/// HKDF info string binding derived keys to this protocol.
pub const ENCRYPTION_INFO: &[u8] = b"wopr-p2p-v2";

/// AES-GCM nonce length in bytes.
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_SIZE: usize = 16;

/// X25519 public key, serialized as bare lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptPublicKey {
    #[serde(with = "xpub_serde")]
    inner: X25519Public,
}

mod xpub_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(key: &X25519Public, s: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&hex::encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D>(d: D) -> std::result::Result<X25519Public, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_str = String::deserialize(d)?;
        let bytes = hex::decode(&hex_str).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("encryption key must be 32 bytes"))?;
        Ok(X25519Public::from(bytes))
    }
}

impl EncryptPublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: X25519Public::from(bytes),
        }
    }

    /// Create from hex-encoded bytes.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| Error::InvalidHex(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidPublicKey("expected 32 bytes".to_string()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Export as hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.inner.as_bytes())
    }
}

impl std::hash::Hash for EncryptPublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.as_bytes().hash(state);
    }
}

impl std::fmt::Debug for EncryptPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptPublicKey({})", self.to_hex())
    }
}

/// Long-lived X25519 keypair for v1 static-key payload encryption.
#[derive(Clone)]
pub struct EncryptKeypair {
    secret: StaticSecret,
    public: X25519Public,
}

impl EncryptKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Create from a hex-encoded 32-byte secret.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| Error::InvalidHex(e.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidPrivateKey)?;
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret);
        Ok(Self { secret, public })
    }

    /// Export the secret as hex (private material; handle with care).
    pub fn to_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Get the public half.
    pub fn public_key(&self) -> EncryptPublicKey {
        EncryptPublicKey { inner: self.public }
    }
}

impl std::fmt::Debug for EncryptKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptKeypair")
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

/// Per-connection X25519 keypair for forward-secret v2 payloads.
///
/// The secret is owned by its connection task; `StaticSecret` zeroizes its
/// material on drop, so closing the connection wipes the key.
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: X25519Public,
}

impl EphemeralKeypair {
    /// Generate a fresh keypair for one connection.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Get the public half, as sent in `hello`/`hello-ack` frames.
    pub fn public_key(&self) -> EncryptPublicKey {
        EncryptPublicKey { inner: self.public }
    }
}

impl std::fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

/// Encrypt a payload under an ephemeral-ephemeral shared secret (v2).
pub fn encrypt_with_ephemeral(
    plaintext: &str,
    my_ephemeral: &EphemeralKeypair,
    peer_ephemeral: &EncryptPublicKey,
) -> Result<String> {
    seal(plaintext, &my_ephemeral.secret, &peer_ephemeral.inner)
}

/// Decrypt a payload sealed with [`encrypt_with_ephemeral`].
pub fn decrypt_with_ephemeral(
    blob: &str,
    my_ephemeral: &EphemeralKeypair,
    peer_ephemeral: &EncryptPublicKey,
) -> Result<String> {
    open(blob, &my_ephemeral.secret, &peer_ephemeral.inner)
}

/// Encrypt a payload under the static-static shared secret (v1 fallback).
pub fn encrypt_static(
    plaintext: &str,
    my_keypair: &EncryptKeypair,
    peer_public: &EncryptPublicKey,
) -> Result<String> {
    seal(plaintext, &my_keypair.secret, &peer_public.inner)
}

/// Decrypt a payload sealed with [`encrypt_static`].
pub fn decrypt_static(
    blob: &str,
    my_keypair: &EncryptKeypair,
    peer_public: &EncryptPublicKey,
) -> Result<String> {
    open(blob, &my_keypair.secret, &peer_public.inner)
}

fn derive_key(secret: &StaticSecret, peer: &X25519Public) -> Result<[u8; 32]> {
    let shared = secret.diffie_hellman(peer);

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(ENCRYPTION_INFO, &mut key)
        .map_err(|e| Error::Encryption(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

fn seal(plaintext: &str, secret: &StaticSecret, peer: &X25519Public) -> Result<String> {
    let key = derive_key(secret, peer)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Encryption(format!("cipher init failed: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut sealed = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| Error::Encryption(format!("encryption failed: {e}")))?;

    // AEAD output is ciphertext || tag; the blob layout is nonce || tag || ct.
    let tag_offset = sealed.len().saturating_sub(TAG_SIZE);
    let tag = sealed.split_off(tag_offset);

    let mut blob = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + sealed.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&sealed);
    Ok(BASE64.encode(blob))
}

fn open(blob: &str, secret: &StaticSecret, peer: &X25519Public) -> Result<String> {
    let bytes = BASE64
        .decode(blob.trim())
        .map_err(|e| Error::MalformedBlob(e.to_string()))?;
    if bytes.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::MalformedBlob(format!(
            "blob too short: {} bytes",
            bytes.len()
        )));
    }

    let (nonce_bytes, rest) = bytes.split_at(NONCE_SIZE);
    let (tag, ciphertext) = rest.split_at(TAG_SIZE);

    let key = derive_key(secret, peer)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Decryption(format!("cipher init failed: {e}")))?;

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed.as_slice())
        .map_err(|e| Error::Decryption(format!("decryption failed: {e}")))?;

    String::from_utf8(plaintext).map_err(|e| Error::Decryption(format!("invalid UTF-8: {e}")))
}
