#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! # wopr-core
//!
//! Cryptographic primitives for the WOPR peer-to-peer trust core.
//!
//! This crate provides:
//! - Ed25519 signing and verification
//! - X25519 ECDH with HKDF-SHA256 key derivation and AES-256-GCM payload
//!   encryption (ephemeral and static variants)
//! - SHA-256 hashing, peer short-ids and rendezvous topic derivation
//! - Canonical JSON used as signing input across the protocol
//!
//! ## Quick Start
//!
//! ```rust
//! use wopr_core::{Keypair, short_id};
//!
//! let keypair = Keypair::generate();
//! let signature = keypair.sign(b"hello");
//! assert!(keypair.public_key().verify(b"hello", &signature));
//! assert_eq!(short_id(&keypair.public_key()).len(), 8);
//! ```

pub mod canonical;
pub mod ecdh;
pub mod error;
pub mod hashing;
pub mod signing;
pub mod time;

pub use canonical::{canonicalize, signing_bytes};
pub use ecdh::{
    decrypt_static, decrypt_with_ephemeral, encrypt_static, encrypt_with_ephemeral,
    EncryptKeypair, EncryptPublicKey, EphemeralKeypair,
};
pub use error::{Error, Result};
pub use hashing::{sha256, sha256_hex, short_id, topic_of};
pub use signing::{Keypair, PublicKey, Signature};
pub use time::now_ms;
