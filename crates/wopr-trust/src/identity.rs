//! Node identity: one signing keypair, one encryption keypair, on disk.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use wopr_core::ecdh::EncryptPublicKey;
use wopr_core::{now_ms, short_id, EncryptKeypair, Keypair, PublicKey};

use crate::error::{Error, Result};
use crate::files::{read_json, write_json_atomic};
use crate::rotation::{KeyRotation, DEFAULT_GRACE_PERIOD_MS};

/// A node's long-lived keys plus rotation lineage.
#[derive(Clone)]
pub struct Identity {
    sign: Keypair,
    encrypt: EncryptKeypair,
    pub created: i64,
    /// Signing key this identity replaced, if any.
    pub rotated_from: Option<PublicKey>,
    pub rotated_at: Option<i64>,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            sign: Keypair::generate(),
            encrypt: EncryptKeypair::generate(),
            created: now_ms(),
            rotated_from: None,
            rotated_at: None,
        }
    }

    pub fn sign_keypair(&self) -> &Keypair {
        &self.sign
    }

    pub fn encrypt_keypair(&self) -> &EncryptKeypair {
        &self.encrypt
    }

    pub fn sign_public(&self) -> PublicKey {
        self.sign.public_key()
    }

    pub fn encrypt_public(&self) -> EncryptPublicKey {
        self.encrypt.public_key()
    }

    /// First 8 hex chars of SHA-256 over the signing public key.
    pub fn short_id(&self) -> String {
        short_id(&self.sign_public())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("short_id", &self.short_id())
            .field("created", &self.created)
            .field("rotated_from", &self.rotated_from)
            .finish()
    }
}

/// On-disk shape of `identity.json`. Private keys are hex seeds.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityFile {
    sign_pub: PublicKey,
    sign_priv: String,
    encrypt_pub: EncryptPublicKey,
    encrypt_priv: String,
    created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    rotated_from: Option<PublicKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rotated_at: Option<i64>,
}

impl From<&Identity> for IdentityFile {
    fn from(identity: &Identity) -> Self {
        Self {
            sign_pub: identity.sign_public(),
            sign_priv: identity.sign.to_hex(),
            encrypt_pub: identity.encrypt_public(),
            encrypt_priv: identity.encrypt.to_hex(),
            created: identity.created,
            rotated_from: identity.rotated_from,
            rotated_at: identity.rotated_at,
        }
    }
}

impl TryFrom<IdentityFile> for Identity {
    type Error = Error;

    fn try_from(file: IdentityFile) -> Result<Self> {
        let sign = Keypair::from_hex(&file.sign_priv).map_err(Error::Core)?;
        let encrypt = EncryptKeypair::from_hex(&file.encrypt_priv).map_err(Error::Core)?;

        // The stored public halves must match the private material.
        if sign.public_key() != file.sign_pub || encrypt.public_key() != file.encrypt_pub {
            return Err(Error::Core(wopr_core::Error::InvalidPrivateKey));
        }

        Ok(Self {
            sign,
            encrypt,
            created: file.created,
            rotated_from: file.rotated_from,
            rotated_at: file.rotated_at,
        })
    }
}

/// File-backed identity store (`identity.json`, owner-only, atomic writes).
pub struct IdentityStore {
    path: PathBuf,
    current: RwLock<Option<Identity>>,
}

impl IdentityStore {
    /// Open a store rooted at `dir`; does not touch the filesystem yet.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("identity.json"),
            current: RwLock::new(None),
        }
    }

    /// Generate and persist a fresh identity.
    ///
    /// Fails with [`Error::AlreadyInitialized`] when an identity exists and
    /// `force` is false.
    pub fn init(&self, force: bool) -> Result<Identity> {
        if !force && self.path.exists() {
            return Err(Error::AlreadyInitialized);
        }

        let identity = Identity::generate();
        self.persist(&identity)?;
        info!(short_id = %identity.short_id(), "identity initialized");
        Ok(identity)
    }

    /// Load the identity from disk into memory.
    pub fn load(&self) -> Result<Identity> {
        let file: IdentityFile =
            read_json(&self.path)?.ok_or(Error::NotInitialized)?;
        let identity = Identity::try_from(file)?;
        *self.lock_write() = Some(identity.clone());
        Ok(identity)
    }

    /// Current identity, loading from disk on first use.
    pub fn current(&self) -> Result<Identity> {
        if let Some(identity) = self.lock_read().as_ref() {
            return Ok(identity.clone());
        }
        self.load()
    }

    /// Replace the identity with fresh keys.
    ///
    /// Returns the new identity together with a [`KeyRotation`] record signed
    /// by the outgoing key, for broadcast to peers.
    pub fn rotate(&self, reason: impl Into<String>) -> Result<(Identity, KeyRotation)> {
        let previous = self.current()?;
        let now = now_ms();

        let mut next = Identity::generate();
        next.rotated_from = Some(previous.sign_public());
        next.rotated_at = Some(now);

        let rotation = KeyRotation::sign(
            previous.sign_keypair(),
            next.sign_public(),
            next.encrypt_public(),
            reason,
            now,
            DEFAULT_GRACE_PERIOD_MS,
        )?;

        self.persist(&next)?;
        info!(
            old = %previous.short_id(),
            new = %next.short_id(),
            "identity rotated"
        );
        Ok((next, rotation))
    }

    fn persist(&self, identity: &Identity) -> Result<()> {
        write_json_atomic(&self.path, &IdentityFile::from(identity))?;
        *self.lock_write() = Some(identity.clone());
        Ok(())
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, Option<Identity>> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Identity>> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}
