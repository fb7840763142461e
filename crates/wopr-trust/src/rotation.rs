//! Signed key-rotation records.
//!
//! A rotation is authorized by the key being retired: the record carries the
//! new signing and encryption keys and is signed by the **old** signing key.
//! Peers that accept one keep the old key authorized until
//! `effective_at + grace_period_ms` so in-flight traffic survives the swap.

use serde::{Deserialize, Serialize};

use wopr_core::{signing_bytes, Keypair, PublicKey, Signature};
use wopr_core::ecdh::EncryptPublicKey;

use crate::error::{Error, Result};

/// Default rotation grace period: 7 days.
pub const DEFAULT_GRACE_PERIOD_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotation {
    /// Signing key being retired; the record's `sig` verifies under it.
    pub old_sign_pub: PublicKey,
    pub new_sign_pub: PublicKey,
    pub new_encrypt_pub: EncryptPublicKey,
    pub reason: String,
    /// When the new key takes over, ms since epoch.
    pub effective_at: i64,
    pub grace_period_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
}

impl KeyRotation {
    /// Build and sign a rotation record with the **old** signing keypair.
    pub fn sign(
        old_keypair: &Keypair,
        new_sign_pub: PublicKey,
        new_encrypt_pub: EncryptPublicKey,
        reason: impl Into<String>,
        effective_at: i64,
        grace_period_ms: i64,
    ) -> Result<Self> {
        let mut rotation = Self {
            old_sign_pub: old_keypair.public_key(),
            new_sign_pub,
            new_encrypt_pub,
            reason: reason.into(),
            effective_at,
            grace_period_ms,
            sig: None,
        };

        let bytes = signing_bytes(&serde_json::to_value(&rotation)?).map_err(Error::Core)?;
        rotation.sig = Some(old_keypair.sign(&bytes));
        Ok(rotation)
    }

    /// Verify the record's signature under `old_sign_pub`.
    pub fn verify(&self) -> bool {
        let Some(sig) = &self.sig else {
            return false;
        };
        let Ok(value) = serde_json::to_value(self) else {
            return false;
        };
        let Ok(bytes) = signing_bytes(&value) else {
            return false;
        };
        self.old_sign_pub.verify(&bytes, sig)
    }

    /// Last instant (exclusive) at which the old key still authorizes.
    pub fn valid_until(&self) -> i64 {
        self.effective_at.saturating_add(self.grace_period_ms)
    }
}
