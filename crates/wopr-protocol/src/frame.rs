//! Wire frames: a signed envelope around a tagged request/response body.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use wopr_core::ecdh::EncryptPublicKey;
use wopr_core::{canonicalize, now_ms, signing_bytes, Keypair, PublicKey, Signature};
use wopr_trust::KeyRotation;

use crate::error::{Error, Result};

/// Newest protocol version this build speaks. v2 adds ephemeral-ECDH
/// forward-secret payloads.
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest version still accepted; v1 peers fall back to static-key payloads.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// One newline-terminated line of canonical JSON on the wire.
///
/// The envelope fields are shared by every frame type; `sig` covers the
/// canonical encoding of everything else.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub v: u32,
    pub from: PublicKey,
    /// 16 random bytes, hex; replay-protected per node.
    pub nonce: String,
    /// Milliseconds since epoch.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
    #[serde(flatten)]
    pub body: FrameBody,
}

/// The seven concrete frame shapes, discriminated by `type` on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum FrameBody {
    Hello {
        versions: Vec<u32>,
        ephemeral_pub: EncryptPublicKey,
    },
    HelloAck {
        version: u32,
        ephemeral_pub: EncryptPublicKey,
    },
    Claim {
        token: String,
        encrypt_pub: EncryptPublicKey,
    },
    Inject {
        session: String,
        /// Base64 AEAD blob; see the forward-secrecy selection rules.
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypt_pub: Option<EncryptPublicKey>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ephemeral_pub: Option<EncryptPublicKey>,
    },
    KeyRotation {
        key_rotation: KeyRotation,
    },
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypt_pub: Option<EncryptPublicKey>,
    },
    Reject {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<String>,
    },
}

impl FrameBody {
    /// Wire name of this frame's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            FrameBody::Hello { .. } => "hello",
            FrameBody::HelloAck { .. } => "hello-ack",
            FrameBody::Claim { .. } => "claim",
            FrameBody::Inject { .. } => "inject",
            FrameBody::KeyRotation { .. } => "key-rotation",
            FrameBody::Ack { .. } => "ack",
            FrameBody::Reject { .. } => "reject",
        }
    }
}

impl Frame {
    /// Build an unsigned frame with a fresh nonce and current timestamp.
    pub fn unsigned(v: u32, from: PublicKey, body: FrameBody) -> Self {
        Self {
            v,
            from,
            nonce: wire_nonce(),
            ts: now_ms(),
            sig: None,
            body,
        }
    }

    /// Sign the frame over its canonical encoding with `sig` omitted.
    pub fn sign(mut self, keypair: &Keypair) -> Result<Self> {
        self.sig = None;
        let bytes = signing_bytes(&serde_json::to_value(&self)?)?;
        self.sig = Some(keypair.sign(&bytes));
        Ok(self)
    }

    /// Verify `sig` under the frame's own `from` key.
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
        self.from.verify(&bytes, sig)
    }

    /// Serialize to the single-line wire form.
    pub fn to_line(&self) -> Result<String> {
        Ok(canonicalize(&serde_json::to_value(self)?)?)
    }

    /// Parse one wire line.
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(|e| Error::Parse(e.to_string()))
    }
}

fn wire_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
