//! Bearer-bound invite tokens.
//!
//! A token is a signed claim set naming its issuer and, always, its intended
//! recipient (`sub`). Whoever presents it must prove ownership of `sub`'s
//! signing key during the claim handshake, so possession of the string alone
//! grants nothing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use wopr_core::{now_ms, signing_bytes, Keypair, PublicKey, Signature};

use crate::error::{Error, Result};

/// Default invite lifetime: 24 hours.
pub const DEFAULT_INVITE_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// The one capability the protocol currently grants.
pub const INJECT_CAP: &str = "inject";

/// Human-friendly scheme label prefixed to encoded tokens.
pub const TOKEN_LABEL: &str = "wopr";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InviteToken {
    /// Issuer signing key.
    pub iss: PublicKey,
    /// Intended recipient signing key; required, the token is unusable by
    /// anyone else.
    pub sub: PublicKey,
    /// Session names the recipient may inject into; `"*"` means any.
    pub ses: Vec<String>,
    /// Capability strings.
    pub cap: Vec<String>,
    /// Issued at, ms since epoch.
    pub iat: i64,
    /// Expires at, ms since epoch.
    pub exp: i64,
    pub nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<Signature>,
}

impl InviteToken {
    /// Mint a token for `sub`, signed by `issuer`.
    pub fn mint(
        issuer: &Keypair,
        sub: PublicKey,
        sessions: Vec<String>,
        caps: Vec<String>,
        ttl_ms: i64,
    ) -> Result<Self> {
        let iat = now_ms();
        let mut token = Self {
            iss: issuer.public_key(),
            sub,
            ses: sessions,
            cap: caps,
            iat,
            exp: iat + ttl_ms,
            nonce: uuid::Uuid::new_v4().to_string(),
            sig: None,
        };

        let bytes = signing_bytes(&serde_json::to_value(&token)?).map_err(Error::Core)?;
        token.sig = Some(issuer.sign(&bytes));
        Ok(token)
    }

    /// Mint with the default capability set and TTL.
    pub fn mint_default(issuer: &Keypair, sub: PublicKey, sessions: Vec<String>) -> Result<Self> {
        Self::mint(
            issuer,
            sub,
            sessions,
            vec![INJECT_CAP.to_string()],
            DEFAULT_INVITE_TTL_MS,
        )
    }

    /// Encode as the opaque URL-safe string handed to the recipient: the
    /// canonical JSON of the token, signature included.
    pub fn encode(&self) -> Result<String> {
        let canonical =
            wopr_core::canonicalize(&serde_json::to_value(self)?).map_err(Error::Core)?;
        Ok(format!("{TOKEN_LABEL}:{}", URL_SAFE_NO_PAD.encode(canonical)))
    }

    /// Decode a token string without any validity checks.
    ///
    /// Accepts raw base64 or any `label:` scheme prefix up to the first `:`.
    pub fn decode(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let body = match trimmed.split_once(':') {
            Some((_, rest)) => rest,
            None => trimmed,
        };

        let json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| Error::InvalidToken(format!("bad base64: {e}")))?;
        let token: InviteToken = serde_json::from_slice(&json)
            .map_err(|e| Error::InvalidToken(format!("bad structure: {e}")))?;

        if token.sig.is_none() {
            return Err(Error::InvalidToken("unsigned".to_string()));
        }
        Ok(token)
    }

    /// Verify the issuer signature.
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
        self.iss.verify(&bytes, sig)
    }

    /// Decode, verify the signature under `iss`, and check expiry.
    ///
    /// Deliberately does NOT check `sub` against the local identity; the
    /// claim handshake does that so the issuer can name the precise reason.
    pub fn parse(input: &str) -> Result<Self> {
        let token = Self::decode(input)?;
        if !token.verify() {
            return Err(Error::InvalidToken("signature invalid".to_string()));
        }
        if token.exp <= now_ms() {
            return Err(Error::TokenExpired);
        }
        Ok(token)
    }
}
