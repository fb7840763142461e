#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Identity, invite tokens, and the peer trust store.
//!
//! This crate owns everything durable about a node's relationships:
//! - The node identity: one Ed25519 signing keypair plus one X25519
//!   encryption keypair, rotated atomically with a signed grace-period record
//! - Bearer-bound invite tokens (non-transferable by construction: the
//!   intended recipient's signing key is baked into the signed claims)
//! - The trust store: outbound [`Peer`] records, inbound [`AccessGrant`]s
//!   with per-key rotation history, and issuer-side [`InviteRecord`]s
//! - The adversarial gates: a per-peer sliding-window [`RateLimiter`] and a
//!   bounded nonce [`ReplayProtector`]

mod error;
mod files;
mod identity;
mod invite;
mod rate;
mod replay;
mod rotation;
mod store;

pub use error::{Error, Result};
pub use identity::{Identity, IdentityStore};
pub use invite::{InviteToken, DEFAULT_INVITE_TTL_MS, INJECT_CAP, TOKEN_LABEL};
pub use rate::{LimitRule, RateClass, RateLimitConfig, RateLimiter};
pub use replay::{ReplayConfig, ReplayProtector};
pub use rotation::{KeyRotation, DEFAULT_GRACE_PERIOD_MS};
pub use store::{AccessGrant, InviteRecord, KeyHistoryEntry, Peer, TrustStore};
