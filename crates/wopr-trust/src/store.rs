//! Durable peer and grant records with rotation-aware authorization.
//!
//! Three files back the store: `peers.json` (who we can inject to),
//! `access.json` (who can inject to us), and `invites.json` (tokens we
//! minted). Every mutation rewrites the owning file atomically.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use wopr_core::ecdh::EncryptPublicKey;
use wopr_core::{now_ms, short_id, PublicKey};

use crate::error::{Error, Result};
use crate::files::{read_json, write_json_atomic};
use crate::invite::INJECT_CAP;
use crate::rotation::KeyRotation;

/// One retired key of a logical peer, authorized until `valid_until`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyHistoryEntry {
    pub public_key: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypt_pub: Option<EncryptPublicKey>,
    pub valid_from: i64,
    pub valid_until: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outbound record: a peer we hold an (advisory) grant on.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Short-id of the current signing key.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub public_key: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypt_pub: Option<EncryptPublicKey>,
    /// Sessions the remote told us we may use; the remote enforces.
    pub sessions: Vec<String>,
    pub caps: Vec<String>,
    pub added: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_history: Vec<KeyHistoryEntry>,
}

/// Inbound record: authorization we granted to a peer's signing key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub id: String,
    pub peer_key: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_encrypt_pub: Option<EncryptPublicKey>,
    /// Authoritative locally; the engine enforces these.
    pub sessions: Vec<String>,
    pub caps: Vec<String>,
    pub created: i64,
    #[serde(default)]
    pub revoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_history: Vec<KeyHistoryEntry>,
}

impl AccessGrant {
    /// Does `sender` identify this grant's logical peer right now?
    fn covers_key(&self, sender: &PublicKey, now: i64) -> bool {
        if self.revoked {
            return false;
        }
        if self.peer_key == *sender {
            return true;
        }
        self.key_history
            .iter()
            .any(|h| h.public_key == *sender && now < h.valid_until)
    }

    fn allows_session(&self, session: &str) -> bool {
        self.sessions.iter().any(|s| s == "*" || s == session)
    }
}

/// Issuer-side note about a minted invite. Informational; the cryptographic
/// binding lives in the token itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteRecord {
    pub token: String,
    pub peer_key: PublicKey,
    pub sessions: Vec<String>,
    pub created: i64,
    pub expires: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<PublicKey>,
}

#[derive(Default)]
struct State {
    peers: Vec<Peer>,
    grants: Vec<AccessGrant>,
    invites: Vec<InviteRecord>,
}

/// File-backed trust store; all mutations persist atomically before
/// returning.
pub struct TrustStore {
    dir: PathBuf,
    state: RwLock<State>,
}

impl TrustStore {
    /// Open (and load) the store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let state = State {
            peers: read_json(&dir.join("peers.json"))?.unwrap_or_default(),
            grants: read_json(&dir.join("access.json"))?.unwrap_or_default(),
            invites: read_json(&dir.join("invites.json"))?.unwrap_or_default(),
        };
        Ok(Self {
            dir,
            state: RwLock::new(state),
        })
    }

    // ---- authorization -------------------------------------------------

    /// May `sender` inject into `session` right now?
    pub fn is_authorized(&self, sender: &PublicKey, session: &str) -> bool {
        self.is_authorized_at(sender, session, now_ms())
    }

    pub fn is_authorized_at(&self, sender: &PublicKey, session: &str, now: i64) -> bool {
        let state = self.lock_read();
        state.grants.iter().any(|g| {
            g.covers_key(sender, now)
                && g.caps.iter().any(|c| c == INJECT_CAP)
                && g.allows_session(session)
        })
    }

    /// The grant covering `sender`, if any (used to recover the peer's
    /// static encryption key for v1 payloads).
    pub fn grant_for_peer(&self, sender: &PublicKey) -> Option<AccessGrant> {
        let now = now_ms();
        let state = self.lock_read();
        state
            .grants
            .iter()
            .find(|g| g.covers_key(sender, now))
            .cloned()
    }

    // ---- grants --------------------------------------------------------

    /// Grant `peer_key` access to `sessions` with `caps`.
    ///
    /// An existing non-revoked grant for the same key is widened (session and
    /// cap union, encryption key refreshed); otherwise a new grant is
    /// inserted.
    pub fn grant_access(
        &self,
        peer_key: PublicKey,
        sessions: &[String],
        caps: &[String],
        peer_encrypt_pub: Option<EncryptPublicKey>,
    ) -> Result<()> {
        let mut state = self.lock_write();

        match state
            .grants
            .iter()
            .position(|g| !g.revoked && g.peer_key == peer_key)
        {
            Some(idx) => {
                let grant = &mut state.grants[idx];
                for session in sessions {
                    if !grant.sessions.contains(session) {
                        grant.sessions.push(session.clone());
                    }
                }
                for cap in caps {
                    if !grant.caps.contains(cap) {
                        grant.caps.push(cap.clone());
                    }
                }
                if peer_encrypt_pub.is_some() {
                    grant.peer_encrypt_pub = peer_encrypt_pub;
                }
            }
            None => state.grants.push(AccessGrant {
                id: short_id(&peer_key),
                peer_key,
                peer_encrypt_pub,
                sessions: sessions.to_vec(),
                caps: caps.to_vec(),
                created: now_ms(),
                revoked: false,
                peer_name: None,
                key_history: Vec::new(),
            }),
        }

        info!(peer = %short_id(&peer_key), ?sessions, "access granted");
        self.save_grants(&state)
    }

    /// Revoke the grant matching `id_or_name`.
    pub fn revoke_peer(&self, id_or_name: &str) -> Result<()> {
        let mut state = self.lock_write();
        let grant = state
            .grants
            .iter_mut()
            .find(|g| {
                !g.revoked && (g.id == id_or_name || g.peer_name.as_deref() == Some(id_or_name))
            })
            .ok_or_else(|| Error::NotFound(format!("no grant for '{id_or_name}'")))?;

        grant.revoked = true;
        info!(peer = %grant.id, "grant revoked");
        self.save_grants(&state)
    }

    pub fn list_grants(&self) -> Vec<AccessGrant> {
        self.lock_read().grants.clone()
    }

    // ---- key rotation --------------------------------------------------

    /// Apply a peer's key rotation to its grant and peer records.
    ///
    /// Verifies the rotation signature, then moves the current key of every
    /// matching record into history (authorized until
    /// `effective_at + grace_period_ms`) and installs the new keys. Returns
    /// true iff at least one record changed; processing the same rotation
    /// again is a no-op.
    pub fn process_peer_key_rotation(&self, rotation: &KeyRotation) -> Result<bool> {
        if !rotation.verify() {
            return Err(Error::InvalidRotation);
        }

        let mut state = self.lock_write();
        let mut touched_grants = false;
        let mut touched_peers = false;

        for grant in state
            .grants
            .iter_mut()
            .filter(|g| !g.revoked && g.peer_key == rotation.old_sign_pub)
        {
            grant.key_history.push(KeyHistoryEntry {
                public_key: grant.peer_key,
                encrypt_pub: grant.peer_encrypt_pub,
                valid_from: grant.created,
                valid_until: rotation.valid_until(),
                reason: Some(rotation.reason.clone()),
            });
            grant.peer_key = rotation.new_sign_pub;
            grant.peer_encrypt_pub = Some(rotation.new_encrypt_pub);
            grant.id = short_id(&grant.peer_key);
            touched_grants = true;
        }

        for peer in state
            .peers
            .iter_mut()
            .filter(|p| p.public_key == rotation.old_sign_pub)
        {
            peer.key_history.push(KeyHistoryEntry {
                public_key: peer.public_key,
                encrypt_pub: peer.encrypt_pub,
                valid_from: peer.added,
                valid_until: rotation.valid_until(),
                reason: Some(rotation.reason.clone()),
            });
            peer.public_key = rotation.new_sign_pub;
            peer.encrypt_pub = Some(rotation.new_encrypt_pub);
            peer.id = short_id(&peer.public_key);
            touched_peers = true;
        }

        if touched_grants {
            self.save_grants(&state)?;
        }
        if touched_peers {
            self.save_peers(&state)?;
        }

        let updated = touched_grants || touched_peers;
        debug!(
            old = %short_id(&rotation.old_sign_pub),
            new = %short_id(&rotation.new_sign_pub),
            updated,
            "peer key rotation processed"
        );
        Ok(updated)
    }

    /// Drop history entries whose grace period has elapsed. Idempotent;
    /// returns the number of entries removed.
    pub fn cleanup_expired_key_history(&self) -> Result<usize> {
        let now = now_ms();
        let mut state = self.lock_write();
        let mut dropped = 0;

        let mut grants_changed = false;
        for grant in state.grants.iter_mut() {
            let before = grant.key_history.len();
            grant.key_history.retain(|h| h.valid_until > now);
            if grant.key_history.len() != before {
                dropped += before - grant.key_history.len();
                grants_changed = true;
            }
        }

        let mut peers_changed = false;
        for peer in state.peers.iter_mut() {
            let before = peer.key_history.len();
            peer.key_history.retain(|h| h.valid_until > now);
            if peer.key_history.len() != before {
                dropped += before - peer.key_history.len();
                peers_changed = true;
            }
        }

        if grants_changed {
            self.save_grants(&state)?;
        }
        if peers_changed {
            self.save_peers(&state)?;
        }
        Ok(dropped)
    }

    // ---- peers ---------------------------------------------------------

    /// Record a peer we can inject to (created by a successful claim).
    ///
    /// Claiming again refreshes the existing record instead of duplicating
    /// it.
    pub fn add_peer(
        &self,
        public_key: PublicKey,
        encrypt_pub: Option<EncryptPublicKey>,
        sessions: &[String],
        caps: &[String],
    ) -> Result<Peer> {
        let mut state = self.lock_write();

        let peer = match state.peers.iter().position(|p| p.public_key == public_key) {
            Some(idx) => {
                let peer = &mut state.peers[idx];
                for session in sessions {
                    if !peer.sessions.contains(session) {
                        peer.sessions.push(session.clone());
                    }
                }
                for cap in caps {
                    if !peer.caps.contains(cap) {
                        peer.caps.push(cap.clone());
                    }
                }
                if encrypt_pub.is_some() {
                    peer.encrypt_pub = encrypt_pub;
                }
                peer.clone()
            }
            None => {
                let peer = Peer {
                    id: short_id(&public_key),
                    name: None,
                    public_key,
                    encrypt_pub,
                    sessions: sessions.to_vec(),
                    caps: caps.to_vec(),
                    added: now_ms(),
                    key_history: Vec::new(),
                };
                state.peers.push(peer.clone());
                peer
            }
        };

        info!(peer = %peer.id, "peer recorded");
        self.save_peers(&state)?;
        Ok(peer)
    }

    /// Look up a peer by short-id or name.
    pub fn get_peer(&self, id_or_name: &str) -> Option<Peer> {
        let state = self.lock_read();
        state
            .peers
            .iter()
            .find(|p| p.id == id_or_name || p.name.as_deref() == Some(id_or_name))
            .cloned()
    }

    pub fn list_peers(&self) -> Vec<Peer> {
        self.lock_read().peers.clone()
    }

    pub fn rename_peer(&self, id_or_name: &str, name: &str) -> Result<()> {
        let mut state = self.lock_write();
        let peer = find_peer_mut(&mut state.peers, id_or_name)?;
        peer.name = Some(name.to_string());
        self.save_peers(&state)
    }

    /// Replace the advisory session list of a peer record.
    pub fn update_peer_sessions(&self, id_or_name: &str, sessions: &[String]) -> Result<()> {
        let mut state = self.lock_write();
        let peer = find_peer_mut(&mut state.peers, id_or_name)?;
        peer.sessions = sessions.to_vec();
        self.save_peers(&state)
    }

    /// Remove a peer record entirely.
    pub fn forget_peer(&self, id_or_name: &str) -> Result<()> {
        let mut state = self.lock_write();
        let before = state.peers.len();
        state
            .peers
            .retain(|p| p.id != id_or_name && p.name.as_deref() != Some(id_or_name));
        if state.peers.len() == before {
            return Err(Error::NotFound(format!("no peer '{id_or_name}'")));
        }
        self.save_peers(&state)
    }

    // ---- invites -------------------------------------------------------

    /// Note a minted invite so the issuer can track its claim.
    pub fn record_invite(
        &self,
        token: &str,
        peer_key: PublicKey,
        sessions: &[String],
        expires: i64,
    ) -> Result<()> {
        let mut state = self.lock_write();
        state.invites.push(InviteRecord {
            token: token.to_string(),
            peer_key,
            sessions: sessions.to_vec(),
            created: now_ms(),
            expires,
            claimed_at: None,
            claimed_by: None,
        });
        self.save_invites(&state)
    }

    /// Best-effort claim stamp.
    ///
    /// A missing record is not an error (the token is self-contained), and an
    /// already-claimed record keeps its original stamp.
    pub fn mark_invite_claimed(&self, token: &str, claimed_by: PublicKey) -> Result<()> {
        let mut state = self.lock_write();
        let Some(invite) = state
            .invites
            .iter_mut()
            .find(|i| i.token == token && i.claimed_at.is_none())
        else {
            return Ok(());
        };

        invite.claimed_at = Some(now_ms());
        invite.claimed_by = Some(claimed_by);
        self.save_invites(&state)
    }

    pub fn list_invites(&self) -> Vec<InviteRecord> {
        self.lock_read().invites.clone()
    }

    pub fn remove_invite(&self, token: &str) -> Result<()> {
        let mut state = self.lock_write();
        let before = state.invites.len();
        state.invites.retain(|i| i.token != token);
        if state.invites.len() == before {
            return Err(Error::NotFound("no such invite".to_string()));
        }
        self.save_invites(&state)
    }

    // ---- persistence ---------------------------------------------------

    fn save_peers(&self, state: &State) -> Result<()> {
        write_json_atomic(&self.dir.join("peers.json"), &state.peers)
    }

    fn save_grants(&self, state: &State) -> Result<()> {
        write_json_atomic(&self.dir.join("access.json"), &state.grants)
    }

    fn save_invites(&self, state: &State) -> Result<()> {
        write_json_atomic(&self.dir.join("invites.json"), &state.invites)
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn find_peer_mut<'a>(peers: &'a mut [Peer], id_or_name: &str) -> Result<&'a mut Peer> {
    peers
        .iter_mut()
        .find(|p| p.id == id_or_name || p.name.as_deref() == Some(id_or_name))
        .ok_or_else(|| Error::NotFound(format!("no peer '{id_or_name}'")))
}
