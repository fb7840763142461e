//! The protocol engine: connection state machine, send paths, listener.
//!
//! Per connection the state machine is strictly sequential: one handshake,
//! one typed request, one reply, close. Ephemeral keypairs live inside the
//! connection task and are wiped when it ends.
//!
//! Suspected adversarial input (bad signature, replay, undecryptable
//! payload) is dropped silently and charged to the sender's
//! `invalid_messages` budget; benign authorization failures answer with an
//! explicit `reject` so legitimate peers get diagnostics.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use wopr_core::ecdh::{self, EncryptPublicKey};
use wopr_core::{short_id, topic_of, EphemeralKeypair, PublicKey};
use wopr_trust::{
    Identity, IdentityStore, InviteToken, KeyRotation, RateClass, RateLimiter, ReplayProtector,
    TrustStore,
};

use crate::delivery::{Delivery, REASON_RATE_LIMITED, REASON_VERSION_MISMATCH};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameBody, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::transport::{Connection, InjectHandler, Transport, TransportRole};

/// Engine timeouts.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Hard deadline for the `hello`/`hello-ack` exchange.
    pub handshake_timeout: Duration,
    /// Deadline for a full request round-trip.
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

struct EngineInner {
    identity: Arc<IdentityStore>,
    trust: Arc<TrustStore>,
    rate: Arc<RateLimiter>,
    replay: Arc<ReplayProtector>,
    handler: Arc<dyn InjectHandler>,
    transport: Arc<dyn Transport>,
    config: EngineConfig,
}

/// The engine; cheap to clone, all state shared.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

/// Running listener task; abort it to stop accepting connections.
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl ProtocolEngine {
    pub fn new(
        identity: Arc<IdentityStore>,
        trust: Arc<TrustStore>,
        handler: Arc<dyn InjectHandler>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_gates(
            identity,
            trust,
            handler,
            transport,
            Arc::new(RateLimiter::default()),
            Arc::new(ReplayProtector::default()),
            EngineConfig::default(),
        )
    }

    /// Full dependency injection: shared gates and explicit timeouts.
    pub fn with_gates(
        identity: Arc<IdentityStore>,
        trust: Arc<TrustStore>,
        handler: Arc<dyn InjectHandler>,
        transport: Arc<dyn Transport>,
        rate: Arc<RateLimiter>,
        replay: Arc<ReplayProtector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                identity,
                trust,
                rate,
                replay,
                handler,
                transport,
                config,
            }),
        }
    }

    // ---- listener ------------------------------------------------------

    /// Join our own topic in server mode and serve connections until the
    /// handle is shut down. Each connection runs in its own task; a failure
    /// in one never affects the others.
    pub async fn listen(&self) -> Result<ListenerHandle> {
        let identity = self.inner.identity.current()?;
        let topic = topic_of(&identity.sign_public());

        let mut connections = self
            .inner
            .transport
            .join(topic, TransportRole::Server)
            .await?;

        info!(short_id = %identity.short_id(), "listening");

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Some(mut conn) = connections.recv().await {
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = respond(&inner, conn.as_mut()).await {
                        debug!(error = %e, "connection ended with error");
                    }
                    conn.close().await;
                });
            }
        });

        Ok(ListenerHandle { task })
    }

    /// Periodically drop expired key-history entries.
    pub fn spawn_housekeeping(&self, interval: Duration) -> JoinHandle<()> {
        let trust = self.inner.trust.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match trust.cleanup_expired_key_history() {
                    Ok(0) => {}
                    Ok(dropped) => debug!(dropped, "expired key history cleaned"),
                    Err(e) => warn!(error = %e, "key history cleanup failed"),
                }
            }
        })
    }

    /// Release the transport.
    pub async fn destroy(&self) {
        self.inner.transport.destroy().await;
    }

    // ---- initiator: inject ---------------------------------------------

    /// Encrypt `message` and deliver it to `session` on the peer identified
    /// by short-id or name.
    pub async fn send_inject(&self, peer_ref: &str, session: &str, message: &str) -> Delivery {
        let inner = &self.inner;

        let identity = match inner.identity.current() {
            Ok(identity) => identity,
            Err(_) => return Delivery::invalid("no identity"),
        };
        let Some(peer) = inner.trust.get_peer(peer_ref) else {
            return Delivery::invalid(format!("unknown peer '{peer_ref}'"));
        };
        let Some(peer_encrypt) = peer.encrypt_pub else {
            return Delivery::invalid("peer has no encryption key");
        };

        // Advisory local check; saves a connection the remote would refuse.
        if !peer.sessions.iter().any(|s| s == "*" || s == session) {
            return Delivery::rejected(format!("session '{session}' not granted"));
        }

        let mut conn = match self.dial(topic_of(&peer.public_key)).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };

        let outcome = async {
            let (version, my_eph, their_eph) =
                match self.handshake(conn.as_mut(), &identity, &peer.public_key).await {
                    Ok(negotiated) => negotiated,
                    Err(outcome) => return outcome,
                };

            // Forward-secrecy selection: ephemeral ECDH when both sides
            // produced a key under v2, static fallback otherwise.
            let body = if version >= 2 {
                match ecdh::encrypt_with_ephemeral(message, &my_eph, &their_eph) {
                    Ok(payload) => FrameBody::Inject {
                        session: session.to_string(),
                        payload,
                        encrypt_pub: None,
                        ephemeral_pub: Some(my_eph.public_key()),
                    },
                    Err(e) => return Delivery::invalid(e.to_string()),
                }
            } else {
                match ecdh::encrypt_static(message, identity.encrypt_keypair(), &peer_encrypt) {
                    Ok(payload) => FrameBody::Inject {
                        session: session.to_string(),
                        payload,
                        encrypt_pub: Some(identity.encrypt_public()),
                        ephemeral_pub: None,
                    },
                    Err(e) => return Delivery::invalid(e.to_string()),
                }
            };

            self.request(conn.as_mut(), &identity, version, body).await
        }
        .await;

        conn.close().await;
        debug!(peer = %peer.id, session, outcome = %outcome, "inject finished");
        outcome
    }

    // ---- initiator: claim ----------------------------------------------

    /// Claim an invite token, converting it into a mutual grant and a local
    /// peer record.
    pub async fn claim_token(&self, token_str: &str) -> Delivery {
        let inner = &self.inner;

        let identity = match inner.identity.current() {
            Ok(identity) => identity,
            Err(_) => return Delivery::invalid("no identity"),
        };
        let token = match InviteToken::parse(token_str) {
            Ok(token) => token,
            Err(wopr_trust::Error::TokenExpired) => return Delivery::rejected("token expired"),
            Err(e) => return Delivery::invalid(e.to_string()),
        };

        let mut conn = match self.dial(topic_of(&token.iss)).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };

        let outcome = async {
            let (version, _my_eph, _their_eph) =
                match self.handshake(conn.as_mut(), &identity, &token.iss).await {
                    Ok(negotiated) => negotiated,
                    Err(outcome) => return outcome,
                };

            let body = FrameBody::Claim {
                token: token_str.trim().to_string(),
                encrypt_pub: identity.encrypt_public(),
            };

            match self.request_frame(conn.as_mut(), &identity, version, body).await {
                Ok(FrameBody::Ack { encrypt_pub, .. }) => {
                    match inner
                        .trust
                        .add_peer(token.iss, encrypt_pub, &token.ses, &token.cap)
                    {
                        Ok(peer) => {
                            info!(peer = %peer.id, "invite claimed");
                            Delivery::Ok
                        }
                        Err(e) => Delivery::invalid(e.to_string()),
                    }
                }
                Ok(FrameBody::Reject { reason, .. }) => Delivery::from_reject(&reason),
                Ok(_) | Err(_) => Delivery::Offline,
            }
        }
        .await;

        conn.close().await;
        outcome
    }

    // ---- initiator: key rotation ---------------------------------------

    /// Announce our key rotation to one peer.
    pub async fn send_key_rotation(&self, peer_ref: &str, rotation: &KeyRotation) -> Delivery {
        let identity = match self.inner.identity.current() {
            Ok(identity) => identity,
            Err(_) => return Delivery::invalid("no identity"),
        };
        let Some(peer) = self.inner.trust.get_peer(peer_ref) else {
            return Delivery::invalid(format!("unknown peer '{peer_ref}'"));
        };

        let mut conn = match self.dial(topic_of(&peer.public_key)).await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };

        let outcome = async {
            let (version, _my_eph, _their_eph) =
                match self.handshake(conn.as_mut(), &identity, &peer.public_key).await {
                    Ok(negotiated) => negotiated,
                    Err(outcome) => return outcome,
                };

            let body = FrameBody::KeyRotation {
                key_rotation: rotation.clone(),
            };
            self.request(conn.as_mut(), &identity, version, body).await
        }
        .await;

        conn.close().await;
        outcome
    }

    /// Announce our key rotation to every known peer.
    pub async fn broadcast_key_rotation(&self, rotation: &KeyRotation) -> Vec<(String, Delivery)> {
        let peers = self.inner.trust.list_peers();
        let mut results = Vec::with_capacity(peers.len());
        for peer in peers {
            let outcome = self.send_key_rotation(&peer.id, rotation).await;
            if !outcome.is_ok() {
                warn!(peer = %peer.id, outcome = %outcome, "rotation broadcast failed");
            }
            results.push((peer.id, outcome));
        }
        results
    }

    // ---- initiator internals -------------------------------------------

    async fn dial(
        &self,
        topic: [u8; 32],
    ) -> std::result::Result<Box<dyn Connection>, Delivery> {
        let mut connections = self
            .inner
            .transport
            .join(topic, TransportRole::Client)
            .await
            .map_err(|_| Delivery::Offline)?;

        match timeout(self.inner.config.request_timeout, connections.recv()).await {
            Ok(Some(conn)) => Ok(conn),
            _ => Err(Delivery::Offline),
        }
    }

    /// Run the initiator half of the handshake. Returns the negotiated
    /// version, our ephemeral keypair, and the responder's ephemeral key.
    async fn handshake(
        &self,
        conn: &mut dyn Connection,
        identity: &Identity,
        expect_from: &PublicKey,
    ) -> std::result::Result<(u32, EphemeralKeypair, EncryptPublicKey), Delivery> {
        let my_eph = EphemeralKeypair::generate();

        let hello = Frame::unsigned(
            PROTOCOL_VERSION,
            identity.sign_public(),
            FrameBody::Hello {
                versions: (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).collect(),
                ephemeral_pub: my_eph.public_key(),
            },
        )
        .sign(identity.sign_keypair())
        .map_err(|e| Delivery::invalid(e.to_string()))?;

        write_frame(conn, &hello).await.map_err(|_| Delivery::Offline)?;

        let reply = match timeout(self.inner.config.handshake_timeout, conn.read_line()).await {
            Ok(Ok(Some(line))) => line,
            _ => return Err(Delivery::Offline),
        };
        let frame = Frame::parse(&reply).map_err(|_| Delivery::Offline)?;

        match frame.body {
            FrameBody::HelloAck {
                version,
                ephemeral_pub,
            } => {
                if !frame.verify() || frame.from != *expect_from {
                    return Err(Delivery::Offline);
                }
                Ok((version, my_eph, ephemeral_pub))
            }
            FrameBody::Reject { reason, .. } => Err(Delivery::from_reject(&reason)),
            _ => Err(Delivery::Offline),
        }
    }

    /// Send one typed request and collapse the reply into a [`Delivery`].
    async fn request(
        &self,
        conn: &mut dyn Connection,
        identity: &Identity,
        version: u32,
        body: FrameBody,
    ) -> Delivery {
        match self.request_frame(conn, identity, version, body).await {
            Ok(FrameBody::Ack { .. }) => Delivery::Ok,
            Ok(FrameBody::Reject { reason, .. }) => Delivery::from_reject(&reason),
            Ok(_) | Err(_) => Delivery::Offline,
        }
    }

    /// Send one typed request and return the raw reply body.
    async fn request_frame(
        &self,
        conn: &mut dyn Connection,
        identity: &Identity,
        version: u32,
        body: FrameBody,
    ) -> Result<FrameBody> {
        let frame = Frame::unsigned(version, identity.sign_public(), body)
            .sign(identity.sign_keypair())?;
        write_frame(conn, &frame).await?;

        let reply = match timeout(self.inner.config.request_timeout, conn.read_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Err(Error::ConnectionClosed),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Timeout),
        };
        let frame = Frame::parse(&reply)?;
        if !frame.verify() {
            return Err(Error::Parse("reply signature invalid".to_string()));
        }
        Ok(frame.body)
    }
}

// ---- responder ---------------------------------------------------------

/// Serve one inbound connection: handshake, one typed request, one reply.
async fn respond(inner: &EngineInner, conn: &mut dyn Connection) -> Result<()> {
    let identity = inner.identity.current()?;

    // AWAIT_HELLO: hard 5 s deadline from the first byte.
    let line = match timeout(inner.config.handshake_timeout, conn.read_line()).await {
        Ok(Ok(Some(line))) => line,
        _ => return Ok(()),
    };

    let Some(hello) = gate_frame(inner, &line, false) else {
        return Ok(());
    };
    let FrameBody::Hello {
        ref versions,
        ephemeral_pub: _,
    } = hello.body
    else {
        // A first frame that is not hello is a protocol violation.
        inner.rate.charge(&hello.from, RateClass::InvalidMessages);
        return Ok(());
    };
    let from = hello.from;

    if !inner.rate.check(&from, RateClass::Connections) {
        return send_reject(conn, &identity, PROTOCOL_VERSION, REASON_RATE_LIMITED, None).await;
    }

    // Version negotiation: highest version both sides speak.
    let version = match versions
        .iter()
        .filter(|v| (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(v))
        .max()
    {
        Some(version) => *version,
        None => {
            debug!(peer = %short_id(&from), ?versions, "no common protocol version");
            return send_reject(
                conn,
                &identity,
                PROTOCOL_VERSION,
                REASON_VERSION_MISMATCH,
                None,
            )
            .await;
        }
    };

    let my_eph = EphemeralKeypair::generate();
    let ack = Frame::unsigned(
        version,
        identity.sign_public(),
        FrameBody::HelloAck {
            version,
            ephemeral_pub: my_eph.public_key(),
        },
    )
    .sign(identity.sign_keypair())?;
    write_frame(conn, &ack).await?;

    // NEGOTIATED: exactly one typed request.
    let line = match timeout(inner.config.request_timeout, conn.read_line()).await {
        Ok(Ok(Some(line))) => line,
        _ => return Ok(()),
    };

    // Key-rotation frames skip the outer signature and replay gates: the
    // envelope is signed by the old key, which is the one we still hold.
    let is_rotation = serde_json::from_str::<serde_json::Value>(&line)
        .map(|v| v.get("type").and_then(|t| t.as_str()) == Some("key-rotation"))
        .unwrap_or(false);

    let Some(request) = gate_frame(inner, &line, is_rotation) else {
        return Ok(());
    };
    if request.from != from {
        inner.rate.charge(&from, RateClass::InvalidMessages);
        return Ok(());
    }

    match request.body {
        FrameBody::Claim {
            token,
            encrypt_pub,
        } => handle_claim(inner, conn, &identity, version, from, &token, encrypt_pub).await,
        FrameBody::Inject {
            session,
            payload,
            ephemeral_pub,
            ..
        } => {
            handle_inject(
                inner, conn, &identity, version, from, &session, &payload, ephemeral_pub, &my_eph,
            )
            .await
        }
        FrameBody::KeyRotation { key_rotation } => {
            handle_key_rotation(inner, conn, &identity, version, from, &key_rotation).await
        }
        _ => send_reject(conn, &identity, version, "unexpected frame type", None).await,
    }
}

/// Parse / verify / replay-check one line. `None` means the frame was
/// silently dropped (and charged where attributable).
fn gate_frame(inner: &EngineInner, line: &str, skip_signature: bool) -> Option<Frame> {
    let frame = match Frame::parse(line) {
        Ok(frame) => frame,
        Err(_) => {
            charge_unattributed(inner, line);
            return None;
        }
    };

    // Peers blocked for invalid traffic get no further processing at all.
    if inner.rate.is_blocked(&frame.from, RateClass::InvalidMessages) {
        return None;
    }

    if skip_signature {
        return Some(frame);
    }

    if !frame.verify() {
        debug!(peer = %short_id(&frame.from), "dropping frame with bad signature");
        inner.rate.charge(&frame.from, RateClass::InvalidMessages);
        return None;
    }
    if !inner.replay.check(&frame.nonce, frame.ts) {
        debug!(peer = %short_id(&frame.from), "dropping replayed frame");
        inner.rate.charge(&frame.from, RateClass::InvalidMessages);
        return None;
    }
    Some(frame)
}

/// Best-effort attribution for a line that did not parse as a frame.
fn charge_unattributed(inner: &EngineInner, line: &str) {
    let Some(from) = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("from").and_then(|f| f.as_str()).map(String::from))
        .and_then(|hex| PublicKey::from_hex(&hex).ok())
    else {
        return;
    };
    inner.rate.charge(&from, RateClass::InvalidMessages);
}

async fn handle_claim(
    inner: &EngineInner,
    conn: &mut dyn Connection,
    identity: &Identity,
    version: u32,
    from: PublicKey,
    token_str: &str,
    encrypt_pub: EncryptPublicKey,
) -> Result<()> {
    if !inner.rate.check(&from, RateClass::Claims) {
        return send_reject(conn, identity, version, REASON_RATE_LIMITED, None).await;
    }

    let token = match InviteToken::decode(token_str) {
        Ok(token) => token,
        Err(_) => return send_reject(conn, identity, version, "invalid token", None).await,
    };
    if token.iss != identity.sign_public() {
        return send_reject(conn, identity, version, "token not issued by this peer", None).await;
    }
    if token.sub != from {
        warn!(
            claimer = %short_id(&from),
            subject = %short_id(&token.sub),
            "claim attempt by wrong peer"
        );
        return send_reject(conn, identity, version, "token not issued for you", None).await;
    }
    if !token.verify() {
        return send_reject(conn, identity, version, "invalid token", None).await;
    }
    if token.exp <= wopr_core::now_ms() {
        return send_reject(conn, identity, version, "token expired", None).await;
    }

    inner
        .trust
        .grant_access(from, &token.ses, &token.cap, Some(encrypt_pub))?;
    // The paired invite record is informational; absence is not an error.
    inner.trust.mark_invite_claimed(token_str, from)?;

    info!(peer = %short_id(&from), sessions = ?token.ses, "claim accepted");
    send_ack(conn, identity, version, None, Some(identity.encrypt_public())).await
}

#[allow(clippy::too_many_arguments)]
async fn handle_inject(
    inner: &EngineInner,
    conn: &mut dyn Connection,
    identity: &Identity,
    version: u32,
    from: PublicKey,
    session: &str,
    payload: &str,
    frame_ephemeral: Option<EncryptPublicKey>,
    my_eph: &EphemeralKeypair,
) -> Result<()> {
    if !inner.rate.check(&from, RateClass::Injects) {
        return send_reject(conn, identity, version, REASON_RATE_LIMITED, None).await;
    }
    if !inner.trust.is_authorized(&from, session) {
        debug!(peer = %short_id(&from), session, "unauthorized inject");
        return send_reject(conn, identity, version, "unauthorized", None).await;
    }

    let decrypted = match (version >= 2, frame_ephemeral) {
        (true, Some(their_eph)) => ecdh::decrypt_with_ephemeral(payload, my_eph, &their_eph),
        _ => {
            // v1 fallback: static ECDH against the key the grant holds.
            let Some(peer_encrypt) = inner
                .trust
                .grant_for_peer(&from)
                .and_then(|g| g.peer_encrypt_pub)
            else {
                return send_reject(conn, identity, version, "missing encryption key", None).await;
            };
            ecdh::decrypt_static(payload, identity.encrypt_keypair(), &peer_encrypt)
        }
    };

    let message = match decrypted {
        Ok(message) => message,
        Err(_) => {
            // Undecryptable under the negotiated keys: treat as tampering.
            inner.rate.charge(&from, RateClass::InvalidMessages);
            return Ok(());
        }
    };

    match inner.handler.on_inject(session, &message, &from).await {
        Ok(()) => {
            debug!(peer = %short_id(&from), session, "inject delivered");
            send_ack(conn, identity, version, Some(session.to_string()), None).await
        }
        Err(e) => {
            warn!(peer = %short_id(&from), session, error = %e, "inject handler failed");
            send_reject(
                conn,
                identity,
                version,
                "inject failed",
                Some(session.to_string()),
            )
            .await
        }
    }
}

async fn handle_key_rotation(
    inner: &EngineInner,
    conn: &mut dyn Connection,
    identity: &Identity,
    version: u32,
    from: PublicKey,
    rotation: &KeyRotation,
) -> Result<()> {
    let updated = match inner.trust.process_peer_key_rotation(rotation) {
        Ok(updated) => updated,
        Err(_) => false,
    };

    if updated {
        info!(
            old = %short_id(&rotation.old_sign_pub),
            new = %short_id(&rotation.new_sign_pub),
            announcer = %short_id(&from),
            "peer key rotated"
        );
        send_ack(conn, identity, version, None, None).await
    } else {
        send_reject(conn, identity, version, "invalid key rotation", None).await
    }
}

// ---- frame plumbing ----------------------------------------------------

async fn write_frame(conn: &mut dyn Connection, frame: &Frame) -> Result<()> {
    conn.write_line(&frame.to_line()?).await
}

async fn send_ack(
    conn: &mut dyn Connection,
    identity: &Identity,
    version: u32,
    session: Option<String>,
    encrypt_pub: Option<EncryptPublicKey>,
) -> Result<()> {
    let frame = Frame::unsigned(
        version,
        identity.sign_public(),
        FrameBody::Ack {
            session,
            encrypt_pub,
        },
    )
    .sign(identity.sign_keypair())?;
    write_frame(conn, &frame).await
}

async fn send_reject(
    conn: &mut dyn Connection,
    identity: &Identity,
    version: u32,
    reason: &str,
    session: Option<String>,
) -> Result<()> {
    let frame = Frame::unsigned(
        version,
        identity.sign_public(),
        FrameBody::Reject {
            reason: reason.to_string(),
            session,
        },
    )
    .sign(identity.sign_keypair())?;
    write_frame(conn, &frame).await
}
