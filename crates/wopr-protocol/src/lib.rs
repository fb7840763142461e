#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! Versioned wire protocol and connection engine.
//!
//! Frames are single newline-terminated lines of canonical JSON, signed by
//! the sender and replay-protected by nonce. Each connection carries exactly
//! one handshake (`hello` → `hello-ack`, with version negotiation and
//! ephemeral key exchange) followed by exactly one typed request (`inject`,
//! `claim`, or `key-rotation`) answered by `ack` or `reject`.
//!
//! The [`ProtocolEngine`] sits between an opaque [`Transport`] (byte streams
//! keyed by 32-byte topics) and the identity/trust stores, and never leaks an
//! error across its boundary: every send path resolves to a [`Delivery`].

mod delivery;
mod engine;
mod error;
mod frame;
pub mod testkit;
mod transport;

pub use delivery::Delivery;
pub use engine::{EngineConfig, ListenerHandle, ProtocolEngine};
pub use error::{Error, Result};
pub use frame::{Frame, FrameBody, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use transport::{Connection, HandlerError, InjectHandler, Topic, Transport, TransportRole};
