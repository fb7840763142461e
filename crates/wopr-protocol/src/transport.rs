//! Seams to the outside: the consumed transport and the exposed injection
//! handler.

use async_trait::async_trait;
use tokio::sync::mpsc;

use wopr_core::PublicKey;

use crate::error::Result;

/// 32-byte rendezvous identifier; always `SHA-256(signPub)` of the listener.
pub type Topic = [u8; 32];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportRole {
    /// Accept inbound connections on the topic.
    Server,
    /// Dial whoever serves the topic.
    Client,
}

/// One bidirectional, line-oriented byte stream.
#[async_trait]
pub trait Connection: Send {
    /// Next line, without its terminator; `None` once the peer is gone.
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Write one line; the transport appends the terminator.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    async fn close(&mut self);
}

/// The opaque peer-discovery overlay, reduced to what the engine needs.
///
/// How topics map to peers is the transport's business; the engine only ever
/// joins `topic_of(key)` and exchanges lines on the connections that appear.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join a topic; the receiver yields connections as they are
    /// established.
    async fn join(
        &self,
        topic: Topic,
        role: TransportRole,
    ) -> Result<mpsc::Receiver<Box<dyn Connection>>>;

    /// Release all resources held by the transport.
    async fn destroy(&self);
}

/// Error type handlers may surface; translated into `reject{"inject
/// failed"}`, never fatal to the connection.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of delivered payloads, invoked exactly once per accepted inject.
#[async_trait]
pub trait InjectHandler: Send + Sync {
    async fn on_inject(
        &self,
        session: &str,
        message: &str,
        from: &PublicKey,
    ) -> std::result::Result<(), HandlerError>;
}
