//! In-memory transport for tests and local wiring.
//!
//! A [`MemoryHub`] routes client joins to whichever node is serving the same
//! topic, over paired in-process channels. Semantics match the real overlay
//! closely enough for end-to-end protocol tests: connections are
//! bidirectional line streams and closing one half ends the other's reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{Connection, Topic, Transport, TransportRole};

const CONNECTION_BACKLOG: usize = 16;
const LINE_BACKLOG: usize = 64;

/// Shared rendezvous table; clone the `Arc` into every node's transport.
#[derive(Default)]
pub struct MemoryHub {
    servers: Mutex<HashMap<Topic, mpsc::Sender<Box<dyn Connection>>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Transport for MemoryHub {
    async fn join(
        &self,
        topic: Topic,
        role: TransportRole,
    ) -> Result<mpsc::Receiver<Box<dyn Connection>>> {
        match role {
            TransportRole::Server => {
                let (tx, rx) = mpsc::channel(CONNECTION_BACKLOG);
                self.lock().insert(topic, tx);
                Ok(rx)
            }
            TransportRole::Client => {
                let server = self
                    .lock()
                    .get(&topic)
                    .cloned()
                    .ok_or_else(|| Error::Transport("no listener on topic".to_string()))?;

                let (local, remote) = MemoryConnection::pair();
                server
                    .send(Box::new(remote))
                    .await
                    .map_err(|_| Error::Transport("listener gone".to_string()))?;

                let (tx, rx) = mpsc::channel(1);
                tx.send(Box::new(local) as Box<dyn Connection>)
                    .await
                    .map_err(|_| Error::Transport("connection channel closed".to_string()))?;
                Ok(rx)
            }
        }
    }

    async fn destroy(&self) {
        self.lock().clear();
    }
}

impl MemoryHub {
    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<Topic, mpsc::Sender<Box<dyn Connection>>>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One half of an in-memory duplex line stream.
pub struct MemoryConnection {
    tx: Option<mpsc::Sender<String>>,
    rx: mpsc::Receiver<String>,
}

impl MemoryConnection {
    /// Two connected halves.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(LINE_BACKLOG);
        let (b_tx, b_rx) = mpsc::channel(LINE_BACKLOG);
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(Error::ConnectionClosed)?;
        tx.send(line.to_string())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}
