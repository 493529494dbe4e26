//! State-synchronization subsystem
//!
//! A server instance holding the music library mirrors its entity model
//! live to client instances over a persistent TCP connection. Properties
//! map onto topics; the server keeps retained messages per topic so late
//! joiners receive a full snapshot on subscribe. Outbound publishes are
//! coalesced per topic through a single dispatcher; inbound applies are
//! guarded by a per-topic payload lock that suppresses echo loops.

pub mod client;
pub mod countdown;
pub mod locks;
pub mod queue;
pub mod server;
pub mod topics;
pub mod transport;

pub use client::SyncClient;
pub use server::SyncServer;

use crate::error::Result;
use crate::status::StatusToken;
use topics::Command;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{oneshot, watch};

/// How long the dispatcher waits for an acknowledgment before retrying.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection lifecycle of a communicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Opening,
    Syncing,
    Open,
}

/// Either communicator role behind one face, so the build lifecycle can
/// drive them uniformly.
pub enum Communicator {
    Server(SyncServer),
    Client(SyncClient),
}

impl Communicator {
    /// Run the role's sync stage: snapshot publication for the server,
    /// retained-topic countdown for the client.
    pub async fn sync(&self, token: &StatusToken) -> Result<()> {
        match self {
            Communicator::Server(server) => server.sync(token).await,
            Communicator::Client(client) => client.sync(token).await,
        }
    }

    pub async fn send_command(&self, command: Command) -> Result<()> {
        match self {
            Communicator::Server(server) => server.send_command(command).await,
            Communicator::Client(client) => {
                client.send_command(command);
                Ok(())
            }
        }
    }

    pub fn state(&self) -> ConnState {
        match self {
            Communicator::Server(server) => server.state(),
            Communicator::Client(client) => client.state(),
        }
    }

    pub async fn wait_closed(&self) {
        match self {
            Communicator::Server(server) => server.wait_closed().await,
            Communicator::Client(client) => client.wait_closed().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Communicator::Server(server) => server.close().await,
            Communicator::Client(client) => client.close().await,
        }
    }
}

/// Wait on a state watch until the connection reports closed.
pub(crate) async fn wait_closed(mut rx: watch::Receiver<ConnState>) {
    loop {
        if *rx.borrow() == ConnState::Closed {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Outstanding acknowledgment registry for in-flight publishes.
#[derive(Debug, Default)]
pub(crate) struct AckRegistry {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<()>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register interest in the ack for `id` before the publish goes out.
    pub fn register(&self, id: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("ack registry poisoned")
            .insert(id, tx);
        rx
    }

    /// Resolve an inbound ack. Unknown ids (already timed out, or a
    /// retained-delivery ack the server does not track) are ignored.
    pub fn resolve(&self, id: u32) {
        if let Some(tx) = self
            .pending
            .lock()
            .expect("ack registry poisoned")
            .remove(&id)
        {
            let _ = tx.send(());
        }
    }

    /// Drop interest after a timeout so the map cannot grow unboundedly.
    pub fn forget(&self, id: u32) {
        self.pending
            .lock()
            .expect("ack registry poisoned")
            .remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_registry_resolves_registered_id() {
        let acks = AckRegistry::new();
        let id = acks.next_id();
        let rx = acks.register(id);
        acks.resolve(id);
        rx.await.expect("ack should resolve");
    }

    #[tokio::test]
    async fn test_ack_registry_ignores_unknown_id() {
        let acks = AckRegistry::new();
        acks.resolve(12345); // no-op
    }

    #[tokio::test]
    async fn test_forget_makes_ack_channel_error() {
        let acks = AckRegistry::new();
        let id = acks.next_id();
        let rx = acks.register(id);
        acks.forget(id);
        assert!(rx.await.is_err());
    }
}
