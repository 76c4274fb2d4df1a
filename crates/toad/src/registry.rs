//! The table of live clients.
//!
//! A client is inserted when its handshake succeeds and removed when its
//! connection closes, so every id in the table belongs to a connection that
//! is (or was until a moment ago) open.

use crate::{client::Client, frame::Frame, message::Message};

/// Live clients keyed by id.
///
/// Backed by `scc::HashMap`, so registration, removal and enumeration may
/// race freely across tasks and threads.
#[derive(Default)]
pub struct ClientRegistry {
    clients: scc::HashMap<u64, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a client with the same id was already registered.
    pub fn register(&self, client: Client) -> bool {
        self.clients.insert_sync(client.id(), client).is_ok()
    }

    pub fn deregister(&self, id: u64) -> Option<Client> {
        self.clients.remove_sync(&id).map(|(_, client)| client)
    }

    pub fn lookup(&self, id: u64) -> Option<Client> {
        self.clients.update_sync(&id, |_, client| client.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of the clients open right now, ordered by id.
    ///
    /// A client closing concurrently is included or not depending on its open
    /// flag at the moment it is visited.
    pub fn all_open(&self) -> Vec<Client> {
        let mut open = Vec::new();
        self.clients.retain_sync(|_, client| {
            if client.is_open() {
                open.push(client.clone());
            }
            true
        });
        open.sort_by_key(Client::id);
        open
    }

    /// Queues `message` to every open client and returns how many it was
    /// queued to. The frame is built once and shared by all sends.
    pub fn broadcast(&self, message: impl Into<Message>) -> usize {
        let frame = Frame::from(message.into());
        self.all_open()
            .iter()
            .filter(|client| client.send_frame(frame.clone()).is_ok())
            .count()
    }
}
