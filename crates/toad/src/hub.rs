use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    Error, Result,
    callbacks::{Callbacks, Stop, Target},
    client::Client,
    connection,
    message::Message,
    options::Options,
    registry::ClientRegistry,
};

/// The server context: live clients, event handlers and options.
///
/// A `Hub` is what a [`Server`](crate::Server) feeds accepted streams into,
/// and what collaborators hold on to for broadcasting. Every hub is
/// independent, so several servers (or tests) can run in one process.
///
/// `S` is the session type `open` handlers may return; it defaults to `()`.
pub struct Hub<S = ()> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    registry: ClientRegistry,
    callbacks: Callbacks<S>,
    next_id: AtomicU64,
    options: Options,
}

impl<S> Clone for Hub<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> Default for Hub<S> {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl<S: Send + Sync + 'static> Hub<S> {
    pub fn new(options: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: ClientRegistry::new(),
                callbacks: Callbacks::new(),
                next_id: AtomicU64::new(1),
                options,
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Runs when a handshake succeeds. A returned value becomes the session
    /// every later event of that connection is dispatched with.
    pub fn on_open<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Client) -> Option<S> + Send + Sync + 'static,
    {
        self.inner.callbacks.on_open(handler);
        self
    }

    /// Runs for every complete message. Return `Some(Stop)` to close.
    pub fn on_message<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Target<S>, &Message) -> Option<Stop> + Send + Sync + 'static,
    {
        self.inner.callbacks.on_message(handler);
        self
    }

    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Target<S>, &Error) + Send + Sync + 'static,
    {
        self.inner.callbacks.on_error(handler);
        self
    }

    pub fn on_close<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Target<S>) + Send + Sync + 'static,
    {
        self.inner.callbacks.on_close(handler);
        self
    }

    /// Runs on every tick of the server's tick period.
    pub fn on_tick<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Hub<S>) + Send + Sync + 'static,
    {
        self.inner.callbacks.on_tick(handler);
        self
    }

    pub fn client(&self, id: u64) -> Option<Client> {
        self.inner.registry.lookup(id)
    }

    /// Clients open right now, ordered by id.
    pub fn open_clients(&self) -> Vec<Client> {
        self.inner.registry.all_open()
    }

    /// Queues `message` to every open client; returns how many.
    pub fn send_all(&self, message: impl Into<Message>) -> usize {
        self.inner.registry.broadcast(message)
    }

    /// Serializes `value` once and queues it to every open client.
    pub fn send_all_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<usize> {
        let text = serde_json::to_string(value)?;
        Ok(self.send_all(text))
    }

    /// Fires the `tick` handlers once.
    pub fn tick(&self) {
        self.inner.callbacks.fire_tick(self);
    }

    /// Serves one accepted stream until its connection closes.
    pub async fn handle<IO>(&self, io: IO, peer: Option<SocketAddr>)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        connection::serve(self.clone(), io, peer).await
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn registry(&self) -> &ClientRegistry {
        &self.inner.registry
    }

    pub(crate) fn callbacks(&self) -> &Callbacks<S> {
        &self.inner.callbacks
    }
}
