//! Event handler registration and dispatch.
//!
//! Handlers are kept per event kind, append-only, and run in registration
//! order. When several handlers return a value, the *last* one wins.
//!
//! A panic inside a handler is caught where it is dispatched. Panics from
//! `open`, `message` and `close` handlers are turned into
//! [`Error::CallbackPanicked`] and handed to the `error` handlers; the
//! remaining handlers of the same event still run, and the connection keeps
//! going. Panics from `error` and `tick` handlers are logged.

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{Error, client::Client, hub::Hub, message::Message};

/// The events a collaborator can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Error,
    Close,
    Tick,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Open => "open",
            EventKind::Message => "message",
            EventKind::Error => "error",
            EventKind::Close => "close",
            EventKind::Tick => "tick",
        })
    }
}

/// Returned from a `message` handler to close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stop;

/// What `message`, `error` and `close` events are dispatched against: the
/// client, plus the session value the `open` handlers returned, if any.
pub struct Target<S> {
    client: Client,
    session: Option<Arc<S>>,
}

impl<S> Target<S> {
    pub(crate) fn new(client: Client, session: Option<Arc<S>>) -> Self {
        Self { client, session }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The value returned by the last `open` handler that returned one.
    pub fn session(&self) -> Option<&S> {
        self.session.as_deref()
    }
}

impl<S> Clone for Target<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            session: self.session.clone(),
        }
    }
}

impl<S> fmt::Debug for Target<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("client", &self.client)
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

pub type OpenHandler<S> = dyn Fn(&Client) -> Option<S> + Send + Sync;
pub type MessageHandler<S> = dyn Fn(&Target<S>, &Message) -> Option<Stop> + Send + Sync;
pub type ErrorHandler<S> = dyn Fn(&Target<S>, &Error) + Send + Sync;
pub type CloseHandler<S> = dyn Fn(&Target<S>) + Send + Sync;
pub type TickHandler<S> = dyn Fn(&Hub<S>) + Send + Sync;

struct Handlers<F: ?Sized>(RwLock<Vec<Arc<F>>>);

impl<F: ?Sized> Handlers<F> {
    fn new() -> Self {
        Self(RwLock::new(Vec::new()))
    }

    fn push(&self, handler: Arc<F>) {
        self.0.write().push(handler);
    }

    fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Runs every handler registered so far, outside of the lock so handlers
    /// may register more handlers. Returns the last `Some` and the panics.
    fn dispatch<R>(
        &self,
        event: EventKind,
        mut call: impl FnMut(&F) -> Option<R>,
    ) -> (Option<R>, Vec<Error>) {
        let snapshot: Vec<Arc<F>> = self.0.read().clone();

        let mut result = None;
        let mut panics = Vec::new();
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| call(&handler))) {
                Ok(Some(value)) => result = Some(value),
                Ok(None) => {}
                Err(payload) => panics.push(Error::CallbackPanicked {
                    event,
                    message: panic_message(payload.as_ref()),
                }),
            }
        }
        (result, panics)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Handler lists for one hub.
pub struct Callbacks<S> {
    open: Handlers<OpenHandler<S>>,
    message: Handlers<MessageHandler<S>>,
    error: Handlers<ErrorHandler<S>>,
    close: Handlers<CloseHandler<S>>,
    tick: Handlers<TickHandler<S>>,
}

impl<S: 'static> Default for Callbacks<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> Callbacks<S> {
    pub fn new() -> Self {
        Self {
            open: Handlers::new(),
            message: Handlers::new(),
            error: Handlers::new(),
            close: Handlers::new(),
            tick: Handlers::new(),
        }
    }

    pub fn on_open<F>(&self, handler: F)
    where
        F: Fn(&Client) -> Option<S> + Send + Sync + 'static,
    {
        self.open.push(Arc::new(handler));
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Target<S>, &Message) -> Option<Stop> + Send + Sync + 'static,
    {
        self.message.push(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Target<S>, &Error) + Send + Sync + 'static,
    {
        self.error.push(Arc::new(handler));
    }

    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(&Target<S>) + Send + Sync + 'static,
    {
        self.close.push(Arc::new(handler));
    }

    pub fn on_tick<F>(&self, handler: F)
    where
        F: Fn(&Hub<S>) + Send + Sync + 'static,
    {
        self.tick.push(Arc::new(handler));
    }

    /// Number of handlers registered for `event`.
    pub fn count(&self, event: EventKind) -> usize {
        match event {
            EventKind::Open => self.open.len(),
            EventKind::Message => self.message.len(),
            EventKind::Error => self.error.len(),
            EventKind::Close => self.close.len(),
            EventKind::Tick => self.tick.len(),
        }
    }

    /// Fires `open` and builds the target for the rest of the connection.
    pub fn fire_open(&self, client: &Client) -> Target<S> {
        let (session, panics) = self.open.dispatch(EventKind::Open, |handler| handler(client));
        let target = Target::new(client.clone(), session.map(Arc::new));
        self.report(&target, panics);
        target
    }

    /// Fires `message`; `Some(Stop)` if any handler asked to close.
    pub fn fire_message(&self, target: &Target<S>, message: &Message) -> Option<Stop> {
        let (stop, panics) = self
            .message
            .dispatch(EventKind::Message, |handler| handler(target, message));
        self.report(target, panics);
        stop
    }

    pub fn fire_error(&self, target: &Target<S>, error: &Error) {
        let (_, panics): (Option<()>, _) = self.error.dispatch(EventKind::Error, |handler| {
            handler(target, error);
            None
        });
        for panic in panics {
            tracing::error!(client_id = target.client.id(), error = %panic, "error handler panicked");
        }
    }

    pub fn fire_close(&self, target: &Target<S>) {
        let (_, panics): (Option<()>, _) = self.close.dispatch(EventKind::Close, |handler| {
            handler(target);
            None
        });
        self.report(target, panics);
    }

    pub fn fire_tick(&self, hub: &Hub<S>) {
        let (_, panics): (Option<()>, _) = self.tick.dispatch(EventKind::Tick, |handler| {
            handler(hub);
            None
        });
        for panic in panics {
            tracing::error!(error = %panic, "tick handler panicked");
        }
    }

    fn report(&self, target: &Target<S>, panics: Vec<Error>) {
        for panic in panics {
            tracing::warn!(client_id = target.client.id(), error = %panic, "callback panicked");
            self.fire_error(target, &panic);
        }
    }
}
