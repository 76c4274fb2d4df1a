//! Per-connection engine options.

/// Default limit for a single frame's payload: 100 MiB.
pub const MAX_PAYLOAD: usize = 100 * 1024 * 1024;

/// Default limit for the upgrade request head: 8 KiB.
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Options applied to every connection a hub serves.
///
/// ```rust
/// use toad::Options;
///
/// let options = Options::default()
///     .with_max_payload(1024 * 1024)
///     .with_fragment_size(16 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Largest payload a single incoming frame may declare. Larger frames
    /// close the connection with status 1009.
    ///
    /// Default: [`MAX_PAYLOAD`].
    pub max_payload: usize,

    /// Largest total size of a reassembled message.
    ///
    /// Default: `None`, meaning the same as `max_payload`.
    pub max_message_size: Option<usize>,

    /// Outgoing text and binary messages larger than this are split into a
    /// first frame and continuation frames of at most this many bytes. The
    /// split is byte-exact, so a text message may be cut inside a UTF-8
    /// sequence; the peer reassembles it before decoding.
    ///
    /// Default: `None` (never split).
    pub fragment_size: Option<usize>,

    /// Accept frames from clients that carry no masking key.
    ///
    /// Default: `false`; unmasked client frames are a protocol violation.
    pub accept_unmasked: bool,

    /// Largest upgrade request head, in bytes.
    ///
    /// Default: [`MAX_HANDSHAKE_SIZE`].
    pub max_handshake_size: usize,

    /// Sets `TCP_NODELAY` on accepted sockets.
    ///
    /// Default: `true`.
    pub no_delay: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
            max_message_size: None,
            fragment_size: None,
            accept_unmasked: false,
            max_handshake_size: MAX_HANDSHAKE_SIZE,
            no_delay: true,
        }
    }
}

impl Options {
    #[must_use]
    pub fn with_max_payload(self, max_payload: usize) -> Self {
        Self {
            max_payload,
            ..self
        }
    }

    #[must_use]
    pub fn with_max_message_size(self, max_message_size: usize) -> Self {
        Self {
            max_message_size: Some(max_message_size),
            ..self
        }
    }

    #[must_use]
    pub fn with_fragment_size(self, fragment_size: usize) -> Self {
        Self {
            fragment_size: Some(fragment_size.max(1)),
            ..self
        }
    }

    #[must_use]
    pub fn with_accept_unmasked(self) -> Self {
        Self {
            accept_unmasked: true,
            ..self
        }
    }

    #[must_use]
    pub fn with_max_handshake_size(self, max_handshake_size: usize) -> Self {
        Self {
            max_handshake_size,
            ..self
        }
    }

    #[must_use]
    pub fn with_no_delay(self, no_delay: bool) -> Self {
        Self { no_delay, ..self }
    }

    pub(crate) fn message_limit(&self) -> usize {
        self.max_message_size.unwrap_or(self.max_payload)
    }
}
