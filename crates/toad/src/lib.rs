//! # toad
//!
//! Toad the web socket: a small server-side WebSocket (RFC 6455) engine.
//!
//! The engine terminates TCP (optionally TLS) connections, performs the HTTP
//! upgrade handshake, frames and unframes messages, answers pings, measures
//! round-trip times with its own pings and hands everything to application
//! code through event callbacks: `open`, `message`, `error`, `close` and a
//! periodic `tick`.
//!
//! # Example
//! ```no_run
//! use toad::{Server, ServerConfig};
//!
//! # async fn run() -> toad::Result<()> {
//! let server: Server = Server::new(ServerConfig::new("0.0.0.0", 1234));
//!
//! server.hub().on_message(|target, message| {
//!     if let Some(text) = message.as_text() {
//!         let _ = target.client().send(format!("You said: {text}"));
//!     }
//!     None
//! });
//!
//! server.run().await
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Application callbacks (open/message/...)    │
//! └──────────────────┬──────────────────────────┘
//!                    │
//! ┌──────────────────▼──────────────────────────┐
//! │ Hub: client registry + callback registry    │
//! └──────────────────┬──────────────────────────┘
//!                    │
//! ┌──────────────────▼──────────────────────────┐
//! │ Connection: handshake, read loop, writer    │
//! │ • message reassembly                        │
//! │ • ping/pong and RTT tracking                │
//! └──────────────────┬──────────────────────────┘
//!                    │
//! ┌──────────────────▼──────────────────────────┐
//! │ Codec: frame encoding/decoding, masking     │
//! └──────────────────┬──────────────────────────┘
//!                    │
//!             Network (TCP/TLS)
//! ```

pub mod assemble;
pub mod callbacks;
pub mod client;
pub mod close;
pub mod codec;
mod connection;
pub mod frame;
pub mod handshake;
mod hub;
pub mod mask;
pub mod message;
pub mod options;
pub mod ping;
pub mod registry;
mod server;
mod stream;
pub mod tick;
pub mod tls;

pub use callbacks::{EventKind, Stop, Target};
pub use client::Client;
pub use close::CloseCode;
pub use connection::ConnectionState;
pub use frame::{Frame, OpCode};
pub use hub::Hub;
pub use message::{Message, MessageKind};
pub use options::Options;
pub use server::{Server, ServerConfig};
pub use stream::MaybeTlsStream;
pub use tls::TlsFiles;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine, either returned from an operation or handed
/// to the `error` callbacks of the connection they occurred on.
#[derive(Error, Debug)]
pub enum Error {
    /// The upgrade request was malformed or lacked a required header.
    #[error("bad handshake: {reason}")]
    BadHandshake {
        /// The raw request head as received.
        request: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// A frame (or reassembled message) declared more bytes than allowed.
    #[error("payload of {length} bytes exceeds the limit of {max} bytes")]
    PayloadTooLarge { length: u64, max: usize },

    /// The peer broke the framing rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    /// Attempted to encode a control frame with more than 125 payload bytes.
    #[error("control frame payload of {length} bytes exceeds 125 bytes")]
    ControlPayloadTooLarge { length: usize },

    /// The connection is not open (not yet upgraded, or already closed).
    #[error("connection is closed")]
    ConnectionClosed,

    /// An application callback panicked while handling an event.
    #[error("{event} callback panicked: {message}")]
    CallbackPanicked { event: EventKind, message: String },

    /// Loading the TLS certificate or key failed.
    #[error("tls: {message}")]
    Tls { message: String },

    /// Serializing a JSON payload failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The specific framing rule a peer violated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// One of the RSV1-3 bits was set; no extension is ever negotiated.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Opcode outside of {0, 1, 2, 8, 9, 10}.
    #[error("invalid opcode (byte={0:#x})")]
    InvalidOpCode(u8),

    /// A client frame arrived without a masking key.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// A new text/binary frame arrived while a fragmented message was in progress.
    #[error("expected a continuation frame")]
    ExpectedContinuation,

    /// A text message was not valid UTF-8.
    #[error("text message is not valid UTF-8")]
    InvalidUtf8,

    /// A control frame had FIN unset.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared more than 125 payload bytes.
    #[error("control frame payload of {0} bytes exceeds 125 bytes")]
    ControlFrameTooLarge(u64),
}

impl Error {
    /// Returns `true` if the peer violated the framing protocol.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }

    /// Returns `true` if the upgrade handshake failed.
    pub fn is_handshake_error(&self) -> bool {
        matches!(self, Self::BadHandshake { .. })
    }

    /// Returns `true` if this wraps an I/O error.
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Returns the underlying I/O error, if any.
    pub fn as_io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }

    /// The close code sent to the peer when this error aborts a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::PayloadTooLarge { .. } => CloseCode::Size,
            Self::ProtocolViolation(ProtocolViolation::InvalidUtf8) => CloseCode::Invalid,
            Self::ProtocolViolation(_) => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}
