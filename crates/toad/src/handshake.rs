//! The HTTP upgrade handshake (RFC 6455 section 4.2).
//!
//! Only the minimum of HTTP/1.1 needed to upgrade a connection is
//! understood: one request head, no body, no keep-alive.

use std::collections::HashMap;

use bytes::BytesMut;
use http::StatusCode;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Error, Result};

/// Appended to the client key before hashing.
pub const MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Computes `Sec-WebSocket-Accept` for a `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    use base64::prelude::*;
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(MAGIC.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// A parsed upgrade request head.
#[derive(Debug, Clone)]
pub struct Request {
    raw: String,
    method: String,
    target: String,
    version: String,
    headers: HashMap<String, String>,
}

impl Request {
    /// Parses a request head (start line plus header lines).
    ///
    /// The start line must have three parts and an `HTTP/` version; nothing
    /// else about it is enforced. Header names are kept as sent, so lookups
    /// are case-sensitive.
    pub fn parse(head: &[u8]) -> Result<Self> {
        let raw = String::from_utf8_lossy(head).into_owned();
        let bad = |reason: &'static str| Error::BadHandshake {
            request: raw.clone(),
            reason,
        };

        let mut lines = raw.split("\r\n").filter(|line| !line.is_empty());
        let start = lines.next().ok_or_else(|| bad("empty request"))?;

        let mut parts = start.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad("malformed request line"));
        };
        if !version.starts_with("HTTP/") {
            return Err(bad("malformed request line"));
        }

        let mut headers = HashMap::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| bad("malformed header line"))?;
            headers.insert(name.trim().to_owned(), value.trim().to_owned());
        }

        Ok(Self {
            method: method.to_owned(),
            target: target.to_owned(),
            version: version.to_owned(),
            headers,
            raw,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The request head exactly as received (lossily decoded).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Case-sensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Validates the upgrade headers and returns the accept token.
    pub fn negotiate(&self) -> Result<String> {
        if self.header("Sec-WebSocket-Version").is_none() {
            return Err(self.rejected("missing Sec-WebSocket-Version header"));
        }
        let key = self
            .header("Sec-WebSocket-Key")
            .ok_or_else(|| self.rejected("missing Sec-WebSocket-Key header"))?;
        Ok(accept_key(key))
    }

    fn rejected(&self, reason: &'static str) -> Error {
        Error::BadHandshake {
            request: self.raw.clone(),
            reason,
        }
    }
}

/// Reads one request head from `reader`, up to and including the blank line.
///
/// `buf` may already hold bytes; any bytes read past the terminator stay in
/// `buf` (a client may pipeline its first frame behind the request). Returns
/// `Ok(None)` if the stream ends before a complete head arrived.
pub async fn read_head<R>(reader: &mut R, buf: &mut BytesMut, max_size: usize) -> Result<Option<BytesMut>>
where
    R: AsyncRead + Unpin,
{
    let mut searched: usize = 0;
    loop {
        let from = searched.saturating_sub(HEAD_TERMINATOR.len() - 1);
        if let Some(pos) = buf[from..]
            .windows(HEAD_TERMINATOR.len())
            .position(|window| window == HEAD_TERMINATOR)
        {
            return Ok(Some(buf.split_to(from + pos + HEAD_TERMINATOR.len())));
        }
        searched = buf.len();

        if buf.len() > max_size {
            return Err(Error::BadHandshake {
                request: String::from_utf8_lossy(buf).into_owned(),
                reason: "request head too large",
            });
        }

        buf.reserve(1024);
        if reader.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

/// `101 Switching Protocols` response for an accepted upgrade.
pub fn switching_protocols(accept: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n\r\n",
        StatusCode::SWITCHING_PROTOCOLS
    )
}

/// `400 Bad Request` response with an empty body.
pub fn bad_request() -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        StatusCode::BAD_REQUEST
    )
}
