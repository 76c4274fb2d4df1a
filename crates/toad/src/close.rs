//! Close status codes (RFC 6455 section 7.4).

/// Status code carried in the first two bytes of a close frame.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: the endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002: the peer broke the protocol.
    Protocol,
    /// 1003: received a kind of data that cannot be accepted.
    Unsupported,
    /// 1007: message data was inconsistent with its type (non UTF-8 text).
    Invalid,
    /// 1008: generic policy violation.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1011: an unexpected condition on the server.
    Error,
    /// Any other code, kept verbatim.
    Other(u16),
}

impl CloseCode {
    /// Whether the code may appear in a close frame on the wire.
    ///
    /// 1004 to 1006 and 1015 are reserved for local use, codes below 1000
    /// are unused and 1016 to 2999 are reserved for future revisions.
    pub fn is_allowed(self) -> bool {
        matches!(u16::from(self), 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Error => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1011 => CloseCode::Error,
            code => CloseCode::Other(code),
        }
    }
}
