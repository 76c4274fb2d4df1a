//! Round-trip time measurement with ping/pong control frames.
//!
//! Every ping the server sends carries a fresh random token. The matching
//! pong moves the token out of `pending` and appends the elapsed time to
//! `history`. Pongs carrying anything else (unsolicited pongs, answers to
//! pings that were already matched or evicted) are dropped.
//!
//! At most [`MAX_PENDING`] pings are outstanding; issuing one more forgets
//! the oldest, so a peer that never answers costs a bounded amount of memory.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

/// Length of a ping token.
pub const TOKEN_LEN: usize = 8;

pub type Token = [u8; TOKEN_LEN];

/// Outstanding pings kept per client.
pub const MAX_PENDING: usize = 64;

/// Outstanding pings and measured round-trip times for one client.
#[derive(Debug, Default)]
pub struct PingRecord {
    pending: HashMap<Token, Instant>,
    history: Vec<Duration>,
}

impl PingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new outstanding ping sent at `now` and returns its token.
    ///
    /// The token is not shared with any other pending ping. When
    /// [`MAX_PENDING`] pings are already outstanding the oldest is dropped.
    pub fn issue(&mut self, now: Instant) -> Token {
        if self.pending.len() >= MAX_PENDING {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, sent)| **sent)
                .map(|(token, _)| *token);
            if let Some(oldest) = oldest {
                self.pending.remove(&oldest);
            }
        }

        let token = loop {
            let token: Token = rand::random();
            if !self.pending.contains_key(&token) {
                break token;
            }
        };
        self.pending.insert(token, now);
        token
    }

    /// Matches a pong payload received at `now` against the pending pings.
    ///
    /// Returns the round-trip time if the payload was a pending token.
    pub fn resolve(&mut self, payload: &[u8], now: Instant) -> Option<Duration> {
        let token = Token::try_from(payload).ok()?;
        let sent = self.pending.remove(&token)?;
        let rtt = now.saturating_duration_since(sent);
        self.history.push(rtt);
        Some(rtt)
    }

    /// The most recent round-trip time, if any pong was ever matched.
    pub fn last_rtt(&self) -> Option<Duration> {
        self.history.last().copied()
    }

    /// Every measured round-trip time, oldest first.
    pub fn history(&self) -> &[Duration] {
        &self.history
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
