//! Per-stream flow control windows (RFC 7540 Section 6.9).
//!
//! Two independent signed counters: `client_rwnd` is the receive credit we
//! have granted the peer, `server_rwnd` is the send credit the peer has
//! granted us. Underflow leaves the post-arithmetic value in place and
//! reports `ProtocolError`; the connection tears the stream down.
//!
//! Increments of `client_rwnd` feed an abuse detector: the last
//! [`RECENT_UPDATES`] increments are averaged, and a mean below the
//! configured floor reports `EnhanceYourCalm` — a peer coercing us into
//! many tiny updates is an amplification vector.

use crate::error::ErrorCode;
use crate::metrics;

/// Default initial window size (RFC 7540 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: i64 = 65535;

/// Size of the recent-increment ring.
pub const RECENT_UPDATES: usize = 5;

#[derive(Debug)]
pub struct StreamWindows {
    client_rwnd: i64,
    server_rwnd: i64,
    recent_increments: [u64; RECENT_UPDATES],
    recent_index: usize,
    min_avg_window_update: f64,
}

impl StreamWindows {
    /// `client_rwnd` comes from our SETTINGS, `server_rwnd` from the peer's.
    pub fn new(initial_client_rwnd: i64, initial_server_rwnd: i64, min_avg_window_update: f64) -> Self {
        StreamWindows {
            client_rwnd: initial_client_rwnd,
            server_rwnd: initial_server_rwnd,
            // Saturated slots keep the mean high until the ring has seen
            // RECENT_UPDATES real increments.
            recent_increments: [u64::MAX; RECENT_UPDATES],
            recent_index: 0,
            min_avg_window_update,
        }
    }

    pub fn client_rwnd(&self) -> i64 {
        self.client_rwnd
    }

    pub fn server_rwnd(&self) -> i64 {
        self.server_rwnd
    }

    /// Grant the peer more receive credit (we are about to send a
    /// WINDOW_UPDATE). Records the increment for the abuse check.
    pub fn increment_client_rwnd(&mut self, amount: u64) -> ErrorCode {
        self.client_rwnd += amount as i64;

        self.recent_increments[self.recent_index] = amount;
        self.recent_index = (self.recent_index + 1) % RECENT_UPDATES;
        let sum: f64 = self.recent_increments.iter().map(|&v| v as f64).sum();
        let avg = sum / RECENT_UPDATES as f64;
        if avg < self.min_avg_window_update {
            metrics::ENHANCE_YOUR_CALM.increment();
            return ErrorCode::EnhanceYourCalm;
        }
        ErrorCode::NoError
    }

    /// Consume receive credit (the peer sent DATA).
    pub fn decrement_client_rwnd(&mut self, amount: u64) -> ErrorCode {
        self.client_rwnd -= amount as i64;
        if self.client_rwnd < 0 {
            ErrorCode::ProtocolError
        } else {
            ErrorCode::NoError
        }
    }

    /// The peer granted us send credit (WINDOW_UPDATE received). Always
    /// succeeds; the aggregate bound is enforced at the connection level.
    pub fn increment_server_rwnd(&mut self, amount: u64) -> ErrorCode {
        self.server_rwnd += amount as i64;
        ErrorCode::NoError
    }

    /// Consume send credit (we sent DATA).
    pub fn decrement_server_rwnd(&mut self, amount: u64) -> ErrorCode {
        self.server_rwnd -= amount as i64;
        if self.server_rwnd < 0 {
            ErrorCode::ProtocolError
        } else {
            ErrorCode::NoError
        }
    }
}
