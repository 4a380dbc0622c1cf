//! Per-stream frame view.
//!
//! The connection layer owns the wire codec; a stream only ever sees
//! already-demultiplexed frames addressed to it. [`StreamFrame`] is that
//! view: type, flags, and the raw payload (header-block fragment, DATA
//! bytes, or a WINDOW_UPDATE increment).

use bytes::Bytes;

use crate::error::StreamError;

/// Frame types a stream can be handed (RFC 7540 Section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

// Flag constants.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// A demultiplexed frame addressed to one stream.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub kind: FrameType,
    pub flags: u8,
    pub payload: Bytes,
}

impl StreamFrame {
    pub fn new(kind: FrameType, flags: u8, payload: impl Into<Bytes>) -> Self {
        StreamFrame {
            kind,
            flags,
            payload: payload.into(),
        }
    }

    pub fn end_stream(&self) -> bool {
        matches!(self.kind, FrameType::Data | FrameType::Headers)
            && self.flags & FLAG_END_STREAM != 0
    }

    pub fn end_headers(&self) -> bool {
        matches!(
            self.kind,
            FrameType::Headers | FrameType::Continuation | FrameType::PushPromise
        ) && self.flags & FLAG_END_HEADERS != 0
    }

    /// WINDOW_UPDATE increment (payload is a 31-bit big-endian integer).
    pub fn window_increment(&self) -> Result<u32, StreamError> {
        if self.kind != FrameType::WindowUpdate || self.payload.len() != 4 {
            return Err(StreamError::Protocol("malformed WINDOW_UPDATE payload"));
        }
        let raw = u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Ok(raw & 0x7fff_ffff)
    }
}
