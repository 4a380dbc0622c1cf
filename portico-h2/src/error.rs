use thiserror::Error;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Errors surfaced by a stream to the connection.
///
/// The connection translates these into RST_STREAM or GOAWAY; the stream
/// itself never emits frames for its own failures.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Illegal frame for the current state, window underflow, or malformed
    /// message after decoding.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Abusive but not strictly invalid peer behavior (e.g. WINDOW_UPDATE
    /// flooding).
    #[error("enhance your calm: {0}")]
    EnhanceYourCalm(&'static str),
    /// Header decode failure passed through from the HPACK decoder.
    #[error("header decompression failed")]
    Compression(ErrorCode),
    /// An operation was attempted on a closed stream.
    #[error("stream closed")]
    StreamClosed,
}

impl StreamError {
    /// The HTTP/2 error code to report upward.
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamError::Protocol(_) => ErrorCode::ProtocolError,
            StreamError::EnhanceYourCalm(_) => ErrorCode::EnhanceYourCalm,
            StreamError::Compression(code) => *code,
            StreamError::StreamClosed => ErrorCode::StreamClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for raw in 0x0..=0xd {
            assert_eq!(ErrorCode::from_u32(raw) as u32, raw);
        }
        assert_eq!(ErrorCode::from_u32(0x99), ErrorCode::InternalError);
    }

    #[test]
    fn stream_error_codes() {
        assert_eq!(
            StreamError::Protocol("x").code(),
            ErrorCode::ProtocolError
        );
        assert_eq!(
            StreamError::EnhanceYourCalm("x").code(),
            ErrorCode::EnhanceYourCalm
        );
        assert_eq!(
            StreamError::Compression(ErrorCode::CompressionError).code(),
            ErrorCode::CompressionError
        );
    }
}
