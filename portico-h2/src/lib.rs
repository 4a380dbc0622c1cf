//! portico-h2 — per-stream HTTP/2 transaction core.
//!
//! One `Http2Stream` represents a single multiplexed request/response
//! exchange on a client-facing proxy connection. The connection feeds it
//! demultiplexed frames; an HTTP/1.x transaction driver reads the request
//! and writes the response through a byte-oriented VIO contract; outbound
//! HEADERS/DATA emission is requested back from the connection under
//! per-stream flow control.
//!
//! ```text
//!   connection demux                         transaction driver
//!   HEADERS/DATA/RST/WU ──► Http2Stream ──► read VIO (HTTP/1.1 bytes)
//!                              │  ▲
//!        SessionApi ◄──────────┘  └──────── write VIO (HTTP/1 response)
//!   (HEADERS/DATA frames out)
//! ```
//!
//! HPACK, connection framing, the priority tree, and the transport are
//! external collaborators; their contracts are the [`HeaderDecoder`] and
//! [`SessionApi`] traits. Scheduling, thread affinity, and timeouts come
//! from the `portico` runtime.

pub mod config;
pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod headers;
pub(crate) mod metrics;
pub mod milestone;
pub mod session;
pub mod state;
pub mod stream;
pub mod vio;

/// Stream-core tunables.
pub use config::Http2Params;
/// HTTP/2 error codes (RFC 7540 Section 7).
pub use error::ErrorCode;
/// Errors surfaced by a stream to the connection.
pub use error::StreamError;
/// Per-stream flow control windows.
pub use flowcontrol::StreamWindows;
/// A demultiplexed frame addressed to one stream.
pub use frame::{FrameType, StreamFrame};
/// HPACK decoder contract.
pub use headers::HeaderDecoder;
/// A decoded header field.
pub use headers::HeaderField;
/// Parsed HTTP/1.x response head.
pub use headers::ResponseHead;
/// Stream lifetime milestones.
pub use milestone::{Milestone, MilestoneLog};
/// Contracts between stream and connection.
pub use session::{SessionApi, ShutdownState, StreamCx, StreamKey, StreamTable};
/// Stream state machine.
pub use state::StreamState;
/// The per-stream transaction core.
pub use stream::{Http2Stream, StreamReenable, TransactionDriver};
/// Byte-pipe handles.
pub use vio::{ByteRing, RingRef, VioHandle, VioSide};
