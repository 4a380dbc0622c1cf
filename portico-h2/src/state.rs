//! Stream state machine (RFC 7540 Section 5.1).

use crate::frame::{FLAG_END_HEADERS, FrameType};

/// State of an HTTP/2 stream (RFC 7540 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No frames exchanged yet.
    Idle,
    /// PUSH_PROMISE sent; we may send on this stream.
    ReservedLocal,
    /// PUSH_PROMISE received. Not supported on the server side.
    ReservedRemote,
    /// Both peers may send frames.
    Open,
    /// We sent END_STREAM; the peer may still send.
    HalfClosedLocal,
    /// The peer sent END_STREAM; we may still send.
    HalfClosedRemote,
    /// Fully closed.
    Closed,
}

impl StreamState {
    /// Whether we may still emit HEADERS/DATA toward the client.
    pub fn is_writeable(&self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedRemote | StreamState::ReservedLocal
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// Apply one frame to the state machine.
///
/// `recv_end_stream` / `send_end_stream` are the stream's latched END_STREAM
/// observations, set by the caller before the transition for a frame that
/// carries the flag. Returns `false` when the frame is illegal for the
/// current state; the caller raises the protocol error. Illegal frames in
/// the half-closed states additionally force the state to `Closed`.
pub fn change_state(
    state: &mut StreamState,
    kind: FrameType,
    flags: u8,
    recv_end_stream: bool,
    send_end_stream: bool,
) -> bool {
    match *state {
        StreamState::Idle => match kind {
            FrameType::Headers | FrameType::Continuation => {
                *state = if recv_end_stream {
                    StreamState::HalfClosedRemote
                } else if send_end_stream {
                    StreamState::HalfClosedLocal
                } else {
                    StreamState::Open
                };
                true
            }
            FrameType::PushPromise => {
                *state = StreamState::ReservedLocal;
                true
            }
            _ => false,
        },

        StreamState::Open => match kind {
            FrameType::RstStream => {
                *state = StreamState::Closed;
                true
            }
            FrameType::Headers | FrameType::Data => {
                if recv_end_stream {
                    *state = StreamState::HalfClosedRemote;
                } else if send_end_stream {
                    *state = StreamState::HalfClosedLocal;
                }
                true
            }
            // An open stream may carry frames of any type.
            _ => true,
        },

        StreamState::ReservedLocal => match kind {
            FrameType::Headers | FrameType::Continuation => {
                if flags & FLAG_END_HEADERS != 0 {
                    *state = StreamState::HalfClosedRemote;
                }
                true
            }
            _ => false,
        },

        // Push from the peer is not supported.
        StreamState::ReservedRemote => false,

        StreamState::HalfClosedLocal => {
            if kind == FrameType::RstStream || recv_end_stream {
                *state = StreamState::Closed;
                true
            } else {
                *state = StreamState::Closed;
                false
            }
        }

        StreamState::HalfClosedRemote => {
            if kind == FrameType::RstStream || send_end_stream {
                *state = StreamState::Closed;
                true
            } else if matches!(kind, FrameType::Headers | FrameType::Continuation) {
                // Header frames without END_STREAM: trailers still being
                // assembled, a DATA frame with END_STREAM must follow.
                true
            } else {
                *state = StreamState::Closed;
                false
            }
        }

        StreamState::Closed => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FLAG_END_HEADERS;

    fn apply(
        state: StreamState,
        kind: FrameType,
        flags: u8,
        recv_es: bool,
        send_es: bool,
    ) -> (StreamState, bool) {
        let mut s = state;
        let ok = change_state(&mut s, kind, flags, recv_es, send_es);
        (s, ok)
    }

    #[test]
    fn idle_headers_transitions() {
        assert_eq!(
            apply(StreamState::Idle, FrameType::Headers, 0, true, false),
            (StreamState::HalfClosedRemote, true)
        );
        assert_eq!(
            apply(StreamState::Idle, FrameType::Headers, 0, false, true),
            (StreamState::HalfClosedLocal, true)
        );
        assert_eq!(
            apply(StreamState::Idle, FrameType::Headers, 0, false, false),
            (StreamState::Open, true)
        );
        // CONTINUATION follows the same three rules.
        assert_eq!(
            apply(StreamState::Idle, FrameType::Continuation, 0, true, false),
            (StreamState::HalfClosedRemote, true)
        );
    }

    #[test]
    fn idle_rejects_other_frames() {
        for kind in [
            FrameType::Data,
            FrameType::RstStream,
            FrameType::WindowUpdate,
            FrameType::Priority,
        ] {
            let (state, ok) = apply(StreamState::Idle, kind, 0, false, false);
            assert!(!ok, "{kind:?} must be rejected in Idle");
            assert_eq!(state, StreamState::Idle, "no mutation on reject");
        }
    }

    #[test]
    fn idle_push_promise_reserves_local() {
        assert_eq!(
            apply(StreamState::Idle, FrameType::PushPromise, 0, false, false),
            (StreamState::ReservedLocal, true)
        );
    }

    #[test]
    fn open_transitions() {
        assert_eq!(
            apply(StreamState::Open, FrameType::RstStream, 0, false, false),
            (StreamState::Closed, true)
        );
        assert_eq!(
            apply(StreamState::Open, FrameType::Data, 0, true, false),
            (StreamState::HalfClosedRemote, true)
        );
        assert_eq!(
            apply(StreamState::Open, FrameType::Headers, 0, false, true),
            (StreamState::HalfClosedLocal, true)
        );
        assert_eq!(
            apply(StreamState::Open, FrameType::Data, 0, false, false),
            (StreamState::Open, true)
        );
        // Any other frame type is accepted without a state change.
        assert_eq!(
            apply(StreamState::Open, FrameType::WindowUpdate, 0, false, false),
            (StreamState::Open, true)
        );
    }

    #[test]
    fn reserved_local_needs_end_headers() {
        assert_eq!(
            apply(
                StreamState::ReservedLocal,
                FrameType::Headers,
                FLAG_END_HEADERS,
                false,
                false
            ),
            (StreamState::HalfClosedRemote, true)
        );
        assert_eq!(
            apply(StreamState::ReservedLocal, FrameType::Headers, 0, false, false),
            (StreamState::ReservedLocal, true)
        );
        let (_, ok) = apply(StreamState::ReservedLocal, FrameType::Data, 0, false, false);
        assert!(!ok);
    }

    #[test]
    fn reserved_remote_rejects_everything() {
        for kind in [FrameType::Headers, FrameType::Data, FrameType::RstStream] {
            let (state, ok) = apply(StreamState::ReservedRemote, kind, 0, false, false);
            assert!(!ok);
            assert_eq!(state, StreamState::ReservedRemote);
        }
    }

    #[test]
    fn half_closed_local_closes() {
        assert_eq!(
            apply(
                StreamState::HalfClosedLocal,
                FrameType::RstStream,
                0,
                false,
                false
            ),
            (StreamState::Closed, true)
        );
        assert_eq!(
            apply(StreamState::HalfClosedLocal, FrameType::Data, 0, true, false),
            (StreamState::Closed, true)
        );
        // Illegal frame: closed AND rejected.
        assert_eq!(
            apply(StreamState::HalfClosedLocal, FrameType::Data, 0, false, false),
            (StreamState::Closed, false)
        );
    }

    #[test]
    fn half_closed_remote_transitions() {
        assert_eq!(
            apply(
                StreamState::HalfClosedRemote,
                FrameType::RstStream,
                0,
                false,
                false
            ),
            (StreamState::Closed, true)
        );
        assert_eq!(
            apply(StreamState::HalfClosedRemote, FrameType::Data, 0, false, true),
            (StreamState::Closed, true)
        );
        // Header frames without END_STREAM are tolerated in place.
        assert_eq!(
            apply(
                StreamState::HalfClosedRemote,
                FrameType::Headers,
                0,
                false,
                false
            ),
            (StreamState::HalfClosedRemote, true)
        );
        assert_eq!(
            apply(
                StreamState::HalfClosedRemote,
                FrameType::Continuation,
                0,
                false,
                false
            ),
            (StreamState::HalfClosedRemote, true)
        );
        // Anything else: closed AND rejected.
        assert_eq!(
            apply(
                StreamState::HalfClosedRemote,
                FrameType::WindowUpdate,
                0,
                false,
                false
            ),
            (StreamState::Closed, false)
        );
    }

    #[test]
    fn closed_accepts_everything_unchanged() {
        for kind in [
            FrameType::Headers,
            FrameType::Data,
            FrameType::RstStream,
            FrameType::WindowUpdate,
        ] {
            assert_eq!(
                apply(StreamState::Closed, kind, 0, false, false),
                (StreamState::Closed, true)
            );
        }
    }

    #[test]
    fn accepted_sequences_stay_within_the_table() {
        // Walk every accepted single-frame transition from every state and
        // verify the (state, recv, send) triple only lands on states the
        // table produces.
        let states = [
            StreamState::Idle,
            StreamState::ReservedLocal,
            StreamState::ReservedRemote,
            StreamState::Open,
            StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote,
            StreamState::Closed,
        ];
        let kinds = [
            FrameType::Data,
            FrameType::Headers,
            FrameType::Priority,
            FrameType::RstStream,
            FrameType::PushPromise,
            FrameType::WindowUpdate,
            FrameType::Continuation,
        ];
        for &start in &states {
            for &kind in &kinds {
                for flags in [0u8, FLAG_END_HEADERS] {
                    for recv_es in [false, true] {
                        for send_es in [false, true] {
                            let (next, ok) = apply(start, kind, flags, recv_es, send_es);
                            if ok {
                                assert!(
                                    states.contains(&next),
                                    "accepted transition produced unknown state {next:?}"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn writeable_states() {
        assert!(StreamState::Open.is_writeable());
        assert!(StreamState::HalfClosedRemote.is_writeable());
        assert!(StreamState::ReservedLocal.is_writeable());
        assert!(!StreamState::HalfClosedLocal.is_writeable());
        assert!(!StreamState::Closed.is_writeable());
        assert!(!StreamState::Idle.is_writeable());
    }
}
