//! Shared test fixtures: a plain-text header decoder, a recording session,
//! a recording driver, and a single-worker dispatch harness.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Instant;

use portico::sched::{EventCode, Scheduler};
use portico_h2::error::ErrorCode;
use portico_h2::headers::{HeaderDecoder, HeaderField};
use portico_h2::session::{SessionApi, ShutdownState, StreamCx, StreamKey, StreamTable};
use portico_h2::stream::{Http2Stream, TransactionDriver};
use portico_h2::vio::{VioHandle, VioSide};

/// Test stand-in for the HPACK decoder: one `name\tvalue\n` line per field.
pub struct PlainDecoder;

impl HeaderDecoder for PlainDecoder {
    fn decode(
        &mut self,
        block: &[u8],
        _max_table_size: u32,
        _trailing: bool,
    ) -> Result<Vec<HeaderField>, ErrorCode> {
        let text = std::str::from_utf8(block).map_err(|_| ErrorCode::CompressionError)?;
        let mut fields = Vec::new();
        for line in text.split('\n').filter(|l| !l.is_empty()) {
            let (name, value) = line.split_once('\t').ok_or(ErrorCode::CompressionError)?;
            fields.push(HeaderField::new(name.as_bytes(), value.as_bytes()));
        }
        Ok(fields)
    }
}

/// Encode fields in the [`PlainDecoder`] wire format.
pub fn encode_headers(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in fields {
        out.extend_from_slice(name.as_bytes());
        out.push(b'\t');
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out
}

pub fn request_headers() -> Vec<u8> {
    encode_headers(&[
        (":method", "GET"),
        (":scheme", "https"),
        (":authority", "example.com"),
        (":path", "/"),
        ("accept", "*/*"),
    ])
}

/// Recording [`SessionApi`] implementation. DATA emission drains the
/// stream's response reader against the stream send window, the way the
/// connection's frame writer would.
pub struct MockSession {
    pub table: Rc<RefCell<StreamTable>>,
    pub headers_frames: usize,
    pub data_frame_calls: usize,
    pub sent_body: Vec<u8>,
    pub end_stream_sent: bool,
    pub shutdown: ShutdownState,
    pub shutdown_requests: Vec<(ShutdownState, ErrorCode)>,
    pub scheduled_streams: usize,
    pub restarted_receiving: usize,
    pub released: Vec<StreamKey>,
    pub priority: bool,
}

impl MockSession {
    pub fn new(table: Rc<RefCell<StreamTable>>) -> Self {
        MockSession {
            table,
            headers_frames: 0,
            data_frame_calls: 0,
            sent_body: Vec::new(),
            end_stream_sent: false,
            shutdown: ShutdownState::None,
            shutdown_requests: Vec::new(),
            scheduled_streams: 0,
            restarted_receiving: 0,
            released: Vec::new(),
            priority: false,
        }
    }
}

impl SessionApi for MockSession {
    fn connection_id(&self) -> u64 {
        1
    }

    fn priority_scheduling(&self) -> bool {
        self.priority
    }

    fn enqueue_headers_frame(&mut self, stream: &Http2Stream) {
        assert!(
            stream.response_header().is_some() || self.headers_frames > 0,
            "HEADERS requested without a parsed response head"
        );
        self.headers_frames += 1;
    }

    fn enqueue_data_frames(&mut self, stream: &Http2Stream) {
        self.data_frame_calls += 1;
        if let Some(reader) = stream.response_data_reader() {
            let window = stream.server_rwnd().max(0) as usize;
            let avail = reader.borrow().read_avail();
            let n = avail.min(window);
            if n > 0 {
                let bytes = reader.borrow_mut().take(n);
                stream.decrement_server_rwnd(n as u64);
                stream.advance_write_vio(n as u64);
                stream.add_bytes_sent(n as u64);
                self.sent_body.extend_from_slice(&bytes);
            }
        }
        // Terminal frame: everything written, or the stream is going away.
        if !self.end_stream_sent
            && ((stream.write_vio_nbytes() > 0 && stream.write_vio_ntodo() == 0)
                || stream.is_closed())
        {
            self.end_stream_sent = true;
            stream.latch_send_end_stream();
        }
    }

    fn enqueue_push_promise(
        &mut self,
        _stream: &Http2Stream,
        _url: &str,
        _accept_encoding: Option<&str>,
    ) -> bool {
        true
    }

    fn schedule_stream(&mut self, _stream: &Http2Stream) {
        self.scheduled_streams += 1;
    }

    fn request_shutdown(&mut self, state: ShutdownState, code: ErrorCode) {
        self.shutdown_requests.push((state, code));
        self.shutdown = state;
    }

    fn shutdown_state(&self) -> ShutdownState {
        self.shutdown
    }

    fn restart_receiving(&mut self, _stream: &Http2Stream) {
        self.restarted_receiving += 1;
    }

    fn release_stream(&mut self, key: StreamKey) {
        self.released.push(key);
        self.table.borrow_mut().release(key);
    }
}

/// Recording [`TransactionDriver`]. Optionally closes the stream from
/// inside its own WRITE_COMPLETE callback to exercise reentrant teardown.
pub struct MockDriver {
    pub events: Vec<(EventCode, VioSide)>,
    pub stream: Option<Weak<Http2Stream>>,
    pub close_on_write_complete: bool,
    /// Reenable the read VIO from inside the first READ_READY callback,
    /// forcing a contended delivery.
    pub reenable_on_read_ready: bool,
    /// `Http2Stream::is_destroyed` observed inside the callback.
    pub destroyed_during_callback: bool,
}

impl MockDriver {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(MockDriver {
            events: Vec::new(),
            stream: None,
            close_on_write_complete: false,
            reenable_on_read_ready: false,
            destroyed_during_callback: false,
        }))
    }

    pub fn codes(&self) -> Vec<EventCode> {
        self.events.iter().map(|(code, _)| *code).collect()
    }
}

impl TransactionDriver for MockDriver {
    fn handle_event(&mut self, cx: &mut StreamCx<'_>, event: EventCode, vio: VioHandle) {
        self.events.push((event, vio.side));
        if self.close_on_write_complete
            && event == EventCode::WriteComplete
            && let Some(stream) = self.stream.as_ref().and_then(Weak::upgrade)
        {
            stream.do_io_close(cx);
            stream.transaction_done(cx);
            self.destroyed_during_callback = stream.is_destroyed();
        }
        if self.reenable_on_read_ready
            && event == EventCode::ReadReady
            && let Some(stream) = self.stream.as_ref().and_then(Weak::upgrade)
        {
            self.reenable_on_read_ready = false;
            // Our own callback cell is still borrowed: the nested delivery
            // must be deferred, not re-entered.
            stream.reenable(
                cx,
                VioHandle {
                    side: VioSide::Read,
                },
            );
        }
    }
}

/// Single-worker dispatch harness: a scheduler, a mock session, and the
/// stream table they share.
pub struct Harness {
    pub sched: Scheduler<StreamKey>,
    pub session: MockSession,
    pub table: Rc<RefCell<StreamTable>>,
    pub now: Instant,
}

impl Harness {
    pub fn new(max_streams: u32) -> Self {
        let table = Rc::new(RefCell::new(StreamTable::new(max_streams)));
        Harness {
            sched: Scheduler::new(),
            session: MockSession::new(Rc::clone(&table)),
            table,
            now: Instant::now(),
        }
    }

    pub fn with_cx<R>(&mut self, f: impl FnOnce(&mut StreamCx<'_>) -> R) -> R {
        let mut cx = StreamCx {
            sched: &mut self.sched,
            session: &mut self.session,
            now: self.now,
        };
        f(&mut cx)
    }

    /// Drain the scheduler, dispatching every due event to its stream.
    pub fn run_events(&mut self) {
        loop {
            let Some(ev) = self.sched.poll(self.now) else {
                break;
            };
            let stream = self.table.borrow().get(ev.target);
            if let Some(stream) = stream {
                let mut cx = StreamCx {
                    sched: &mut self.sched,
                    session: &mut self.session,
                    now: self.now,
                };
                stream.main_event_handler(&mut cx, ev);
            }
        }
    }
}
