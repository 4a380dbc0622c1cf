//! A single HTTP/2 request/response exchange on a client-facing connection.
//!
//! `Http2Stream` sits between the connection's frame demultiplexer and an
//! HTTP/1.x-style transaction driver. Inbound HEADERS/DATA become bytes in
//! the driver's read VIO; bytes the driver writes are parsed as an HTTP/1
//! response and surrendered to the connection for HEADERS/DATA framing.
//!
//! # Lifecycle
//!
//! Destruction is never immediate. Entry points bump `reentrancy`, and
//! teardown only latches `closed` / `terminate_stream`; the outermost
//! handler observes both with `reentrancy == 0` and releases the stream's
//! table slot. Signaling a write event may cause the connection to release
//! the stream — callers must not touch it after such a signal returns.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::BytesMut;
use tracing::{debug, warn};

use portico::history::HistoryRing;
use portico::sched::{EventCode, ScheduledEvent, TrackedEvent};
use portico::timeout::ActivityTimeout;
use portico::worker::{CrossThreadSlot, RemoteHandle, WorkerId, current_worker};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Http2Params;
use crate::error::{ErrorCode, StreamError};
use crate::flowcontrol::StreamWindows;
use crate::frame::{FrameType, StreamFrame};
use crate::headers::{
    HeaderDecoder, HeaderField, Http1Request, ParseStatus, ResponseHead, ResponseParser,
    convert_from_2_to_1_1, convert_trailers,
};
use crate::metrics;
use crate::milestone::{Milestone, MilestoneLog};
use crate::session::{ShutdownState, StreamCx, StreamKey};
use crate::state::{StreamState, change_state};
use crate::vio::{ByteRing, DriverRef, RingRef, UNBOUNDED, Vio, VioHandle, VioOp, VioSide};

/// Cookie values carried by scheduled events: which VIO the event refers
/// to, if any.
pub const COOKIE_NONE: u64 = 0;
pub const COOKIE_READ_VIO: u64 = 1;
pub const COOKIE_WRITE_VIO: u64 = 2;

/// Callback surface of the upstream transaction driver.
///
/// Delivery uses `try_borrow_mut`: a busy driver defers the event by
/// `retry_delay` instead of blocking the worker.
pub trait TransactionDriver {
    fn handle_event(&mut self, cx: &mut StreamCx<'_>, event: EventCode, vio: VioHandle);
}

#[derive(Default)]
struct EventSlots {
    cross_thread: TrackedEvent,
    read: TrackedEvent,
    write: TrackedEvent,
    read_vio_retry: TrackedEvent,
    write_vio_retry: TrackedEvent,
}

struct Inner {
    windows: StreamWindows,
    /// HEADERS/CONTINUATION payload pending HPACK decode.
    header_blocks: BytesMut,
    /// Decoded request header list, waiting for HTTP/1.1 conversion.
    decoded_headers: Option<Vec<HeaderField>>,
    request_header: Option<Http1Request>,
    trailers: Option<Vec<(String, String)>>,
    response_parser: ResponseParser,
    response_header: Option<ResponseHead>,
    /// Default read-side sink, shared with the driver through the read VIO.
    request_buffer: RingRef,
    read_vio: Vio,
    write_vio: Vio,
    events: EventSlots,
}

pub struct Http2Stream {
    id: u32,
    key: StreamKey,
    owner: WorkerId,
    remote: Option<RemoteHandle<StreamKey>>,
    cross_thread_slot: Arc<CrossThreadSlot>,
    params: Http2Params,

    state: Cell<StreamState>,
    recv_end_stream: Cell<bool>,
    send_end_stream: Cell<bool>,
    closed: Cell<bool>,
    terminate_stream: Cell<bool>,
    destroyed: Cell<bool>,
    reentrancy: Cell<u32>,
    has_body: Cell<bool>,
    trailing_header: Cell<bool>,
    response_header_done: Cell<bool>,
    bytes_sent: Cell<u64>,

    inner: RefCell<Inner>,
    history: RefCell<HistoryRing>,
    milestones: RefCell<MilestoneLog>,
    timeout: RefCell<ActivityTimeout>,
}

impl Http2Stream {
    /// `remote` enables cross-thread reenables; pass `None` when every
    /// caller lives on the owner worker.
    pub fn new(
        id: u32,
        key: StreamKey,
        owner: WorkerId,
        remote: Option<RemoteHandle<StreamKey>>,
        params: &Http2Params,
        now: Instant,
    ) -> Rc<Self> {
        let mut milestones = MilestoneLog::new();
        milestones.mark(Milestone::Open, now);
        metrics::STREAMS_OPENED.increment();
        metrics::STREAMS_ACTIVE.increment();

        let stream = Rc::new(Http2Stream {
            id,
            key,
            owner,
            remote,
            cross_thread_slot: Arc::new(CrossThreadSlot::new()),
            params: params.clone(),
            state: Cell::new(StreamState::Idle),
            recv_end_stream: Cell::new(false),
            send_end_stream: Cell::new(false),
            closed: Cell::new(false),
            terminate_stream: Cell::new(false),
            destroyed: Cell::new(false),
            reentrancy: Cell::new(0),
            has_body: Cell::new(false),
            trailing_header: Cell::new(false),
            response_header_done: Cell::new(false),
            bytes_sent: Cell::new(0),
            milestones: RefCell::new(milestones),
            inner: RefCell::new(Inner {
                windows: StreamWindows::new(
                    params.initial_recv_window,
                    params.initial_send_window,
                    params.min_avg_window_update,
                ),
                header_blocks: BytesMut::new(),
                decoded_headers: None,
                request_header: None,
                trailers: None,
                response_parser: ResponseParser::new(),
                response_header: None,
                request_buffer: Rc::new(RefCell::new(ByteRing::new(params.buffer_block_size))),
                read_vio: Vio::default(),
                write_vio: Vio::default(),
                events: EventSlots::default(),
            }),
            history: RefCell::new(HistoryRing::new(params.history_capacity)),
            timeout: RefCell::new(ActivityTimeout::new(now)),
        });
        stream.remember(EventCode::None);
        stream
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn recv_end_stream(&self) -> bool {
        self.recv_end_stream.get()
    }

    pub fn send_end_stream(&self) -> bool {
        self.send_end_stream.get()
    }

    /// Latched when request headers completed without END_STREAM.
    pub fn has_request_body(&self) -> bool {
        self.has_body.get()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.get()
    }

    /// Credit the outbound byte count (connection side, after framing).
    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.set(self.bytes_sent.get() + n);
    }

    /// Parsed response head, once the driver has produced it.
    pub fn response_header(&self) -> Option<ResponseHead> {
        self.inner.borrow().response_header.clone()
    }

    /// Trailer fields decoded from a trailing header block.
    pub fn trailers(&self) -> Option<Vec<(String, String)>> {
        self.inner.borrow().trailers.clone()
    }

    /// The driver-bound response byte pipe (drained for DATA framing).
    pub fn response_data_reader(&self) -> Option<RingRef> {
        self.inner.borrow().write_vio.buffer.clone()
    }

    pub fn read_vio_nbytes(&self) -> i64 {
        self.inner.borrow().read_vio.nbytes
    }

    pub fn read_vio_ntodo(&self) -> i64 {
        self.inner.borrow().read_vio.ntodo()
    }

    pub fn write_vio_nbytes(&self) -> i64 {
        self.inner.borrow().write_vio.nbytes
    }

    pub fn write_vio_ntodo(&self) -> i64 {
        self.inner.borrow().write_vio.ntodo()
    }

    /// Driver-side progress: `n` request bytes were consumed from the read
    /// VIO's buffer.
    pub fn advance_read_vio(&self, n: u64) {
        self.inner.borrow_mut().read_vio.ndone += n as i64;
    }

    /// Connection-side progress: `n` response bytes were framed out of the
    /// write VIO's reader.
    pub fn advance_write_vio(&self, n: u64) {
        self.inner.borrow_mut().write_vio.ndone += n as i64;
    }

    /// Bytes buffered toward the driver and not yet consumed.
    pub fn read_vio_read_avail(&self) -> usize {
        let inner = self.inner.borrow();
        match &inner.read_vio.buffer {
            Some(ring) => ring.borrow().read_avail(),
            None => inner.request_buffer.borrow().read_avail(),
        }
    }

    /// The read-side sink: the driver's buffer once installed, the
    /// stream-owned request buffer before that.
    fn request_sink(&self) -> RingRef {
        let inner = self.inner.borrow();
        match &inner.read_vio.buffer {
            Some(ring) => Rc::clone(ring),
            None => Rc::clone(&inner.request_buffer),
        }
    }

    /// Latch our END_STREAM emission (connection side, when the terminal
    /// DATA or HEADERS frame is framed) and run the state machine for it.
    pub fn latch_send_end_stream(&self) {
        self.send_end_stream.set(true);
        self.apply_state(FrameType::Data, 0);
    }

    // ── Flow control ────────────────────────────────────────────────────

    pub fn client_rwnd(&self) -> i64 {
        self.inner.borrow().windows.client_rwnd()
    }

    pub fn server_rwnd(&self) -> i64 {
        self.inner.borrow().windows.server_rwnd()
    }

    pub fn increment_client_rwnd(&self, amount: u64) -> ErrorCode {
        self.inner.borrow_mut().windows.increment_client_rwnd(amount)
    }

    pub fn decrement_client_rwnd(&self, amount: u64) -> ErrorCode {
        let code = self.inner.borrow_mut().windows.decrement_client_rwnd(amount);
        if code == ErrorCode::ProtocolError {
            metrics::PROTOCOL_ERRORS.increment();
        }
        code
    }

    pub fn increment_server_rwnd(&self, amount: u64) -> ErrorCode {
        self.inner.borrow_mut().windows.increment_server_rwnd(amount)
    }

    pub fn decrement_server_rwnd(&self, amount: u64) -> ErrorCode {
        let code = self.inner.borrow_mut().windows.decrement_server_rwnd(amount);
        if code == ErrorCode::ProtocolError {
            metrics::PROTOCOL_ERRORS.increment();
        }
        code
    }

    // ── History / milestones / timeouts ─────────────────────────────────

    #[track_caller]
    fn remember(&self, event: EventCode) {
        self.history
            .borrow_mut()
            .push(event, self.reentrancy.get());
    }

    pub fn history_len(&self) -> usize {
        self.history.borrow().len()
    }

    pub fn mark_milestone(&self, milestone: Milestone, now: Instant) {
        self.milestones.borrow_mut().mark(milestone, now);
    }

    pub fn set_active_timeout(&self, timeout: Duration, now: Instant) {
        self.timeout.borrow_mut().set_active_timeout(timeout, now);
    }

    pub fn set_inactivity_timeout(&self, timeout: Duration, now: Instant) {
        self.timeout
            .borrow_mut()
            .set_inactivity_timeout(timeout, now);
    }

    pub fn cancel_active_timeout(&self) {
        self.timeout.borrow_mut().cancel_active_timeout();
    }

    pub fn cancel_inactivity_timeout(&self) {
        self.timeout.borrow_mut().cancel_inactivity_timeout();
    }

    pub fn is_active_timeout_expired(&self, now: Instant) -> bool {
        self.timeout.borrow().is_active_timeout_expired(now)
    }

    pub fn is_inactivity_timeout_expired(&self, now: Instant) -> bool {
        self.timeout.borrow().is_inactivity_timeout_expired(now)
    }

    // ── State machine ───────────────────────────────────────────────────

    fn apply_state(&self, kind: FrameType, flags: u8) -> bool {
        let mut state = self.state.get();
        let ok = change_state(
            &mut state,
            kind,
            flags,
            self.recv_end_stream.get(),
            self.send_end_stream.get(),
        );
        self.state.set(state);
        debug!(stream = self.id, ?state, accepted = ok, "state transition");
        ok
    }

    // ── Inbound frames ──────────────────────────────────────────────────

    /// Apply one demultiplexed frame: state machine, flow control, and
    /// buffering effects. Frame legality against connection state has
    /// already been checked by the caller.
    pub fn on_frame(self: &Rc<Self>, cx: &mut StreamCx<'_>, frame: StreamFrame) -> Result<(), StreamError> {
        self.remember(EventCode::None);
        self.reentrancy.set(self.reentrancy.get() + 1);
        let result = self.handle_frame(cx, frame);
        if let Err(err) = &result {
            metrics::PROTOCOL_ERRORS.increment();
            debug!(stream = self.id, error = %err, "frame rejected");
        }
        self.reentrancy.set(self.reentrancy.get() - 1);
        self.terminate_if_possible(cx);
        result
    }

    fn handle_frame(self: &Rc<Self>, cx: &mut StreamCx<'_>, frame: StreamFrame) -> Result<(), StreamError> {
        match frame.kind {
            FrameType::Headers | FrameType::Continuation => {
                if frame.end_stream() {
                    self.recv_end_stream.set(true);
                }
                if !self.apply_state(frame.kind, frame.flags) {
                    return Err(StreamError::Protocol("header frame illegal in state"));
                }
                let mut inner = self.inner.borrow_mut();
                // A header block after the request headers is a trailer.
                if inner.decoded_headers.is_some() || inner.request_header.is_some() {
                    self.trailing_header.set(true);
                }
                inner.header_blocks.extend_from_slice(&frame.payload);
                Ok(())
            }

            FrameType::Data => {
                let len = frame.payload.len() as u64;
                // Flow control first: a failed decrement must leave the
                // state machine untouched.
                if len > 0 && self.decrement_client_rwnd(len) == ErrorCode::ProtocolError {
                    return Err(StreamError::Protocol("stream receive window underflow"));
                }
                if frame.end_stream() {
                    self.recv_end_stream.set(true);
                }
                if !self.apply_state(frame.kind, frame.flags) {
                    return Err(StreamError::Protocol("DATA illegal in state"));
                }
                if !frame.payload.is_empty() {
                    self.request_sink().borrow_mut().write(&frame.payload);
                }
                self.update_read_request(cx, true);
                Ok(())
            }

            FrameType::RstStream => {
                if !self.apply_state(frame.kind, frame.flags) {
                    return Err(StreamError::Protocol("RST_STREAM illegal in state"));
                }
                self.initiating_close(cx);
                Ok(())
            }

            FrameType::WindowUpdate => {
                let increment = frame.window_increment()?;
                if increment == 0 {
                    return Err(StreamError::Protocol("WINDOW_UPDATE of zero"));
                }
                self.increment_server_rwnd(u64::from(increment));
                self.restart_sending(cx);
                Ok(())
            }

            FrameType::PushPromise => {
                if !self.apply_state(frame.kind, frame.flags) {
                    return Err(StreamError::Protocol("PUSH_PROMISE illegal in state"));
                }
                Ok(())
            }

            // Connection-scoped frames never reach a stream; priority is
            // advisory and handled by the connection's dependency tree.
            FrameType::Priority | FrameType::Settings | FrameType::Ping | FrameType::Goaway => {
                Ok(())
            }
        }
    }

    /// Decode the accumulated header block through the external HPACK
    /// decoder. A non-`NoError` result is surfaced for connection-level
    /// handling.
    pub fn decode_header_blocks(
        &self,
        decoder: &mut dyn HeaderDecoder,
        max_table_size: u32,
        now: Instant,
    ) -> Result<(), StreamError> {
        self.mark_milestone(Milestone::StartDecodeHeaders, now);
        let trailing = self.trailing_header.get();
        let block = {
            let mut inner = self.inner.borrow_mut();
            inner.header_blocks.split().freeze()
        };
        let fields = decoder
            .decode(&block, max_table_size, trailing)
            .map_err(|code| {
                debug!(stream = self.id, code = ?code, "header decode failed");
                StreamError::Compression(code)
            })?;
        let mut inner = self.inner.borrow_mut();
        if trailing {
            inner.trailers = Some(convert_trailers(&fields)?);
        } else {
            inner.decoded_headers = Some(fields);
        }
        Ok(())
    }

    /// Convert the decoded request to HTTP/1.1, serialize it into the read
    /// sink, and prime the driver. Called once all inbound headers are in.
    pub fn send_request(self: &Rc<Self>, cx: &mut StreamCx<'_>) -> Result<(), StreamError> {
        self.remember(EventCode::None);
        self.reentrancy.set(self.reentrancy.get() + 1);
        let result = self.send_request_inner(cx);
        self.reentrancy.set(self.reentrancy.get() - 1);
        self.terminate_if_possible(cx);
        result
    }

    fn send_request_inner(self: &Rc<Self>, cx: &mut StreamCx<'_>) -> Result<(), StreamError> {
        self.mark_milestone(Milestone::StartTxn, cx.now);

        let fields = {
            let mut inner = self.inner.borrow_mut();
            inner
                .decoded_headers
                .take()
                .ok_or(StreamError::Protocol("request headers not decoded"))?
        };
        let request = convert_from_2_to_1_1(&fields)?;
        let bytes = request.to_bytes();
        self.inner.borrow_mut().request_header = Some(request);

        // Serialize block by block into the sink.
        let sink = self.request_sink();
        {
            let mut ring = sink.borrow_mut();
            let mut offset = 0;
            while offset < bytes.len() {
                if ring.write_avail() == 0 {
                    ring.add_block();
                }
                let spare = ring.spare();
                let n = spare.len().min(bytes.len() - offset);
                spare[..n].copy_from_slice(&bytes[offset..offset + n]);
                ring.fill(n);
                offset += n;
            }
        }
        if bytes.is_empty() {
            return Ok(());
        }

        // Is the driver ready to take the header?
        let driver_ready = self.inner.borrow().read_vio.nbytes > 0;
        if driver_ready {
            if self.recv_end_stream.get() {
                self.inner.borrow_mut().read_vio.nbytes = bytes.len() as i64;
                self.signal_read_event(cx, EventCode::ReadComplete);
            } else {
                // Header done but not end of stream: body frames follow.
                self.has_body.set(true);
                self.signal_read_event(cx, EventCode::ReadReady);
            }
        }
        Ok(())
    }

    // ── Driver-facing VIO contract ──────────────────────────────────────

    /// Install the read-side operation. Never fails synchronously; the VIO
    /// idles until request bytes arrive. `buf` overrides the stream-owned
    /// request buffer as the sink.
    pub fn do_io_read(&self, cont: DriverRef, nbytes: i64, buf: Option<RingRef>) -> VioHandle {
        let mut inner = self.inner.borrow_mut();
        if let Some(buf) = buf {
            inner.read_vio.buffer = Some(buf);
        } else {
            inner.read_vio.buffer = Some(Rc::clone(&inner.request_buffer));
        }
        inner.read_vio.cont = Some(cont);
        inner.read_vio.nbytes = nbytes;
        inner.read_vio.ndone = 0;
        inner.read_vio.op = VioOp::Read;
        VioHandle {
            side: VioSide::Read,
        }
    }

    /// Install the write-side operation and prime an update attempt.
    /// Returns `None` when the stream is no longer writeable toward the
    /// client.
    pub fn do_io_write(
        self: &Rc<Self>,
        cx: &mut StreamCx<'_>,
        cont: DriverRef,
        nbytes: i64,
        reader: RingRef,
    ) -> Option<VioHandle> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.write_vio.buffer = Some(reader);
            inner.write_vio.cont = Some(cont);
            inner.write_vio.nbytes = nbytes;
            inner.write_vio.ndone = 0;
            inner.write_vio.op = VioOp::Write;
        }
        if nbytes > 0 && self.state.get().is_writeable() {
            self.update_write_request(cx, false);
        } else if !self.state.get().is_writeable() {
            // Cannot start a write on a closed stream.
            return None;
        }
        Some(VioHandle {
            side: VioSide::Write,
        })
    }

    /// Driver re-entry point to request further progress on a VIO.
    pub fn reenable(self: &Rc<Self>, cx: &mut StreamCx<'_>, handle: VioHandle) {
        match handle.side {
            VioSide::Write => self.update_write_request(cx, true),
            VioSide::Read => {
                cx.session.restart_receiving(self);
                self.update_read_request(cx, true);
            }
        }
    }

    /// A handle for driver threads other than the owner: reenables are
    /// forwarded through the owner's inbox, one in flight per stream.
    pub fn remote_reenable_handle(&self) -> Option<StreamReenable> {
        self.remote.as_ref().map(|remote| StreamReenable {
            key: self.key,
            remote: remote.clone(),
            slot: Arc::clone(&self.cross_thread_slot),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Driver-initiated shutdown. Idempotent; latches `closed`, flushes any
    /// trailing END_STREAM frame, and cancels timers and pending events.
    /// Destruction waits for `transaction_done`.
    pub fn do_io_close(self: &Rc<Self>, cx: &mut StreamCx<'_>) {
        if self.closed.get() {
            return;
        }
        self.remember(EventCode::None);
        debug!(stream = self.id, "do_io_close");
        self.closed.set(true);

        if self.state.get().is_writeable() {
            // Make sure any trailing end-of-stream frames are sent.
            cx.session.enqueue_data_frames(self);
        }
        self.timeout.borrow_mut().cancel_all();
        self.clear_io_events(cx);
    }

    /// Release from the driver is the same as `do_io_close` for HTTP/2.
    pub fn release(self: &Rc<Self>, cx: &mut StreamCx<'_>) {
        self.do_io_close(cx);
    }

    /// Driver completion hook: the transaction is fully done and the driver
    /// reference is dropped. Arms destruction.
    pub fn transaction_done(self: &Rc<Self>, cx: &mut StreamCx<'_>) {
        if !self.closed.get() {
            self.do_io_close(cx);
        }
        {
            let mut inner = self.inner.borrow_mut();
            inner.read_vio.cont = None;
            inner.write_vio.cont = None;
        }
        self.terminate_stream.set(true);
        self.terminate_if_possible(cx);
    }

    /// Origin-side teardown (RST_STREAM, connection error, or session
    /// close): latch closed, cancel everything, and emit exactly one
    /// terminal signal to the driver.
    pub fn initiating_close(self: &Rc<Self>, cx: &mut StreamCx<'_>) {
        if self.closed.get() {
            return;
        }
        self.remember(EventCode::None);
        debug!(stream = self.id, "initiating_close");
        self.closed.set(true);
        self.state.set(StreamState::Closed);

        self.timeout.borrow_mut().cancel_all();
        self.clear_io_events(cx);

        // Signals rather than direct calls: a driver teardown mid-handler
        // must not free anything still on the stack.
        let mut sent_write_signal = false;
        {
            let mut inner = self.inner.borrow_mut();
            let Inner {
                write_vio, events, ..
            } = &mut *inner;
            if write_vio.cont.is_some() {
                let code = if write_vio.nbytes > 0 && write_vio.nbytes == write_vio.ndone {
                    EventCode::WriteComplete
                } else {
                    EventCode::Eos
                };
                events
                    .write
                    .send(cx.sched, self.key, code, COOKIE_WRITE_VIO);
                sent_write_signal = true;
            }
        }
        if !sent_write_signal {
            let has_read_cont = self.inner.borrow().read_vio.cont.is_some();
            if has_read_cont {
                let mut inner = self.inner.borrow_mut();
                let Inner { events, .. } = &mut *inner;
                events
                    .read
                    .send(cx.sched, self.key, EventCode::Eos, COOKIE_READ_VIO);
            } else {
                // Transaction already gone or never started.
                self.terminate_stream.set(true);
                self.terminate_if_possible(cx);
            }
        }
    }

    /// Destroy once the termination request is latched and no handler is
    /// on the stack.
    pub fn terminate_if_possible(self: &Rc<Self>, cx: &mut StreamCx<'_>) {
        if self.terminate_stream.get() && self.reentrancy.get() == 0 && !self.destroyed.get() {
            self.remember(EventCode::None);
            self.destroy(cx);
        }
    }

    fn destroy(self: &Rc<Self>, cx: &mut StreamCx<'_>) {
        assert!(self.closed.get(), "destroying a stream that was not closed");
        assert_eq!(self.reentrancy.get(), 0, "destroying with handlers on the stack");
        self.destroyed.set(true);

        debug!(
            stream = self.id,
            bytes_sent = self.bytes_sent.get(),
            "destroy stream"
        );

        {
            let mut inner = self.inner.borrow_mut();
            inner.read_vio.clear();
            inner.write_vio.clear();
            inner.request_buffer.borrow_mut().clear();
            inner.header_blocks = BytesMut::new();
        }
        self.timeout.borrow_mut().cancel_all();
        self.clear_io_events(cx);

        self.mark_milestone(Milestone::Close, cx.now);
        let milestones = self.milestones.borrow();
        let total = milestones.elapsed(Milestone::Open, Milestone::Close);
        if let (Some(threshold), Some(total)) = (self.params.slow_log_threshold, total)
            && total >= threshold
        {
            metrics::SLOW_TRANSACTIONS.increment();
            warn!(
                connection = cx.session.connection_id(),
                stream = self.id,
                total_ms = total.as_millis(),
                dec_hdrs_ms = milestones.offset_ms(Milestone::StartDecodeHeaders),
                txn_ms = milestones.offset_ms(Milestone::StartTxn),
                enc_hdrs_ms = milestones.offset_ms(Milestone::StartEncodeHeaders),
                tx_hdrs_ms = milestones.offset_ms(Milestone::StartTxHeadersFrames),
                tx_data_ms = milestones.offset_ms(Milestone::StartTxDataFrames),
                "slow HTTP/2 stream"
            );
        }
        drop(milestones);

        metrics::STREAMS_CLOSED.increment();
        metrics::STREAMS_ACTIVE.decrement();
        cx.session.release_stream(self.key);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    fn clear_io_events(&self, cx: &mut StreamCx<'_>) {
        let mut inner = self.inner.borrow_mut();
        let events = &mut inner.events;
        events.cross_thread.cancel(cx.sched);
        events.read.cancel(cx.sched);
        events.write.cancel(cx.sched);
        events.read_vio_retry.cancel(cx.sched);
        events.write_vio_retry.cancel(cx.sched);
    }

    // ── Event handling ──────────────────────────────────────────────────

    /// Entry point for every scheduled event addressed to this stream.
    pub fn main_event_handler(self: &Rc<Self>, cx: &mut StreamCx<'_>, ev: ScheduledEvent<StreamKey>) {
        self.remember(ev.code);
        if !self.switch_thread_if_needed(ev) {
            return;
        }

        self.reentrancy.set(self.reentrancy.get() + 1);

        // Deferred VIO signals deliver directly and unwind.
        let retry_side = {
            let mut inner = self.inner.borrow_mut();
            if inner.events.read_vio_retry.acknowledge(ev.id) {
                Some(VioSide::Read)
            } else if inner.events.write_vio_retry.acknowledge(ev.id) {
                Some(VioSide::Write)
            } else {
                if inner.events.cross_thread.acknowledge(ev.id) {
                    self.cross_thread_slot.disarm();
                } else if !inner.events.read.acknowledge(ev.id)
                    && !inner.events.write.acknowledge(ev.id)
                    && self.cross_thread_slot.is_armed()
                {
                    // A forward from another thread arrives as an untracked
                    // event; releasing the slot re-opens the channel.
                    self.cross_thread_slot.disarm();
                }
                None
            }
        };
        if let Some(side) = retry_side {
            match side {
                VioSide::Read => self.signal_read_event(cx, ev.code),
                VioSide::Write => self.signal_write_event_code(cx, ev.code),
            }
            self.reentrancy.set(self.reentrancy.get() - 1);
            self.terminate_if_possible(cx);
            return;
        }

        match ev.code {
            EventCode::ActiveTimeout | EventCode::InactivityTimeout => {
                let (write_out, read_out) = {
                    let inner = self.inner.borrow();
                    (
                        inner.write_vio.cont.is_some() && inner.write_vio.ntodo() > 0,
                        inner.read_vio.cont.is_some() && inner.read_vio.ntodo() > 0,
                    )
                };
                // Writer preferred when both sides have outstanding work.
                if write_out {
                    self.signal_write_event_code(cx, ev.code);
                } else if read_out {
                    self.signal_read_event(cx, ev.code);
                }
            }
            EventCode::WriteReady | EventCode::WriteComplete => {
                self.timeout.borrow_mut().update_inactivity(cx.now);
                if ev.cookie == COOKIE_WRITE_VIO {
                    self.signal_write_event_code(cx, ev.code);
                } else {
                    self.update_write_request(cx, true);
                }
            }
            EventCode::ReadReady | EventCode::ReadComplete => {
                self.timeout.borrow_mut().update_inactivity(cx.now);
                if ev.cookie == COOKIE_READ_VIO {
                    self.signal_read_event(cx, ev.code);
                } else {
                    self.update_read_request(cx, true);
                }
            }
            EventCode::Eos => {
                if ev.cookie == COOKIE_READ_VIO {
                    self.deliver(cx, VioSide::Read, EventCode::Eos);
                } else if ev.cookie == COOKIE_WRITE_VIO {
                    self.deliver(cx, VioSide::Write, EventCode::Eos);
                }
            }
            EventCode::None => {}
        }

        self.reentrancy.set(self.reentrancy.get() - 1);
        // Clean up if the terminate flag is set and we are at the bottom of
        // the handler stack.
        self.terminate_if_possible(cx);
    }

    /// Re-dispatch onto the owner worker when entered from a foreign one.
    /// Returns false when the event was forwarded (or dropped because a
    /// forward is already in flight).
    fn switch_thread_if_needed(&self, ev: ScheduledEvent<StreamKey>) -> bool {
        match (current_worker(), &self.remote) {
            (Some(worker), Some(remote)) if worker != self.owner => {
                if self.cross_thread_slot.try_arm()
                    && remote.dispatch(self.key, ev.code, ev.cookie).is_err()
                {
                    self.cross_thread_slot.disarm();
                }
                false
            }
            _ => true,
        }
    }

    // ── Read side ───────────────────────────────────────────────────────

    /// Propagate buffered request bytes to the driver. `call_update` means
    /// the callback may be invoked in place; otherwise the notification is
    /// deferred through the tracked read event.
    pub fn update_read_request(self: &Rc<Self>, cx: &mut StreamCx<'_>, call_update: bool) {
        if self.closed.get() {
            return;
        }
        let (installed, nbytes) = {
            let inner = self.inner.borrow();
            (inner.read_vio.cont.is_some(), inner.read_vio.nbytes)
        };
        if !installed || nbytes == 0 {
            return;
        }

        let send_event = {
            let inner = self.inner.borrow();
            if inner.read_vio.ntodo() == 0
                || (self.recv_end_stream.get() && inner.read_vio.nbytes != UNBOUNDED)
            {
                EventCode::ReadComplete
            } else {
                EventCode::ReadReady
            }
        };

        // Only signal when there is new data (or a completion to report).
        let read_avail = self.read_vio_read_avail();
        if read_avail > 0 || send_event == EventCode::ReadComplete {
            if call_update {
                self.timeout.borrow_mut().update_inactivity(cx.now);
                self.signal_read_event(cx, send_event);
            } else {
                // Still setting up; let the dust settle first.
                let mut inner = self.inner.borrow_mut();
                let Inner { events, .. } = &mut *inner;
                events
                    .read
                    .send(cx.sched, self.key, send_event, COOKIE_READ_VIO);
            }
        }
    }

    fn signal_read_event(self: &Rc<Self>, cx: &mut StreamCx<'_>, code: EventCode) {
        let installed = {
            let inner = self.inner.borrow();
            inner.read_vio.cont.is_some() && inner.read_vio.op == VioOp::Read
        };
        if installed {
            self.deliver(cx, VioSide::Read, code);
        }
    }

    // ── Write side ──────────────────────────────────────────────────────

    /// Consume driver-produced response bytes: run the response parser
    /// until the header completes, then surrender body bytes for DATA
    /// framing.
    pub fn update_write_request(self: &Rc<Self>, cx: &mut StreamCx<'_>, call_update: bool) {
        if !self.state.get().is_writeable() || self.closed.get() {
            return;
        }
        let reader = {
            let inner = self.inner.borrow();
            if inner.write_vio.cont.is_none() {
                return;
            }
            match &inner.write_vio.buffer {
                Some(ring) => Rc::clone(ring),
                None => return,
            }
        };
        {
            let inner = self.inner.borrow();
            if inner.write_vio.ntodo() == 0 || reader.borrow().read_avail() == 0 {
                return;
            }
        }

        loop {
            if self.response_header_done.get() {
                self.mark_milestone(Milestone::StartTxDataFrames, cx.now);
                self.send_response_body(cx, call_update);
                return;
            }

            // Still parsing the response header.
            let done = match self.parse_response_bytes(&reader) {
                Ok(done) => done,
                Err(err) => {
                    warn!(stream = self.id, error = %err, "malformed driver response");
                    return;
                }
            };
            if !done {
                // Let it ride for next time.
                return;
            }
            self.response_header_done.set(true);

            let head = self.inner.borrow().response_parser.head().clone();
            // Schedule session shutdown if the driver asked for it.
            if head.connection_close() && cx.session.shutdown_state() == ShutdownState::None {
                cx.session
                    .request_shutdown(ShutdownState::NotInitiated, ErrorCode::NoError);
            }
            self.inner.borrow_mut().response_header = Some(head.clone());

            self.mark_milestone(Milestone::StartEncodeHeaders, cx.now);
            cx.session.enqueue_headers_frame(self);
            self.mark_milestone(Milestone::StartTxHeadersFrames, cx.now);

            // Roll the parser back to read the final response after an
            // informational one. Remaining buffered bytes belong to that
            // final head, so the loop re-enters the parser, never DATA
            // emission.
            if head.expect_final_response() {
                self.response_header_done.set(false);
                let mut inner = self.inner.borrow_mut();
                inner.response_parser.reset();
                inner.response_header = None;
            }

            self.signal_write_event(cx, call_update);

            if reader.borrow().read_avail() == 0 {
                return;
            }
        }
    }

    /// Run the response parser over the reader. Returns whether the head
    /// completed; `write_vio.ndone` advances by the bytes consumed.
    fn parse_response_bytes(&self, reader: &RingRef) -> Result<bool, StreamError> {
        loop {
            let chunk = reader.borrow().peek().to_vec();
            if chunk.is_empty() {
                return Ok(false);
            }
            let (consumed, status) = {
                let mut inner = self.inner.borrow_mut();
                inner.response_parser.parse(&chunk)?
            };
            reader.borrow_mut().consume(consumed);
            self.inner.borrow_mut().write_vio.ndone += consumed as i64;
            match status {
                ParseStatus::Complete => return Ok(true),
                ParseStatus::Partial => {
                    if consumed == 0 {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Hand buffered response bytes to the connection for DATA framing —
    /// immediately, or through the priority scheduler when enabled.
    fn send_response_body(self: &Rc<Self>, cx: &mut StreamCx<'_>, call_update: bool) {
        self.timeout.borrow_mut().update_inactivity(cx.now);
        if cx.session.priority_scheduling() {
            cx.session.schedule_stream(self);
            // The connection signals the write VIO when the stream is
            // chosen.
        } else {
            cx.session.enqueue_data_frames(self);
            self.signal_write_event(cx, call_update);
            // The connection may have released this stream inside the
            // signal. No stream state may be touched past this point.
        }
    }

    /// Resume DATA emission after the peer opened the send window.
    pub fn restart_sending(self: &Rc<Self>, cx: &mut StreamCx<'_>) {
        if !self.response_header_done.get() {
            return;
        }
        {
            let inner = self.inner.borrow();
            let Some(reader) = &inner.write_vio.buffer else {
                return;
            };
            if reader.borrow().read_avail() == 0 {
                return;
            }
            if inner.write_vio.cont.is_some() && inner.write_vio.ntodo() == 0 {
                return;
            }
        }
        self.send_response_body(cx, true);
    }

    /// Signal the driver's write callback with READY or COMPLETE depending
    /// on VIO progress.
    fn signal_write_event(self: &Rc<Self>, cx: &mut StreamCx<'_>, call_update: bool) {
        let code = {
            let inner = self.inner.borrow();
            if inner.write_vio.cont.is_none() || inner.write_vio.op == VioOp::None {
                return;
            }
            if inner.write_vio.nbytes == 0 {
                return;
            }
            if inner.write_vio.ntodo() == 0 {
                EventCode::WriteComplete
            } else {
                EventCode::WriteReady
            }
        };
        if call_update {
            // Coming from reenable: safe to call the handler in place.
            self.deliver(cx, VioSide::Write, code);
        } else {
            // Called from do_io_write; state may still be settling.
            let mut inner = self.inner.borrow_mut();
            let Inner { events, .. } = &mut *inner;
            events
                .write
                .send(cx.sched, self.key, code, COOKIE_WRITE_VIO);
        }
    }

    fn signal_write_event_code(self: &Rc<Self>, cx: &mut StreamCx<'_>, code: EventCode) {
        let ok = {
            let inner = self.inner.borrow();
            inner.write_vio.cont.is_some()
                && inner.write_vio.op != VioOp::None
                && inner.write_vio.nbytes != 0
        };
        if ok {
            self.deliver(cx, VioSide::Write, code);
        }
    }

    /// Deliver an event to the driver callback of one side. Contention on
    /// the callback defers the delivery by `retry_delay` instead of
    /// blocking.
    fn deliver(self: &Rc<Self>, cx: &mut StreamCx<'_>, side: VioSide, code: EventCode) {
        let cont = {
            let inner = self.inner.borrow();
            let vio = match side {
                VioSide::Read => &inner.read_vio,
                VioSide::Write => &inner.write_vio,
            };
            match &vio.cont {
                Some(cont) => Rc::clone(cont),
                None => return,
            }
        };
        match cont.try_borrow_mut() {
            Ok(mut driver) => {
                self.timeout.borrow_mut().update_inactivity(cx.now);
                driver.handle_event(cx, code, VioHandle { side });
            }
            Err(_) => {
                metrics::CALLBACK_DEFERRALS.increment();
                let retry_delay = self.params.retry_delay;
                let mut inner = self.inner.borrow_mut();
                let Inner { events, .. } = &mut *inner;
                let (slot, cookie) = match side {
                    VioSide::Read => (&mut events.read_vio_retry, COOKIE_READ_VIO),
                    VioSide::Write => (&mut events.write_vio_retry, COOKIE_WRITE_VIO),
                };
                slot.send_in(cx.sched, cx.now, retry_delay, self.key, code, cookie);
            }
        }
    }

    /// Ask the connection to emit a PUSH_PROMISE for `url`.
    pub fn push_promise(
        self: &Rc<Self>,
        cx: &mut StreamCx<'_>,
        url: &str,
        accept_encoding: Option<&str>,
    ) -> bool {
        cx.session.enqueue_push_promise(self, url, accept_encoding)
    }
}

/// Sendable reenable handle for driver threads other than the owner.
///
/// Forwards through the owner worker's inbox; the per-stream
/// [`CrossThreadSlot`] keeps at most one forward in flight.
pub struct StreamReenable {
    key: StreamKey,
    remote: RemoteHandle<StreamKey>,
    slot: Arc<CrossThreadSlot>,
}

impl StreamReenable {
    pub fn reenable(&self, handle: VioHandle) -> Result<(), portico::Error> {
        if !self.slot.try_arm() {
            // One forward already pending; it will observe the new state.
            return Ok(());
        }
        let code = match handle.side {
            VioSide::Read => EventCode::ReadReady,
            VioSide::Write => EventCode::WriteReady,
        };
        match self.remote.dispatch(self.key, code, COOKIE_NONE) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.slot.disarm();
                Err(err)
            }
        }
    }
}
