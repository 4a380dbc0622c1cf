//! Contracts between a stream and its owning connection.
//!
//! The connection owns streams through a [`StreamTable`]; streams address
//! each other and themselves through generation-tagged [`StreamKey`]s, so a
//! stale key held by a scheduled event can never reach a recycled slot.
//! Everything a stream asks of its connection goes through [`SessionApi`].

use std::rc::Rc;
use std::time::Instant;

use portico::sched::Scheduler;

use crate::error::ErrorCode;
use crate::stream::Http2Stream;

/// Generation-tagged index into a connection's [`StreamTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub index: u32,
    pub generation: u32,
}

/// Connection-level graceful shutdown progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// No shutdown requested.
    None,
    /// Shutdown requested but the closing handshake has not started.
    NotInitiated,
    /// First GOAWAY sent.
    Initiated,
    /// Final GOAWAY sent; draining remaining streams.
    InProgress,
}

/// Services the connection provides to its streams.
///
/// Frame emission is requested, not performed: the connection owns the wire
/// and may defer DATA through its priority scheduler.
pub trait SessionApi {
    fn connection_id(&self) -> u64;

    /// Whether DATA emission goes through the priority scheduler
    /// ([`schedule_stream`](Self::schedule_stream)) instead of being
    /// immediate.
    fn priority_scheduling(&self) -> bool {
        false
    }

    /// Emit a HEADERS frame derived from the stream's response header.
    fn enqueue_headers_frame(&mut self, stream: &Http2Stream);

    /// Drain the stream's write VIO through DATA frames, obeying both the
    /// stream and connection send windows.
    fn enqueue_data_frames(&mut self, stream: &Http2Stream);

    /// Emit a PUSH_PROMISE frame for `url`.
    fn enqueue_push_promise(
        &mut self,
        stream: &Http2Stream,
        url: &str,
        accept_encoding: Option<&str>,
    ) -> bool;

    /// Queue the stream into the priority scheduler; the connection calls
    /// back into the stream's write signaling when it is chosen.
    fn schedule_stream(&mut self, stream: &Http2Stream);

    /// Request a connection-level graceful shutdown.
    fn request_shutdown(&mut self, state: ShutdownState, code: ErrorCode);

    fn shutdown_state(&self) -> ShutdownState;

    /// Re-open receive capacity for the stream (read-side reenable).
    fn restart_receiving(&mut self, stream: &Http2Stream);

    /// Return a destroyed stream's slot to the table.
    fn release_stream(&mut self, key: StreamKey);
}

/// Per-dispatch context threaded through stream entry points.
pub struct StreamCx<'a> {
    pub sched: &'a mut Scheduler<StreamKey>,
    pub session: &'a mut dyn SessionApi,
    pub now: Instant,
}

struct Slot {
    stream: Option<Rc<Http2Stream>>,
    generation: u32,
}

/// Fixed-capacity stream storage with a free list for O(1) allocation.
pub struct StreamTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl StreamTable {
    pub fn new(max_streams: u32) -> Self {
        let mut slots = Vec::with_capacity(max_streams as usize);
        for _ in 0..max_streams {
            slots.push(Slot {
                stream: None,
                generation: 0,
            });
        }
        // Reverse order so pop hands out the lowest index first.
        let free: Vec<u32> = (0..max_streams).rev().collect();
        StreamTable { slots, free }
    }

    /// Allocate a slot and build the stream with its key. Returns `None`
    /// when the table is full.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(StreamKey) -> Rc<Http2Stream>,
    ) -> Option<Rc<Http2Stream>> {
        let index = self.free.pop()?;
        let key = StreamKey {
            index,
            generation: self.slots[index as usize].generation,
        };
        let stream = build(key);
        self.slots[index as usize].stream = Some(Rc::clone(&stream));
        Some(stream)
    }

    /// Look up a stream; stale keys return `None`.
    pub fn get(&self, key: StreamKey) -> Option<Rc<Http2Stream>> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.stream.clone()
    }

    /// Release a slot back to the free list. Stale keys are ignored.
    pub fn release(&mut self, key: StreamKey) -> Option<Rc<Http2Stream>> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let stream = slot.stream.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        Some(stream)
    }

    pub fn active_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn max_slots(&self) -> u32 {
        self.slots.len() as u32
    }
}
