//! Per-worker event scheduler.
//!
//! The scheduler is a passive data structure: callers enqueue events with
//! [`Scheduler::schedule_imm`] / [`Scheduler::schedule_in`] and the owning
//! run loop drains them with [`Scheduler::poll`]. Cancellation goes through
//! slot generations so a stale [`EventId`] can never cancel (or match) an
//! event that reused its slot.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use crate::metrics;

/// Event codes delivered to continuations.
///
/// The code travels with the event through scheduling, cross-thread
/// dispatch, and retry deferrals unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    /// Lifecycle bookkeeping entry (history only, never dispatched).
    None,
    /// More data is available on the read side.
    ReadReady,
    /// The read side has delivered everything it will deliver.
    ReadComplete,
    /// The write side can accept more data.
    WriteReady,
    /// The write side has consumed exactly the requested bytes.
    WriteComplete,
    /// The peer is gone; no further progress in either direction.
    Eos,
    /// Total transaction time limit exceeded.
    ActiveTimeout,
    /// No read/write progress within the inactivity limit.
    InactivityTimeout,
}

/// Handle to a scheduled event. Stale handles are harmless: cancellation
/// and identity checks are generation-guarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId {
    slot: u32,
    generation: u32,
}

/// An event popped from the scheduler, ready for dispatch.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledEvent<T> {
    pub id: EventId,
    pub target: T,
    pub code: EventCode,
    /// Caller-defined discriminator (e.g. which VIO the event refers to).
    pub cookie: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Live,
    Cancelled,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: SlotState,
}

struct TimerEntry<T> {
    due: Instant,
    seq: u64,
    event: ScheduledEvent<T>,
}

// Order by (due, seq) so equal deadlines preserve scheduling order.
impl<T> PartialEq for TimerEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl<T> Eq for TimerEntry<T> {}
impl<T> PartialOrd for TimerEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for TimerEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Single-threaded event queue for one worker.
///
/// `T` is the dispatch target (typically a generation-tagged table key).
pub struct Scheduler<T> {
    immediate: VecDeque<ScheduledEvent<T>>,
    timers: BinaryHeap<Reverse<TimerEntry<T>>>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    seq: u64,
}

impl<T: Copy> Scheduler<T> {
    pub fn new() -> Self {
        Scheduler {
            immediate: VecDeque::new(),
            timers: BinaryHeap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            seq: 0,
        }
    }

    /// Enqueue an event for the next drain pass. FIFO with respect to other
    /// immediate events.
    pub fn schedule_imm(&mut self, target: T, code: EventCode, cookie: u64) -> EventId {
        let id = self.alloc_slot();
        self.immediate.push_back(ScheduledEvent {
            id,
            target,
            code,
            cookie,
        });
        metrics::EVENTS_SCHEDULED.increment();
        id
    }

    /// Enqueue an event to fire once `delay` has elapsed from `now`.
    pub fn schedule_in(
        &mut self,
        now: Instant,
        delay: Duration,
        target: T,
        code: EventCode,
        cookie: u64,
    ) -> EventId {
        let id = self.alloc_slot();
        let seq = self.seq;
        self.seq += 1;
        self.timers.push(Reverse(TimerEntry {
            due: now + delay,
            seq,
            event: ScheduledEvent {
                id,
                target,
                code,
                cookie,
            },
        }));
        metrics::EVENTS_SCHEDULED.increment();
        id
    }

    /// Cancel a pending event. Idempotent; stale ids are ignored.
    pub fn cancel(&mut self, id: EventId) {
        let slot = &mut self.slots[id.slot as usize];
        if slot.generation == id.generation && slot.state == SlotState::Live {
            slot.state = SlotState::Cancelled;
            metrics::EVENTS_CANCELLED.increment();
        }
    }

    /// Whether `id` still refers to a pending (not fired, not cancelled) event.
    pub fn is_live(&self, id: EventId) -> bool {
        let slot = &self.slots[id.slot as usize];
        slot.generation == id.generation && slot.state == SlotState::Live
    }

    /// Pop the next due event, if any. Cancelled entries are skipped and
    /// their slots reclaimed.
    pub fn poll(&mut self, now: Instant) -> Option<ScheduledEvent<T>> {
        while let Some(ev) = self.immediate.pop_front() {
            if self.retire(ev.id) {
                metrics::EVENTS_FIRED.increment();
                return Some(ev);
            }
        }
        while let Some(Reverse(entry)) = self.timers.peek() {
            if entry.due > now {
                break;
            }
            let Reverse(entry) = self.timers.pop().unwrap();
            if self.retire(entry.event.id) {
                metrics::EVENTS_FIRED.increment();
                return Some(entry.event);
            }
        }
        None
    }

    /// Earliest pending timer deadline, for run-loop parking. Stale heap
    /// entries are discarded along the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        if !self.immediate.is_empty() {
            return None;
        }
        while let Some(Reverse(entry)) = self.timers.peek() {
            let slot = &self.slots[entry.event.id.slot as usize];
            if slot.generation == entry.event.id.generation && slot.state == SlotState::Live {
                return Some(entry.due);
            }
            let Reverse(entry) = self.timers.pop().unwrap();
            self.reclaim(entry.event.id.slot);
        }
        None
    }

    /// Number of pending (live) events.
    pub fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Live)
            .count()
    }

    fn alloc_slot(&mut self) -> EventId {
        let slot = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Free,
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.slots[slot as usize].state = SlotState::Live;
        EventId {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    /// Transition a slot out of the queue on pop. Returns true when the
    /// event is live and should be dispatched.
    fn retire(&mut self, id: EventId) -> bool {
        let slot = &mut self.slots[id.slot as usize];
        if slot.generation != id.generation {
            return false;
        }
        let live = slot.state == SlotState::Live;
        self.reclaim(id.slot);
        live
    }

    fn reclaim(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Free;
        self.free.push(idx);
    }
}

impl<T: Copy> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending-notification slot, deduplicated on the event code.
///
/// Replacement rule: scheduling the same code as the pending event reuses
/// it; a different code cancels the pending event and schedules the new
/// one. This bounds each slot to a single outstanding notification.
#[derive(Debug, Default)]
pub struct TrackedEvent {
    pending: Option<(EventId, EventCode)>,
}

impl TrackedEvent {
    /// Schedule `code` immediately, subject to the replacement rule.
    pub fn send<T: Copy>(
        &mut self,
        sched: &mut Scheduler<T>,
        target: T,
        code: EventCode,
        cookie: u64,
    ) {
        if self.replace_check(sched, code) {
            return;
        }
        let id = sched.schedule_imm(target, code, cookie);
        self.pending = Some((id, code));
    }

    /// Schedule `code` after `delay`, subject to the replacement rule.
    pub fn send_in<T: Copy>(
        &mut self,
        sched: &mut Scheduler<T>,
        now: Instant,
        delay: Duration,
        target: T,
        code: EventCode,
        cookie: u64,
    ) {
        if self.replace_check(sched, code) {
            return;
        }
        let id = sched.schedule_in(now, delay, target, code, cookie);
        self.pending = Some((id, code));
    }

    /// Returns true (keep pending) when the live pending event already
    /// carries `code`; otherwise cancels any pending event.
    fn replace_check<T: Copy>(&mut self, sched: &mut Scheduler<T>, code: EventCode) -> bool {
        if let Some((id, pending_code)) = self.pending {
            if sched.is_live(id) {
                if pending_code == code {
                    return true;
                }
                sched.cancel(id);
            }
            self.pending = None;
        }
        false
    }

    /// Whether `id` is this slot's pending event.
    pub fn matches(&self, id: EventId) -> bool {
        matches!(self.pending, Some((pending, _)) if pending == id)
    }

    /// Clear the slot if `id` matches (called when the event fires).
    pub fn acknowledge(&mut self, id: EventId) -> bool {
        if self.matches(id) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Cancel and clear any pending event.
    pub fn cancel<T: Copy>(&mut self, sched: &mut Scheduler<T>) {
        if let Some((id, _)) = self.pending.take() {
            sched.cancel(id);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
