//! portico — cooperative, thread-affine event runtime.
//!
//! portico schedules work the way a proxy's transaction cores need it: every
//! target (a stream, a session) is owned by one worker thread, all mutation
//! happens on that worker, and handlers never block — they finish, defer to
//! the scheduler through a tracked event, or re-schedule themselves with a
//! small delay.
//!
//! ```text
//!   other threads                 owner worker
//!        |                             |
//!   RemoteHandle ──► inbox ──► Scheduler ──► dispatch(target, code)
//!        |        (capacity-one slot        |
//!        |         per target)              └─ schedule_imm / schedule_in
//! ```
//!
//! Key pieces:
//! - [`Scheduler`] — per-worker event queue with generation-guarded
//!   cancellation.
//! - [`TrackedEvent`] — one pending notification per slot, deduplicated on
//!   the event code.
//! - [`WorkerLoop`] / [`WorkerPool`] — run loops and thread management.
//! - [`CrossThreadSlot`] — capacity-one redispatch flag per target.
//! - [`ActivityTimeout`] — independent active / inactivity deadlines.
//! - [`HistoryRing`] — bounded post-mortem record of handler entries.

pub mod config;
pub mod error;
pub mod history;
pub(crate) mod metrics;
pub mod sched;
pub mod timeout;
pub mod worker;

/// Runtime configuration.
pub use config::Config;
/// Runtime errors.
pub use error::Error;
/// Post-mortem history ring.
pub use history::{HistoryEntry, HistoryRing};
/// Event codes delivered to continuations.
pub use sched::EventCode;
/// Handle to a scheduled event.
pub use sched::EventId;
/// An event popped from the scheduler.
pub use sched::ScheduledEvent;
/// Per-worker event queue.
pub use sched::Scheduler;
/// Deduplicated pending-notification slot.
pub use sched::TrackedEvent;
/// Active / inactivity timeout tracking.
pub use timeout::ActivityTimeout;
/// Capacity-one cross-thread redispatch flag.
pub use worker::CrossThreadSlot;
/// Cross-thread inbox messages.
pub use worker::Inbound;
/// Handle for enqueueing work onto a specific worker.
pub use worker::RemoteHandle;
/// Shutdown trigger for a launched pool.
pub use worker::ShutdownHandle;
/// Identifier of a worker thread.
pub use worker::WorkerId;
/// Run loop for one worker.
pub use worker::WorkerLoop;
/// Worker thread management.
pub use worker::WorkerPool;
/// Bind the calling thread to a worker id.
pub use worker::bind_current_worker;
/// Worker the calling thread belongs to.
pub use worker::current_worker;
