//! portico runtime metrics.
//!
//! Scheduler and cross-thread dispatch counters, exposed through metriken.

use metriken::{Counter, metric};

#[metric(
    name = "portico/events/scheduled",
    description = "Total events scheduled (immediate and delayed)"
)]
pub static EVENTS_SCHEDULED: Counter = Counter::new();

#[metric(name = "portico/events/fired", description = "Total events dispatched")]
pub static EVENTS_FIRED: Counter = Counter::new();

#[metric(
    name = "portico/events/cancelled",
    description = "Total events cancelled before dispatch"
)]
pub static EVENTS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "portico/cross_thread/dispatches",
    description = "Operations forwarded to their owner worker"
)]
pub static CROSS_THREAD_DISPATCHES: Counter = Counter::new();

#[metric(
    name = "portico/cross_thread/rejected",
    description = "Cross-thread forwards dropped on a full inbox"
)]
pub static INBOX_REJECTED: Counter = Counter::new();
